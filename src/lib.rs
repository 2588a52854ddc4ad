//! GSOD Sync Library
//!
//! Incremental and historical synchronization of NOAA GSOD daily
//! weather-station archives into a local directory or a cloud container,
//! with an idempotent ingestion ledger.

pub mod app;
pub mod cli;
pub mod config;
pub mod constants;
pub mod errors;

// Re-export commonly used types for convenience
pub use errors::{AppError, Result};
