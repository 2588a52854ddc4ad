//! Command-line interface components
//!
//! This module contains CLI-specific code for the GSOD Sync application,
//! including argument parsing, command handlers and progress display.

pub mod args;
pub mod commands;
pub mod progress;

pub use args::{
    Cli, Commands, ConfigAction, ConfigArgs, GlobalArgs, LedgerAction, LedgerArgs, ModeArgs,
    PlanArgs, SyncArgs, YearsArgs,
};
pub use commands::{
    handle_config, handle_ledger, handle_plan, handle_resources, handle_sync, handle_years,
};
pub use progress::{ProgressConfig, ProgressDisplay};
