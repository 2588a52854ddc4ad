//! Error types for GSOD Sync
//!
//! This module defines the error taxonomy of the sync engine. Listing, fetch
//! and store errors are scoped to one year or one file and end up aggregated
//! in the run report; ledger errors are the only whole-run fatal condition.

use std::path::PathBuf;

use thiserror::Error;

/// Directory listing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListingError {
    /// The year's index could not be fetched or parsed
    #[error("Listing unavailable for {target}: {reason}")]
    ListingUnavailable { target: String, reason: String },

    /// URL construction failed
    #[error("Invalid listing URL: {url} - {error}")]
    InvalidUrl { url: String, error: String },
}

impl ListingError {
    /// Listing failure for a year directory
    pub fn year(year: i32, reason: impl Into<String>) -> Self {
        Self::ListingUnavailable {
            target: format!("year {}", year),
            reason: reason.into(),
        }
    }
}

/// Outcome of a single HTTP attempt that did not produce a complete body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Server answered with a non-success status
    #[error("HTTP {status}")]
    Status { status: u16 },

    /// Request or body read timed out
    #[error("request timed out")]
    Timeout,

    /// Connection could not be established or was reset
    #[error("connection error: {0}")]
    Connection(String),

    /// Body ended before the advertised length
    #[error("incomplete body: received {received} bytes, expected {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    /// Any other transport failure
    #[error("{0}")]
    Other(String),
}

impl AttemptError {
    /// Whether another attempt may succeed
    ///
    /// 4xx statuses are permanent except 408 and 429; everything that is not
    /// a status code is treated as a transient network condition.
    pub fn is_transient(&self) -> bool {
        match self {
            AttemptError::Status { status } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            AttemptError::Timeout
            | AttemptError::Connection(_)
            | AttemptError::Incomplete { .. } => true,
            AttemptError::Other(_) => true,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptError::Status { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            AttemptError::Timeout
        } else if error.is_connect() {
            AttemptError::Connection(error.to_string())
        } else if let Some(status) = error.status() {
            AttemptError::Status {
                status: status.as_u16(),
            }
        } else {
            AttemptError::Other(error.to_string())
        }
    }
}

/// Per-file fetch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Non-retryable HTTP status or retry budget exhausted
    #[error("Download failed for {file_id} after {attempts} attempt(s): {reason}")]
    DownloadFailed {
        file_id: String,
        status: Option<u16>,
        attempts: u32,
        reason: String,
    },

    /// Downloaded bytes are not a valid gzip stream
    #[error("Decompression failed for {file_id}: {reason}")]
    DecompressFailed { file_id: String, reason: String },

    /// Fetch abandoned because the run was cancelled
    #[error("Download of {file_id} cancelled")]
    Cancelled { file_id: String },
}

impl FetchError {
    /// Identifier of the file this error belongs to
    pub fn file_id(&self) -> &str {
        match self {
            FetchError::DownloadFailed { file_id, .. }
            | FetchError::DecompressFailed { file_id, .. }
            | FetchError::Cancelled { file_id } => file_id,
        }
    }
}

/// Destination store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Commit to the destination failed; nothing is visible at the final location
    #[error("Write to {destination} failed: {cause}")]
    WriteFailed { destination: String, cause: String },

    /// Object store request rejected
    #[error("{provider} request for {key} failed: {reason}")]
    Provider {
        provider: String,
        key: String,
        reason: String,
    },

    /// Operation not offered by this store
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },
}

/// Ingestion ledger errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Durable store cannot be read or written
    #[error("Ledger unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    /// Journal contains an unreadable record before its last line
    #[error("Ledger journal {path} corrupted at line {line}: {reason}")]
    Corrupted {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Record status change that the lifecycle does not allow
    #[error("Invalid status transition for {file_id}: {from} -> {to}")]
    InvalidTransition {
        file_id: String,
        from: String,
        to: String,
    },

    /// markCommitted on a file with no record
    #[error("No ledger record for {file_id}")]
    UnknownFile { file_id: String },
}

impl LedgerError {
    /// Whether this error means the durable store itself is gone
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            LedgerError::Unavailable { .. } | LedgerError::Corrupted { .. }
        )
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format")]
    InvalidFormat(#[from] toml::de::Error),

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}. {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// Cloud provider name not recognised or not implemented
    #[error("Unsupported cloud provider: {name}")]
    UnsupportedProvider { name: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<String> },
}

/// Top-level application error that can represent any error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Listing error
    #[error(transparent)]
    Listing(#[from] ListingError),

    /// Fetch error
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Ledger error
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic application error with context
    #[error("Application error: {message}")]
    Generic { message: String },
}

impl AppError {
    /// Create a generic application error with a message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable by simply running again later
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Listing(_) => true,
            AppError::Fetch(FetchError::DownloadFailed { status, .. }) => {
                status.map_or(true, |s| s == 429 || s >= 500)
            }
            AppError::Store(StoreError::WriteFailed { .. }) => true,

            AppError::Fetch(_)
            | AppError::Store(_)
            | AppError::Ledger(_)
            | AppError::Config(_) => false,

            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Listing(_) => "listing",
            AppError::Fetch(_) => "fetch",
            AppError::Store(_) => "store",
            AppError::Ledger(_) => "ledger",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Generic { .. } => "generic",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Listing result type alias
pub type ListingResult<T> = std::result::Result<T, ListingError>;

/// Fetch result type alias
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Store result type alias
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Ledger result type alias
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Configuration result type alias
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
