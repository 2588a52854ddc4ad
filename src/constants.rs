//! Application constants for GSOD Sync
//!
//! This module centralizes all constants used throughout the application,
//! organized by functional domain for maintainability and clarity.

use std::time::Duration;

/// Environment variable names
pub mod env {
    /// Overrides `source.base_url`
    pub const BASE_URL: &str = "GSOD_BASE_URL";

    /// Overrides `sync.incremental_load`
    pub const INCREMENTAL_LOAD: &str = "GSOD_INCREMENTAL_LOAD";

    /// Overrides `sync.sample_file_count` (empty or "none" clears it)
    pub const SAMPLE_FILE_COUNT: &str = "GSOD_SAMPLE_FILE_COUNT";

    /// Overrides `storage.save_to_cloud`
    pub const SAVE_TO_CLOUD: &str = "GSOD_SAVE_TO_CLOUD";

    /// Overrides `storage.cloud_provider_name`
    pub const CLOUD_PROVIDER: &str = "GSOD_CLOUD_PROVIDER";

    /// Azure storage account endpoint, e.g. `https://account.blob.core.windows.net`
    pub const AZURE_ACCOUNT_URL: &str = "AZURE_STORAGE_ACCOUNT_URL";

    /// Azure shared access signature (query string, with or without leading `?`)
    pub const AZURE_SAS_TOKEN: &str = "AZURE_STORAGE_SAS_TOKEN";

    /// OAuth2 bearer token for Google Cloud Storage
    pub const GCS_ACCESS_TOKEN: &str = "GCS_ACCESS_TOKEN";
}

/// NOAA GSOD source locations
pub mod gsod {
    /// Root of the GSOD yearly directory tree
    pub const BASE_URL: &str = "https://www1.ncdc.noaa.gov/pub/data/gsod/";

    /// Station history reference file
    pub const STATION_HISTORY_URL: &str = "https://www1.ncdc.noaa.gov/pub/data/noaa/isd-history.csv";

    /// Country code reference file
    pub const COUNTRY_LIST_URL: &str = "https://www1.ncdc.noaa.gov/pub/data/noaa/country-list.txt";

    /// Local file name for the station history reference file
    pub const STATION_HISTORY_FILE_NAME: &str = "station_names.csv";

    /// Local file name for the country list reference file
    pub const COUNTRY_LIST_FILE_NAME: &str = "country.txt";

    /// Archive file name pattern: `STATION-WBAN-YEAR.op.gz`
    pub const ARCHIVE_NAME_PATTERN: &str = r"^(\d{6})-(\d{5})-(\d{4})\.op\.gz$";

    /// Year directory link pattern in the root index
    pub const YEAR_LINK_PATTERN: &str = r"^(\d{4})/?$";

    /// Compressed archive extension
    pub const ARCHIVE_EXTENSION: &str = ".gz";

    /// Earliest year published in the GSOD tree
    pub const FIRST_YEAR: i32 = 1929;
}

/// HTTP client configuration constants
pub mod http {
    use super::Duration;

    /// Default user agent for all HTTP requests
    pub const USER_AGENT: &str = "GSOD-Sync/0.1.0 (Climate Data Pipeline)";

    /// Default HTTP request timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Connection establishment timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Connection pool idle timeout
    pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

    /// Maximum idle connections per host in pool
    pub const POOL_MAX_PER_HOST: usize = 16;
}

/// Rate limiting and retry configuration
pub mod limits {
    use super::Duration;

    /// Default rate limit for NOAA requests (requests per second)
    pub const DEFAULT_RATE_LIMIT_RPS: u32 = 10;

    /// Maximum attempts per file, first attempt included
    pub const MAX_ATTEMPTS: u32 = 4;

    /// Base delay for exponential backoff
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

    /// Maximum backoff delay
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Jitter factor for randomizing delays (0.0-1.0)
    pub const BACKOFF_JITTER_FACTOR: f64 = 0.2;

    /// Upper bound for rate limiter jitter
    pub const RATE_LIMIT_JITTER: Duration = Duration::from_millis(100);
}

/// File operation constants
pub mod files {
    /// Temporary file suffix for atomic operations
    pub const TEMP_FILE_SUFFIX: &str = ".tmp";

    /// Infix for cloud staging keys
    pub const STAGING_KEY_INFIX: &str = ".staging-";

    /// Default raw output directory
    pub const RAW_OUTPUT_DIR: &str = "data/raw";

    /// Default processed output directory
    pub const PROCESSED_OUTPUT_DIR: &str = "data/processed";

    /// Default reference resource directory
    pub const RESOURCES_DIR: &str = "data/resources";

    /// Default ledger journal path
    pub const LEDGER_PATH: &str = "data/ledger/ingestion.jsonl";
}

/// Worker and concurrency configuration
pub mod workers {
    /// Default number of concurrent download workers
    pub const DEFAULT_WORKER_COUNT: usize = 8;

    /// Maximum recommended concurrent workers
    pub const MAX_WORKER_COUNT: usize = 32;

    /// Channel buffer size for progress events
    pub const PROGRESS_BUFFER_SIZE: usize = 256;
}

/// Cloud storage defaults
pub mod cloud {
    /// Default container / bucket name
    pub const DEFAULT_CONTAINER: &str = "raw";

    /// Default key prefix inside the container
    pub const DEFAULT_BLOB_PREFIX: &str = "data";

    /// Azure Blob REST API version
    pub const AZURE_API_VERSION: &str = "2021-08-06";

    /// Google Cloud Storage JSON API upload endpoint
    pub const GCS_UPLOAD_BASE_URL: &str = "https://storage.googleapis.com/upload/storage/v1/b";

    /// Google Cloud Storage JSON API object endpoint
    pub const GCS_OBJECT_BASE_URL: &str = "https://storage.googleapis.com/storage/v1/b";
}

/// Ledger journal constants
pub mod ledger {
    /// Journal lines per live record beyond which open() compacts
    pub const COMPACTION_RATIO: usize = 2;
}

/// Logging constants
pub mod logging {
    /// Default log level
    pub const DEFAULT_LOG_LEVEL: &str = "warn";
}

/// Configuration file locations
pub mod config {
    /// Project-local configuration file
    pub const LOCAL_CONFIG_FILE: &str = "gsod-sync.toml";

    /// Application directory name under the user config directory
    pub const APP_DIR_NAME: &str = "gsod-sync";

    /// Configuration file name inside the application directory
    pub const CONFIG_FILE_NAME: &str = "config.toml";
}

pub use gsod::BASE_URL as GSOD_BASE_URL;
pub use http::USER_AGENT;
pub use limits::{DEFAULT_RATE_LIMIT_RPS, MAX_ATTEMPTS};
pub use workers::DEFAULT_WORKER_COUNT;
