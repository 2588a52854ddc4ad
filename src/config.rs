//! Configuration management for GSOD Sync
//!
//! This module provides the TOML configuration file, its defaults, the
//! environment overrides and the conversion into the runtime structures the
//! engine is constructed with. Nothing here is global: the resolved
//! [`AppConfig`] is passed down explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::app::client::download::RetryPolicy;
use crate::app::coordinator::CoordinatorConfig;
use crate::app::resources::ReferenceResource;
use crate::app::store::CloudProvider;
use crate::app::ClientConfig;
use crate::constants::{
    cloud, config as config_files, env, files, gsod, http, limits, logging, workers,
};
use crate::errors::{AppError, ConfigError, ConfigResult, Result};

/// Unified application configuration for TOML serialization
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Remote GSOD source
    pub source: SourceConfigToml,
    /// Load policy
    pub sync: SyncConfigToml,
    /// Destination store settings
    pub storage: StorageConfigToml,
    /// Ingestion ledger settings
    pub ledger: LedgerConfigToml,
    /// HTTP client settings
    pub client: ClientConfigToml,
    /// Reference resource settings
    pub resources: ResourcesConfigToml,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// TOML-friendly source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfigToml {
    /// Root of the yearly directory tree
    pub base_url: String,
}

impl Default for SourceConfigToml {
    fn default() -> Self {
        Self {
            base_url: gsod::BASE_URL.to_string(),
        }
    }
}

/// TOML-friendly load policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfigToml {
    /// Incremental (delta) load instead of historical
    pub incremental_load: bool,
    /// Per-year cap on files ingested (unset = no cap)
    pub sample_file_count: Option<usize>,
    /// Number of concurrent download workers
    pub worker_count: usize,
}

impl Default for SyncConfigToml {
    fn default() -> Self {
        Self {
            incremental_load: false,
            sample_file_count: None,
            worker_count: workers::DEFAULT_WORKER_COUNT,
        }
    }
}

/// TOML-friendly storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfigToml {
    /// Commit payloads to an object store instead of the local filesystem
    pub save_to_cloud: bool,
    /// Object store provider: azure, gcp or filesystem
    pub cloud_provider_name: String,
    /// Container (bucket) for cloud objects
    pub container: String,
    /// Key prefix inside the container
    pub blob_prefix: String,
    /// Local root for decompressed archives
    pub raw_output_path: PathBuf,
    /// Local root reserved for downstream processing
    pub processed_output_path: PathBuf,
    /// Mount point of the `filesystem` provider
    pub bucket_root: Option<PathBuf>,
}

impl Default for StorageConfigToml {
    fn default() -> Self {
        Self {
            save_to_cloud: false,
            cloud_provider_name: "azure".to_string(),
            container: cloud::DEFAULT_CONTAINER.to_string(),
            blob_prefix: cloud::DEFAULT_BLOB_PREFIX.to_string(),
            raw_output_path: PathBuf::from(files::RAW_OUTPUT_DIR),
            processed_output_path: PathBuf::from(files::PROCESSED_OUTPUT_DIR),
            bucket_root: None,
        }
    }
}

/// TOML-friendly ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfigToml {
    /// Journal file path
    pub path: PathBuf,
    /// Compact the journal after every run
    pub compact_after_run: bool,
}

impl Default for LedgerConfigToml {
    fn default() -> Self {
        Self {
            path: PathBuf::from(files::LEDGER_PATH),
            compact_after_run: true,
        }
    }
}

/// TOML-friendly client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfigToml {
    /// Per-attempt request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Connection pool idle timeout
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per host
    pub pool_max_per_host: usize,
    /// Rate limit (requests per second)
    pub rate_limit_rps: u32,
    /// Attempts per file, first attempt included
    pub max_attempts: u32,
    /// First retry delay
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Retry delay ceiling
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
}

impl Default for ClientConfigToml {
    fn default() -> Self {
        Self {
            request_timeout: http::DEFAULT_TIMEOUT,
            connect_timeout: http::CONNECT_TIMEOUT,
            pool_idle_timeout: http::POOL_IDLE_TIMEOUT,
            pool_max_per_host: http::POOL_MAX_PER_HOST,
            rate_limit_rps: limits::DEFAULT_RATE_LIMIT_RPS,
            max_attempts: limits::MAX_ATTEMPTS,
            retry_base_delay: limits::RETRY_BASE_DELAY,
            retry_max_delay: limits::RETRY_MAX_DELAY,
        }
    }
}

/// TOML-friendly reference resource configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourcesConfigToml {
    /// Station history CSV
    pub station_history_url: String,
    /// Country list
    pub country_list_url: String,
    /// Local directory the resources are written to
    pub output_dir: PathBuf,
}

impl Default for ResourcesConfigToml {
    fn default() -> Self {
        Self {
            station_history_url: gsod::STATION_HISTORY_URL.to_string(),
            country_list_url: gsod::COUNTRY_LIST_URL.to_string(),
            output_dir: PathBuf::from(files::RESOURCES_DIR),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when no CLI flag or RUST_LOG is given
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: logging::DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Resolved settings the engine consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSettings {
    pub incremental_load: bool,
    pub sample_file_count: Option<usize>,
    pub save_to_cloud: bool,
    pub cloud_provider_name: String,
    pub raw_output_path: PathBuf,
    pub processed_output_path: PathBuf,
}

impl AppConfig {
    /// Load configuration with multi-source precedence:
    /// 1. Default values
    /// 2. Config file (explicit, project-local, then user config dir)
    /// 3. Environment variables
    ///
    /// CLI flags are applied afterwards by the command handlers.
    pub async fn load(config_file_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_file_override {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound { path }.into());
                }
                Some(path)
            }
            None => Self::find_config_file(),
        };

        let mut config = match config_path {
            Some(path) => Self::load_from_file(&path).await?,
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut search_paths = vec![PathBuf::from(config_files::LOCAL_CONFIG_FILE)];
        if let Some(path) = Self::default_config_path() {
            search_paths.push(path);
        }

        for path in search_paths {
            if path.exists() {
                debug!("Found config file: {}", path.display());
                return Some(path);
            }
        }
        None
    }

    /// Default config file path for the current user
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| {
            dir.join(config_files::APP_DIR_NAME)
                .join(config_files::CONFIG_FILE_NAME)
        })
    }

    /// Load configuration from a TOML file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::generic(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: AppConfig = toml::from_str(&content).map_err(ConfigError::InvalidFormat)?;

        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Apply `GSOD_*` environment variables on top of the file values
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(env::BASE_URL) {
            self.source.base_url = url;
        }
        if let Some(value) = lookup(env::INCREMENTAL_LOAD) {
            self.sync.incremental_load = parse_flag(env::INCREMENTAL_LOAD, &value)?;
        }
        if let Some(value) = lookup(env::SAMPLE_FILE_COUNT) {
            let trimmed = value.trim();
            self.sync.sample_file_count =
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(trimmed.parse().map_err(|_| ConfigError::InvalidValue {
                        field: env::SAMPLE_FILE_COUNT.to_string(),
                        value: value.clone(),
                        reason: "expected a non-negative integer".to_string(),
                    })?)
                };
        }
        if let Some(value) = lookup(env::SAVE_TO_CLOUD) {
            self.storage.save_to_cloud = parse_flag(env::SAVE_TO_CLOUD, &value)?;
        }
        if let Some(name) = lookup(env::CLOUD_PROVIDER) {
            self.storage.cloud_provider_name = name;
        }
        Ok(())
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.source.base_url.trim().is_empty() {
            errors.push("source.base_url must not be empty".to_string());
        } else if let Err(e) = Url::parse(&self.source.base_url) {
            errors.push(format!("source.base_url is not a valid URL: {}", e));
        }
        if self.sync.worker_count == 0 {
            errors.push("sync.worker_count must be at least 1".to_string());
        }
        if self.client.max_attempts == 0 {
            errors.push("client.max_attempts must be at least 1".to_string());
        }
        if self.client.rate_limit_rps == 0 {
            errors.push("client.rate_limit_rps must be at least 1".to_string());
        }
        if self.storage.save_to_cloud {
            if self.storage.container.trim().is_empty() {
                errors.push("storage.container is required when save_to_cloud is set".to_string());
            }
            if let Err(e) = CloudProvider::from_name(&self.storage.cloud_provider_name) {
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationFailed { errors })
        }
    }

    /// Settings surface consumed by the engine
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            incremental_load: self.sync.incremental_load,
            sample_file_count: self.sync.sample_file_count,
            save_to_cloud: self.storage.save_to_cloud,
            cloud_provider_name: self.storage.cloud_provider_name.clone(),
            raw_output_path: self.storage.raw_output_path.clone(),
            processed_output_path: self.storage.processed_output_path.clone(),
        }
    }

    /// Parsed source base URL, normalised to end with `/`
    pub fn base_url(&self) -> ConfigResult<Url> {
        let mut raw = self.source.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
            field: "source.base_url".to_string(),
            value: self.source.base_url.clone(),
            reason: e.to_string(),
        })
    }

    /// Runtime HTTP client configuration
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: self.client.request_timeout,
            connect_timeout: self.client.connect_timeout,
            pool_idle_timeout: Some(self.client.pool_idle_timeout),
            pool_max_per_host: self.client.pool_max_per_host,
            rate_limit_rps: self.client.rate_limit_rps,
            ..ClientConfig::default()
        }
    }

    /// Runtime retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.client.max_attempts,
            base_delay: self.client.retry_base_delay,
            max_delay: self.client.retry_max_delay,
            ..RetryPolicy::default()
        }
    }

    /// Runtime coordinator configuration
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            worker_count: self.sync.worker_count,
            compact_after_run: self.ledger.compact_after_run,
            ..CoordinatorConfig::default()
        }
    }

    /// Reference resources to fetch, in download order
    pub fn reference_resources(&self) -> ConfigResult<Vec<ReferenceResource>> {
        let entries = [
            (
                "resources.station_history_url",
                &self.resources.station_history_url,
                gsod::STATION_HISTORY_FILE_NAME,
            ),
            (
                "resources.country_list_url",
                &self.resources.country_list_url,
                gsod::COUNTRY_LIST_FILE_NAME,
            ),
        ];

        entries
            .into_iter()
            .map(|(field, url, file_name)| {
                let url = Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: url.clone(),
                    reason: e.to_string(),
                })?;
                Ok(ReferenceResource::new(url, file_name))
            })
            .collect()
    }

    /// Generate default configuration content with helpful comments
    pub fn generate_default_config_content() -> String {
        format!(
            r#"# GSOD Sync Configuration
# Values below are the built-in defaults.
# Environment variables GSOD_BASE_URL, GSOD_INCREMENTAL_LOAD,
# GSOD_SAMPLE_FILE_COUNT, GSOD_SAVE_TO_CLOUD and GSOD_CLOUD_PROVIDER
# override the corresponding settings.

[source]
base_url = "{base_url}"

[sync]
# false = historical load (everything not yet committed)
# true  = incremental load (new, changed or previously failed files)
incremental_load = false
# Per-year cap on files ingested; leave commented out for no cap
# sample_file_count = 10
worker_count = {workers}

[storage]
save_to_cloud = false
# azure, gcp or filesystem; credentials come from the environment
cloud_provider_name = "azure"
container = "{container}"
blob_prefix = "{prefix}"
raw_output_path = "{raw}"
processed_output_path = "{processed}"
# Mount point for the filesystem provider
# bucket_root = "/mnt/bucket"

[ledger]
path = "{ledger}"
compact_after_run = true

[client]
request_timeout = "60s"
connect_timeout = "30s"
pool_idle_timeout = "90s"
pool_max_per_host = {pool}
rate_limit_rps = {rps}
max_attempts = {attempts}
retry_base_delay = "500ms"
retry_max_delay = "30s"

[resources]
station_history_url = "{stations}"
country_list_url = "{countries}"
output_dir = "{resources}"

[logging]
level = "{level}"  # error, warn, info, debug, trace
"#,
            base_url = gsod::BASE_URL,
            workers = workers::DEFAULT_WORKER_COUNT,
            container = cloud::DEFAULT_CONTAINER,
            prefix = cloud::DEFAULT_BLOB_PREFIX,
            raw = files::RAW_OUTPUT_DIR,
            processed = files::PROCESSED_OUTPUT_DIR,
            ledger = files::LEDGER_PATH,
            pool = http::POOL_MAX_PER_HOST,
            rps = limits::DEFAULT_RATE_LIMIT_RPS,
            attempts = limits::MAX_ATTEMPTS,
            stations = gsod::STATION_HISTORY_URL,
            countries = gsod::COUNTRY_LIST_URL,
            resources = files::RESOURCES_DIR,
            level = logging::DEFAULT_LOG_LEVEL,
        )
    }

    /// Write the commented default configuration to `path`
    pub async fn write_default_config(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(AppError::generic(format!(
                "Config file already exists: {} (use --force to overwrite)",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, Self::generate_default_config_content()).await?;
        info!("Wrote default configuration to {}", path.display());
        Ok(())
    }
}

fn parse_flag(field: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
