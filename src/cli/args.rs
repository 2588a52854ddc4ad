//! Command-line argument parsing for GSOD Sync
//!
//! This module defines the CLI structure using clap derive macros: syncing
//! years into the destination, previewing plans, browsing the remote year
//! index, fetching reference resources, and inspecting the ledger and
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::app::models::LoadMode;

/// GSOD Sync - Mirror NOAA GSOD daily weather archives
#[derive(Parser, Debug)]
#[command(
    name = "gsod_sync",
    version,
    about = "Synchronize NOAA GSOD daily weather-station archives",
    long_about = "Downloads yearly GSOD station archives, decompresses them and commits them to a local
directory or a cloud container. An ingestion ledger makes repeated runs idempotent."
)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all subcommands
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Very verbose logging (debug level)
    #[arg(long, global = true)]
    pub very_verbose: bool,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download, decompress and commit archives for one or more years
    Sync(SyncArgs),

    /// Show what a sync of one year would download
    Plan(PlanArgs),

    /// List the year directories on the server
    Years(YearsArgs),

    /// Fetch the station history and country reference files
    Resources,

    /// Inspect the ingestion ledger
    Ledger(LedgerArgs),

    /// Manage the configuration file
    Config(ConfigArgs),
}

/// Load mode flags shared by `sync` and `plan`
#[derive(Args, Debug, Clone, Default)]
pub struct ModeArgs {
    /// Only new, changed or previously failed files
    #[arg(long, conflicts_with = "historical")]
    pub incremental: bool,

    /// Every file not yet committed
    #[arg(long)]
    pub historical: bool,
}

impl ModeArgs {
    /// Explicit mode, or `None` to use the configured one
    pub fn mode(&self) -> Option<LoadMode> {
        if self.incremental {
            Some(LoadMode::Incremental)
        } else if self.historical {
            Some(LoadMode::Historical)
        } else {
            None
        }
    }
}

/// Arguments for the sync command
#[derive(Args, Debug, Clone, Default)]
pub struct SyncArgs {
    /// Year to sync (repeatable)
    #[arg(short, long = "year", value_name = "YEAR")]
    pub years: Vec<i32>,

    /// First year of a range
    #[arg(long, requires = "to", value_name = "YEAR")]
    pub from: Option<i32>,

    /// Last year of a range (inclusive)
    #[arg(long, requires = "from", value_name = "YEAR")]
    pub to: Option<i32>,

    /// Every year directory on the server
    #[arg(long)]
    pub all_years: bool,

    /// Only years whose directory changed within this window (e.g. "7d")
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub changed_since: Option<Duration>,

    #[command(flatten)]
    pub mode: ModeArgs,

    /// Maximum files per year
    #[arg(short, long, value_name = "N")]
    pub sample: Option<usize>,

    /// Number of concurrent download workers
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Sync only this archive (repeatable); its year is taken from the name
    #[arg(long = "file", value_name = "NAME")]
    pub files: Vec<String>,

    /// Fetch the reference resources before the archives
    #[arg(long)]
    pub with_resources: bool,
}

/// Arguments for the plan command
#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Year to plan
    #[arg(short, long)]
    pub year: i32,

    #[command(flatten)]
    pub mode: ModeArgs,

    /// Maximum files in the plan
    #[arg(short, long, value_name = "N")]
    pub sample: Option<usize>,
}

/// Arguments for the years command
#[derive(Args, Debug, Clone)]
pub struct YearsArgs {
    /// Only years whose directory changed within this window (e.g. "30d")
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    pub changed_since: Option<Duration>,
}

/// Arguments for ledger inspection
#[derive(Args, Debug)]
pub struct LedgerArgs {
    #[command(subcommand)]
    pub action: LedgerAction,
}

/// Ledger actions
#[derive(Subcommand, Debug)]
pub enum LedgerAction {
    /// Record counts per status
    Status,

    /// Show one file's record
    Show {
        /// Archive name, e.g. 010010-99999-2023.op.gz
        #[arg(value_name = "FILE_ID")]
        file_id: String,
    },
}

/// Arguments for configuration management
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a commented default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the resolved configuration
    Show,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Logging level selected by the global flags, if any
    pub fn log_level(&self) -> Option<tracing::Level> {
        if self.global.quiet {
            Some(tracing::Level::ERROR)
        } else if self.global.very_verbose {
            Some(tracing::Level::DEBUG)
        } else if self.global.verbose {
            Some(tracing::Level::INFO)
        } else {
            None
        }
    }

    /// Level directive for `gsod_sync`: a flag wins over the configured level
    pub fn log_directive(&self, configured: &str) -> String {
        match self.log_level() {
            Some(level) => level.to_string().to_lowercase(),
            None => configured.to_string(),
        }
    }
}

impl SyncArgs {
    /// Check for argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(format!("--from {} is after --to {}", from, to));
            }
        }

        if self.workers == Some(0) {
            return Err("Number of workers must be greater than 0".to_string());
        }

        if self.sample == Some(0) {
            return Err("--sample must be greater than 0".to_string());
        }

        if !self.files.is_empty()
            && (self.all_years || self.changed_since.is_some() || self.from.is_some())
        {
            return Err("--file cannot be combined with year discovery options".to_string());
        }

        Ok(())
    }

    /// Whether the years come from the remote year index
    pub fn discovers_years(&self) -> bool {
        self.all_years || self.changed_since.is_some()
    }

    /// Years named explicitly by `--year` and `--from/--to`, ascending
    pub fn explicit_years(&self) -> Vec<i32> {
        let mut years = self.years.clone();
        if let (Some(from), Some(to)) = (self.from, self.to) {
            years.extend(from..=to);
        }
        years.sort_unstable();
        years.dedup();
        years
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_args_validation() {
        let mut args = SyncArgs {
            years: vec![2023],
            ..Default::default()
        };
        assert!(args.validate().is_ok());

        args.workers = Some(0);
        assert!(args.validate().is_err());

        args.workers = Some(4);
        args.from = Some(2020);
        args.to = Some(2010);
        assert!(args.validate().is_err());

        args.from = None;
        args.to = None;
        args.files = vec!["010010-99999-2023.op.gz".to_string()];
        args.all_years = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_explicit_years() {
        let args = SyncArgs {
            years: vec![2023, 2020],
            from: Some(2019),
            to: Some(2021),
            ..Default::default()
        };
        assert_eq!(args.explicit_years(), vec![2019, 2020, 2021, 2023]);
        assert!(!args.discovers_years());
    }

    #[test]
    fn test_parse_sync_command() {
        let cli = Cli::try_parse_from([
            "gsod_sync",
            "-v",
            "sync",
            "--year",
            "2023",
            "--incremental",
            "--sample",
            "5",
            "--changed-since",
            "7d",
        ])
        .unwrap();

        match cli.command {
            Commands::Sync(args) => {
                assert_eq!(args.years, vec![2023]);
                assert_eq!(args.mode.mode(), Some(LoadMode::Incremental));
                assert_eq!(args.sample, Some(5));
                assert_eq!(args.changed_since, Some(Duration::from_secs(7 * 86400)));
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(cli.global.verbose);
    }

    #[test]
    fn test_conflicting_modes_rejected() {
        let result = Cli::try_parse_from([
            "gsod_sync",
            "plan",
            "--year",
            "2023",
            "--incremental",
            "--historical",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_level() {
        let cli_quiet = Cli {
            global: GlobalArgs {
                verbose: false,
                very_verbose: false,
                quiet: true,
                config: None,
            },
            command: Commands::Resources,
        };

        let cli_verbose = Cli {
            global: GlobalArgs {
                verbose: true,
                very_verbose: false,
                quiet: false,
                config: None,
            },
            command: Commands::Ledger(LedgerArgs {
                action: LedgerAction::Status,
            }),
        };

        assert_eq!(cli_quiet.log_level(), Some(tracing::Level::ERROR));
        assert_eq!(cli_verbose.log_level(), Some(tracing::Level::INFO));
        assert_eq!(cli_quiet.log_directive("warn"), "error");

        let cli_default = Cli::try_parse_from(["gsod_sync", "resources"]).unwrap();
        assert_eq!(cli_default.log_level(), None);
        assert_eq!(cli_default.log_directive("warn"), "warn");
    }
}
