//! GSOD Sync CLI application
//!
//! Command-line interface for synchronizing NOAA GSOD daily weather-station
//! archives into a local directory or cloud container.

use std::process;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use gsod_sync::cli::{
    handle_config, handle_ledger, handle_plan, handle_resources, handle_sync, handle_years, Cli,
    Commands, ConfigAction, ConfigArgs,
};
use gsod_sync::config::AppConfig;
use gsod_sync::constants::logging::DEFAULT_LOG_LEVEL;
use gsod_sync::errors::Result;

#[tokio::main]
async fn main() {
    let result = run().await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let cli = Cli::parse_args();

    // `config init` must work even when the current configuration is invalid
    if let Commands::Config(ConfigArgs {
        action: ConfigAction::Init { force },
    }) = &cli.command
    {
        init_logging(&cli, DEFAULT_LOG_LEVEL);
        let args = ConfigArgs {
            action: ConfigAction::Init { force: *force },
        };
        return handle_config(args, cli.global.config.clone(), None).await;
    }

    let config = AppConfig::load(cli.global.config.clone()).await?;
    init_logging(&cli, &config.logging.level);

    info!("GSOD Sync v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Sync(args) => {
            info!("Executing sync command");
            handle_sync(args, &config, cli.global.quiet).await
        }
        Commands::Plan(args) => {
            info!("Executing plan command");
            handle_plan(args, &config).await
        }
        Commands::Years(args) => {
            info!("Executing years command");
            handle_years(args, &config).await
        }
        Commands::Resources => {
            info!("Executing resources command");
            handle_resources(&config).await
        }
        Commands::Ledger(args) => {
            info!("Executing ledger command");
            handle_ledger(args, &config).await
        }
        Commands::Config(args) => handle_config(args, cli.global.config, Some(&config)).await,
    }
}

/// Initialize logging from the CLI flags, falling back to the configured level
fn init_logging(cli: &Cli, configured_level: &str) {
    let directive = format!("gsod_sync={}", cli.log_directive(configured_level));
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = log_filter(rust_log.as_deref(), &directive);

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_level(cli.global.very_verbose)
        .init();

    if cli.global.very_verbose {
        info!("Very verbose logging enabled");
    } else if cli.global.verbose {
        info!("Verbose logging enabled");
    }
}

/// `RUST_LOG` wins when set; otherwise the CLI or configured directive applies
fn log_filter(rust_log: Option<&str>, directive: &str) -> EnvFilter {
    if let Some(spec) = rust_log.filter(|spec| !spec.trim().is_empty()) {
        return EnvFilter::new(spec);
    }

    match directive.parse() {
        Ok(directive) => EnvFilter::default().add_directive(directive),
        Err(e) => {
            eprintln!("Ignoring invalid log directive '{}': {}", directive, e);
            EnvFilter::default()
        }
    }
}
