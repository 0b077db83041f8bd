//! Chapter Fetcher CLI application
//!
//! Command-line interface for downloading chaptered image content for offline
//! reading. Features a persistent queue, resumable transfers, storage
//! management and integrity checks.

use std::process;

use tracing::{info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, EnvFilter};

// Import CLI modules through the library (module is public but not re-exported)
use chapter_fetcher::cli::{
    handle_download, handle_queue, handle_storage, handle_validate, Cli, Commands,
};
use chapter_fetcher::config::AppConfig;
use chapter_fetcher::errors::Result;

#[tokio::main]
async fn main() {
    // Initialize program
    let result = run().await;

    // Handle any errors that occurred
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

    if cli.global.config.is_none() {
        if let Err(e) = AppConfig::initialize_first_run().await {
            eprintln!("Could not create default configuration: {}", e);
        }
    }

    let mut config = AppConfig::load(cli.global.config.clone()).await?;
    if let Some(dir) = &cli.global.storage_dir {
        config.storage.storage_root = Some(dir.clone());
    }

    init_logging(&cli, &config);
    info!("Chapter Fetcher v{} starting", env!("CARGO_PKG_VERSION"));

    let quiet = cli.global.quiet;
    match cli.command {
        Commands::Download(args) => {
            info!("Executing download command");
            handle_download(args, config, quiet).await
        }
        Commands::Storage(args) => {
            info!("Executing storage command");
            handle_storage(args, config).await
        }
        Commands::Validate(args) => {
            info!("Executing validate command");
            handle_validate(args, config).await
        }
        Commands::Queue(args) => {
            info!("Executing queue command");
            handle_queue(args, config).await
        }
    }
}

/// Initialize logging from CLI flags, falling back to the configured level
fn init_logging(cli: &Cli, config: &AppConfig) {
    let directive = cli.log_directive(&config.logging.level);

    let mut filter = EnvFilter::from_default_env();
    let invalid = match directive.parse::<Directive>() {
        Ok(directive) => {
            filter = filter.add_directive(directive);
            None
        }
        Err(e) => Some(e),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(config.logging.colored_output)
        .with_level(cli.global.very_verbose) // Show levels only in very verbose mode
        .init();

    if let Some(e) = invalid {
        warn!("Ignoring log level '{}': {}", config.logging.level, e);
    }
    if cli.global.very_verbose {
        info!("Very verbose logging enabled");
    } else if cli.global.verbose {
        info!("Verbose logging enabled");
    }
}
