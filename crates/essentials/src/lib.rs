//! # Essentials Storage Host
//!
//! Runs the Essentials storage layer as a standalone process: loads the
//! configuration, opens every document store once, keeps the caches trimmed
//! while running and saves everything on shutdown.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! essentials
//!
//! # Custom configuration and data directory
//! essentials --config production.toml --data-dir /srv/essentials
//!
//! # Rebuild the user cache from every stored user document
//! essentials --rebuild-user-cache
//! ```
//!
//! ## Configuration
//!
//! Configuration is read from a TOML file (default: `config.toml`). If the
//! file doesn't exist, a default configuration is written there first.
//!
//! ## Signal Handling
//!
//! SIGINT and SIGTERM (Ctrl+C on Windows) trigger a graceful shutdown that
//! saves every dirty document and the user cache. A second signal exits
//! immediately.

use tracing::error;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Main entry point for the Essentials storage host.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
///
/// Called from the binary's `#[tokio::main]`, so it must not start a runtime itself.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging comes up before the application so config problems are reported.
    let mut logging = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default()
        .logging;
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }

    if let Err(e) = logging::setup_logging(&logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}
