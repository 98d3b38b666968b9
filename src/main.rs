//! `spf` binary entry point.
//!
//! Loads a configuration file, starts every enabled rule and forwards until
//! Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::{error, info};

use spf::config::{ConfigLoader, SpfConfig};
use spf::logging::init_logging;
use spf::manager::InstanceManager;

/// spf - local TCP/UDP port forwarder.
#[derive(Debug, Parser)]
#[command(name = "spf", version, about = "spf - local TCP/UDP port forwarder")]
struct Cli {
    /// Configuration file
    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH",
        default_value = "spf.toml"
    )]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long = "check")]
    check: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ConfigLoader::standard().load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("spf: {e}");
            return ExitCode::FAILURE;
        },
    };

    if cli.check {
        println!(
            "{}: ok, {} enabled rule(s)",
            cli.config.display(),
            config.enabled_rules().count()
        );
        return ExitCode::SUCCESS;
    }

    let mut logging = config.logging.clone();
    logging.level = logging.level.more_verbose(cli.verbose);
    if let Err(e) = init_logging(&logging) {
        eprintln!("spf: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "spf starting"
    );

    run(config).await
}

async fn run(config: SpfConfig) -> ExitCode {
    let manager = InstanceManager::with_settings(config.engine.clone());
    let mut started = 0usize;

    for rule in config.forwarding_configs() {
        let name = rule.display_name().to_string();

        let id = match manager.create(rule) {
            Ok(id) => id,
            Err(e) => {
                error!(rule = %name, error = %e, "Skipping invalid rule");
                continue;
            },
        };

        // A rule that cannot bind is skipped; the others keep running.
        match manager.start(id).await {
            Ok(_) => started += 1,
            Err(e) => error!(rule = %name, error = %e, "Failed to start rule"),
        }
    }

    if started == 0 {
        error!("No forwarding rule could be started");
        manager.shutdown().await;
        return ExitCode::FAILURE;
    }

    info!(started, "Forwarding, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }

    info!("Shutdown requested");
    log_summary(&manager);
    manager.shutdown().await;
    ExitCode::SUCCESS
}

/// Log each instance's counters before the instances are torn down.
fn log_summary(manager: &InstanceManager) {
    for status in manager.statuses() {
        match serde_json::to_string(&status) {
            Ok(json) => info!(instance = %status.id, status = %json, "Instance summary"),
            Err(e) => error!(instance = %status.id, error = %e, "Failed to serialize status"),
        }
    }
}
