use anyhow::{Context, Result};
use clap::{Arg, Command};
use redirector::monitoring::{self, MetricsCollector};
use redirector::shutdown::{GracefulShutdown, ShutdownSignal};
use redirector::{ConfigManager, SharedHostsStore, Supervisor};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

// 版本信息常量
const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_TIME: &str = env!("BUILD_TIME");
const GIT_HASH: &str = env!("GIT_HASH");
const TARGET_ARCH: &str = env!("TARGET_ARCH");
const BUILD_PROFILE: &str = env!("BUILD_PROFILE");

fn get_version_info() -> String {
    format!(
        "Redirector v{}\n\
        Build Information:\n\
        ├─ Build Time: {}\n\
        ├─ Git Hash: {}\n\
        ├─ Target Architecture: {}\n\
        └─ Build Profile: {}",
        VERSION, BUILD_TIME, GIT_HASH, TARGET_ARCH, BUILD_PROFILE
    )
}

fn build_cli() -> Command {
    Command::new("redirector")
        .version(VERSION)
        .about("Redirector -- the local DNS load balancer")
        .long_about(
            "Redirector keeps one entry per virtual host in the system hosts file, pointing at\n\
            a backend that currently passes its health check, and fails over to another\n\
            backend when the active one stops responding.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to the configuration file")
                .required_unless_present("version-info"),
        )
        .arg(
            Arg::new("version-info")
                .long("version-info")
                .help("Show detailed version and build information")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Override the configured log level (trace, debug, info, warn, error)"),
        )
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let matches = build_cli().get_matches();

    if matches.get_flag("version-info") {
        println!("{}", get_version_info());
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .context("Missing --config argument")?;

    let config_manager = ConfigManager::new(config_path);
    config_manager.load().await?;
    let config = config_manager.get().await;

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.logging.level.clone());
    monitoring::setup_logging(&log_level, &config.logging.format)?;

    info!("Starting Redirector v{} ({}, {})", VERSION, GIT_HASH, BUILD_TIME);
    info!("  Config: {}", config_manager.file_path().display());
    info!("  Hosts file: {}", config.hosts_file.display());
    info!("  Virtual hosts: {}", config.virtual_hosts.len());
    info!("  Process ID: {}", std::process::id());

    let metrics = Arc::new(MetricsCollector::new()?);
    let (metrics_stop_tx, _) = broadcast::channel(1);
    if config.metrics.enabled {
        monitoring::serve_metrics(
            metrics.clone(),
            config.metrics.bind,
            &config.metrics.path,
            metrics_stop_tx.subscribe(),
        )
        .context("Failed to start metrics endpoint")?;
    }

    let signals = GracefulShutdown::new();
    let mut signal_rx = signals.subscribe();
    signals.start_signal_handling().await?;

    let store = SharedHostsStore::new(&config.hosts_file);
    let mut supervisor =
        Supervisor::new(store, metrics).with_prune_stale_blocks(config.prune_stale_blocks);
    supervisor.start(&config.virtual_hosts).await?;

    let result = loop {
        match signal_rx.recv().await {
            Ok(ShutdownSignal::Hangup) => {
                if let Err(e) = config_manager.reload().await {
                    error!("Configuration reload failed, keeping current virtual hosts: {:#}", e);
                    continue;
                }
                let new_config = config_manager.get().await;
                if new_config.hosts_file != config.hosts_file {
                    warn!("Changing hosts_file requires a restart; keeping {}", config.hosts_file.display());
                }
                if let Err(e) = supervisor.reload(&new_config.virtual_hosts).await {
                    break Err(e);
                }
            }
            Ok(signal) => {
                info!("Shutting down on {}", signal);
                break Ok(());
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break Ok(()),
        }
    };

    supervisor.shutdown();
    supervisor.wait().await;
    let _ = metrics_stop_tx.send(());

    info!("Redirector stopped; published entries are left in place");
    result
}
