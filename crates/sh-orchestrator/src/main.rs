//! spawnhub daemon
//!
//! Runs the orchestrator with the local subprocess driver and an in-process
//! proxy table, optionally spawning a set of servers at boot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sh_core::config::{self, HubConfig};
use sh_core::ServerKey;
use sh_orchestrator::driver::LocalProcessDriver;
use sh_orchestrator::proxy::{run_route_check, InMemoryProxy};
use sh_orchestrator::store::InMemoryStore;
use sh_orchestrator::{Orchestrator, OperationResult, StartOutcome};

#[derive(Parser)]
#[command(name = "spawnhub")]
#[command(about = "spawnhub per-user server orchestrator")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Spawn a server at boot, as `user` or `user/name` (repeatable)
    #[arg(long = "spawn", value_name = "USER[/NAME]")]
    spawn: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("spawnhub starting...");

    let config = load_config(args.config.as_ref())?;
    config.validate().context("Invalid configuration")?;

    let boot_keys = args
        .spawn
        .iter()
        .map(|spec| {
            ServerKey::parse(spec).with_context(|| format!("Invalid --spawn value: {:?}", spec))
        })
        .collect::<Result<Vec<_>>>()?;

    let driver = Arc::new(LocalProcessDriver::new(config.driver.clone()));
    let proxy = Arc::new(InMemoryProxy::new());
    let route_check_interval = config.route_check_interval;
    let orchestrator = Arc::new(
        Orchestrator::builder(config, driver, proxy)
            .store(Arc::new(InMemoryStore::new()))
            .build(),
    );

    orchestrator
        .restore()
        .await
        .context("Failed to restore server records")?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        cancel_clone.cancel();
    });

    let route_check = tokio::spawn(run_route_check(
        Arc::clone(&orchestrator),
        route_check_interval,
        cancel.clone(),
    ));

    for key in boot_keys {
        spawn_at_boot(Arc::clone(&orchestrator), key);
    }

    cancel.cancelled().await;

    tracing::info!("Stopping all servers...");
    orchestrator.stop_all().await;
    if let Err(e) = route_check.await {
        tracing::warn!("Route check task ended abnormally: {}", e);
    }

    tracing::info!("spawnhub shutdown complete");
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<HubConfig> {
    if let Some(config_path) = path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            HubConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(HubConfig::default())
    }
}

/// Request a spawn and log how it ends
fn spawn_at_boot(orchestrator: Arc<Orchestrator>, key: ServerKey) {
    tokio::spawn(async move {
        match orchestrator.request_spawn(&key.user, &key.name, None).await {
            Ok(StartOutcome::Accepted(operation)) => match operation.wait().await {
                OperationResult::Succeeded => {
                    let url = orchestrator.get_state(&key.user, &key.name).await.ok();
                    tracing::info!(
                        "Boot spawn of {} ready at {}",
                        key,
                        url.and_then(|s| s.url).unwrap_or_default()
                    );
                }
                other => tracing::warn!("Boot spawn of {} ended: {:?}", key, other),
            },
            Ok(StartOutcome::AlreadyRunning) => {
                tracing::info!("{} already running", key);
            }
            Err(e) => tracing::error!("Boot spawn of {} rejected: {}", key, e),
        }
    });
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
