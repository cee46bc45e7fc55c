//! dmsd - Per-node mount server
//!
//! Runs one instance per compute node. On startup it adopts FUSE
//! helpers left behind by a previous daemon run, then serves
//! mount/unmount requests from the node's broker queue until SIGTERM or
//! SIGINT.
//!
//! Exit codes: 0 on clean shutdown, 2 on configuration errors, 1 on
//! fatal broker failures.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dms_core::config::DmsConfig;
use dms_daemon::executor::MountExecutor;
use dms_daemon::handler::MountHandler;
use dms_daemon::registry::FuseProcessRegistry;
use dms_daemon::secrets::HttpSecretProvider;
use dms_rpc::{redact_broker_url, RpcServer};

/// Exit code for configuration errors.
const EXIT_CONFIG: i32 = 2;

/// Exit code for fatal broker failures.
const EXIT_BROKER: i32 = 1;

/// Interval of the dead-helper reconciliation sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Configuration
// ============================================================================

/// Load configuration with defaults < file < environment precedence.
///
/// An explicit `DMS_CONFIG` path must load; the default path is
/// optional.
fn load_config() -> Result<DmsConfig, String> {
    let mut config = match std::env::var("DMS_CONFIG") {
        Ok(path) => DmsConfig::load(Path::new(&path))
            .map_err(|e| format!("failed to load config '{path}': {e:#}"))?,
        Err(_) => DmsConfig::load_or_default(&DmsConfig::default_path()),
    };

    config.apply_env_overrides();

    let errors = config.validate();
    if !errors.is_empty() {
        let summary: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(format!("invalid configuration: {}", summary.join("; ")));
    }

    Ok(config)
}

/// Node id from the configuration, falling back to the hostname.
fn resolve_node_id(config: &DmsConfig) -> String {
    if !config.node.node_id.is_empty() {
        return config.node.node_id.clone();
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

// ============================================================================
// Shutdown signal handling
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Server assembly
// ============================================================================

async fn run(
    config: DmsConfig,
    node_id: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let registry = Arc::new(
        FuseProcessRegistry::new(
            &config.fuse.binary_path,
            &config.fuse.pid_dir,
            Duration::from_secs(config.fuse.readiness_timeout_secs),
        )
        .context("Failed to initialize the FUSE process registry")?,
    );

    // Recover state from a previous daemon run before serving anything.
    let (adopted, cleaned) = registry
        .load_existing()
        .context("Failed to scan pid files")?;
    info!(adopted, cleaned, "Recovered FUSE helper state");

    let secrets = Arc::new(HttpSecretProvider::new());
    let executor = Arc::new(MountExecutor::new(
        Arc::clone(&registry),
        secrets,
        &config.mount_helper.path,
        config.mount_helper.conf.clone(),
    ));
    let handler = MountHandler::new(executor);

    let server = RpcServer::connect(&config.broker.url, node_id.clone())
        .await
        .context("Failed to connect to the broker")?;

    // Periodic reconciliation: drop registry entries whose helper died
    // underneath us.
    let sweep_registry = Arc::clone(&registry);
    let sweep_token = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match sweep_registry.cleanup_dead().await {
                        Ok(0) => {}
                        Ok(n) => info!(removed = n, "Cleaned up dead helper entries"),
                        Err(e) => error!(error = %e, "Dead-helper sweep failed"),
                    }
                }
                _ = sweep_token.cancelled() => break,
            }
        }
    });

    server.run(&handler, shutdown).await?;
    Ok(())
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dmsd: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    let node_id = resolve_node_id(&config);
    info!(
        node_id = %node_id,
        broker = %redact_broker_url(&config.broker.url),
        pid_dir = %config.fuse.pid_dir.display(),
        "dmsd starting"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    match run(config, node_id, shutdown).await {
        Ok(()) => {
            info!("dmsd shut down cleanly");
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "dmsd exiting after fatal error");
            std::process::exit(EXIT_BROKER);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
