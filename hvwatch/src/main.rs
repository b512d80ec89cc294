//! Hypervisor Watcher (HVWatch)
//!
//! Polls the compute control plane for hypervisors reported down, evacuates
//! their VMs and restarts each VM once its migration has completed.

mod cli;
mod config;
mod metrics_server;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::{BackoffKind, ClusterConfig, Config, TrackingConfig};
use hvwatch_core::clock::SystemClock;
use hvwatch_core::cluster::ClusterApi;
use hvwatch_core::metrics::MetricsRegistry;
use hvwatch_core::reconciler::{CycleReport, NodeOutcome, ReconcileConfig, Reconciler};
use hvwatch_core::retry::{Backoff, RetryPolicy};
use hvwatch_nova::{KeystoneAuth, NovaClient, NovaConfig};

/// Initialize the tracing/logging subsystem
///
/// Logs go to `log_file` when given (appending, parent directory created),
/// stdout otherwise.
fn init_logging(log_level: &str, json_format: bool, log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let file = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            Some(Mutex::new(file))
        }
        None => None,
    };

    match (json_format, file) {
        (true, Some(file)) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(file))
            .init(),
        (true, None) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        (false, Some(file)) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(file))
            .init(),
        (false, None) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }
    Ok(())
}

/// Convert tracking config to core retry policy
fn to_core_retry_policy(config: &TrackingConfig) -> RetryPolicy {
    let backoff = match config.backoff {
        BackoffKind::Fixed => Backoff::Fixed,
        BackoffKind::Exponential => Backoff::Exponential {
            factor: config.backoff_factor,
            max_interval: config.max_interval,
        },
    };
    RetryPolicy {
        interval: config.interval,
        max_attempts: config.max_retries,
        backoff,
    }
}

/// Convert config to core reconcile config
fn to_reconcile_config(config: &Config) -> ReconcileConfig {
    ReconcileConfig {
        poll_interval: config.poll_interval,
        settle_delay: config.settle_delay,
        tracking: to_core_retry_policy(&config.tracking),
        max_concurrent_nodes: config.max_concurrent_nodes,
        dry_run: config.dry_run,
    }
}

/// Convert cluster config to nova client config
fn to_nova_config(config: &ClusterConfig) -> NovaConfig {
    NovaConfig {
        auth: KeystoneAuth {
            auth_url: config.auth_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            project_name: config.project_name.clone(),
            region: config.region.clone(),
            compute_endpoint: config.compute_endpoint.clone(),
        },
        on_shared_storage: config.on_shared_storage,
        request_timeout: config.request_timeout,
    }
}

/// Log a one-line summary per down node
fn log_cycle(report: &CycleReport) {
    for node in &report.nodes {
        match &node.outcome {
            NodeOutcome::Skipped { reason, .. } => {
                warn!(node = %node.node, reason = %reason, "Down node skipped");
            }
            NodeOutcome::Evacuated {
                evacuation,
                tracking,
            } => {
                info!(
                    node = %node.node,
                    evacuated = evacuation.succeeded().count(),
                    failed = evacuation.failed().count(),
                    outcome = %tracking
                        .as_ref()
                        .map(|t| t.outcome.to_string())
                        .unwrap_or_else(|| "UNTRACKED".to_string()),
                    "Down node handled"
                );
            }
        }
    }
}

/// Build the reconciler and run it until shutdown
async fn run(config: Config, once: bool, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let nova = NovaClient::new(to_nova_config(&config.cluster))
        .context("Failed to create compute API client")?;
    let api: Arc<dyn ClusterApi> = Arc::new(nova);

    let metrics = Arc::new(MetricsRegistry::new());
    let reconciler = Reconciler::new(
        api,
        Arc::new(SystemClock),
        metrics,
        to_reconcile_config(&config),
    );

    if once {
        info!("Running single reconciliation cycle (--once mode)");
        let report = reconciler.run_once().await;
        if report.session_failed {
            anyhow::bail!("Unable to establish a session with the control plane");
        }
        log_cycle(&report);
        let stuck = report.stuck_servers();
        if !stuck.is_empty() {
            warn!(servers = ?stuck, "Servers left without a confirmed migration");
        }
        return Ok(());
    }

    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start(port).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    reconciler.run(shutdown_rx).await?;

    info!("HVWatch shutdown complete");
    Ok(())
}

/// Flip the shutdown channel on SIGINT or SIGTERM
async fn wait_for_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }

    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Configuration decides where logs go, so it is loaded first
    let config_found = cli.config.exists();
    let mut config = if config_found {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        Config::default()
    };

    init_logging(&cli.log_level, cli.log_json, config.logging.path().as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), "HVWatch starting");
    if !config_found {
        warn!(path = ?cli.config, "Config file not found, using defaults");
    }

    // Apply CLI and environment overrides
    if cli.dry_run {
        config.dry_run = true;
    }
    config = config.with_password_from_env();

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    info!(
        auth_url = %config.cluster.auth_url,
        dry_run = config.dry_run,
        "Configuration loaded"
    );

    // Setup shutdown signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_signal(shutdown_tx));

    run(config, cli.once, shutdown_rx).await
}
