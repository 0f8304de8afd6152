//! wsbridge-server: WebSocket API-gateway bridge.
//!
//! Loads connection entities from the config file, starts one bridge pair
//! per enabled entity, re-reads the file on SIGHUP and stops every bridge on
//! Ctrl+C / SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use wsbridge_core::RecordPipeline;
use wsbridge_server::config::ServerConfig;
use wsbridge_server::policy::RulePipeline;
use wsbridge_server::supervisor::{diff_entities, EntityEvent, LoggingPortManager, Supervisor};

/// wsbridge-server: WebSocket bridging gateway
#[derive(Parser, Debug)]
#[command(name = "wsbridge-server", version, about = "WebSocket bridging gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.wsbridge/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Runtime worker threads
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Outbound dial timeout in seconds
    #[arg(long)]
    dial_timeout: Option<u64>,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting wsbridge-server");

    let loaded = ServerConfig::load(Path::new(&cli.config), cli.worker_threads, cli.dial_timeout);
    let config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .enable_all()
        .thread_name("wsbridge-worker")
        .max_blocking_threads(config.max_blocking_threads);
    if let Some(n) = config.worker_threads {
        builder.worker_threads(n);
    }
    let runtime = match builder.build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %format!("{e:#}"), "server error");
        std::process::exit(1);
    }

    info!("wsbridge-server stopped");
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let rules = RulePipeline::new(&config.policies).context("invalid [[policies]]")?;
    for entity in &config.connections {
        let refs = [
            entity.inbound.handshake_policy.as_deref(),
            entity.inbound.message_policy.as_deref(),
            entity.outbound.message_policy.as_deref(),
        ];
        for service in refs.into_iter().flatten() {
            if !rules.has_service(service) {
                warn!(
                    bridge = %entity.id,
                    policy = %service,
                    "entity references an undefined policy"
                );
            }
        }
    }

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(RecordPipeline::new(rules)),
        Arc::new(LoggingPortManager),
        config.bind_addr.clone(),
    ));
    supervisor
        .init_registry(Handle::current(), config.dial_timeout)
        .context("failed to create connection registry")?;

    let (events_tx, events_rx) = mpsc::channel::<EntityEvent>(64);
    let feed = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(events_rx).await })
    };

    let mut current = config.connections.clone();
    info!(connections = current.len(), "loading connection entities");
    for entity in &current {
        events_tx
            .send(EntityEvent::Created(entity.clone()))
            .await
            .context("entity feed closed")?;
    }

    let mut reloads = reload_requests()?;
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("received shutdown signal");
                break;
            }
            Some(()) = reloads.recv() => {
                info!(path = %config.path.display(), "reloading connection entities");
                match config.reload_connections() {
                    Ok(next) => {
                        for event in diff_entities(&current, &next) {
                            events_tx.send(event).await.context("entity feed closed")?;
                        }
                        current = next;
                    }
                    Err(e) => warn!(error = %e, "reload failed, keeping current entities"),
                }
            }
        }
    }

    drop(events_tx);
    let _ = feed.await;
    supervisor.stop_all().await;
    Ok(())
}

/// SIGHUP arrivals, as a channel. Never yields on non-unix targets.
fn reload_requests() -> anyhow::Result<mpsc::Receiver<()>> {
    let (tx, rx) = mpsc::channel(1);
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });
    }
    #[cfg(not(unix))]
    drop(tx);
    Ok(rx)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
