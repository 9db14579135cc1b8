mod auth;
mod cli;
mod config;
mod gateway;
mod metrics;
mod monitor;
mod ports;
mod provision;
mod store;
mod vm;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::auth::JwtAuthenticator;
use crate::gateway::{GatewaySettings, HostDownstream, SessionGateway, SessionRegistry};
use crate::metrics::MetricsRegistry;
use crate::monitor::{Cadence, LifecycleMonitor};
use crate::provision::Provisioner;
use crate::store::MemoryStore;

#[derive(Parser)]
#[command(name = "vpsgate", about = "VPS session gateway, port allocator and lifecycle monitor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon: websocket tunnels plus the lifecycle monitor.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Loopback port for /metrics, /healthz and the /admin session
        /// controls. Disabled if not set.
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Verify configuration and host prerequisites. Exits 0 if all pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Show VMs, port leases and revocations from the state file (no daemon needed).
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Administer VMs offline. Refuses to run while the daemon holds the state.
    Vm {
        /// Path to config file (TOML).
        #[arg(long, short, global = true)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        command: cli::VmCommand,
    },
    /// Inspect or release forwarding port leases offline.
    Ports {
        /// Path to config file (TOML).
        #[arg(long, short, global = true)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        command: cli::PortsCommand,
    },
    /// Revoke a bearer token until it expires.
    RevokeToken {
        token: String,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Run monitor cycles by hand.
    Monitor {
        #[command(subcommand)]
        command: MonitorCommand,
    },
}

#[derive(Subcommand)]
enum MonitorCommand {
    /// Run one cycle: sampling, expiry or token-cleanup.
    Run {
        cadence: Cadence,
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Both reqwest and the console websocket client use rustls.
    if rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_check(&config).await?;
        }
        Commands::Status { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_status(&config)?;
        }
        Commands::Vm { config: config_path, command } => {
            let config = cli::load_config(config_path)?;
            cli::run_vm(&config, command).await?;
        }
        Commands::Ports { config: config_path, command } => {
            let config = cli::load_config(config_path)?;
            cli::run_ports(&config, command).await?;
        }
        Commands::RevokeToken { token, config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_revoke_token(&config, &token).await?;
        }
        Commands::Monitor {
            command: MonitorCommand::Run { cadence, config: config_path },
        } => {
            let config = cli::load_config(config_path)?;
            cli::run_monitor_cycle(&config, cadence).await?;
        }
        Commands::Serve { config: config_path, metrics_port } => {
            let config = cli::load_config(config_path)?;

            // lock_file must stay alive for the entire serve duration (dropped at end of block)
            let _lock_file = cli::acquire_instance_lock(&config)?;

            tracing::info!(
                bind = %config.server.bind_addr,
                port = config.server.port,
                state_file = %config.server.state_file.display(),
                "vpsgate starting"
            );

            let store = Arc::new(MemoryStore::with_state_file(
                &config.ports,
                config.server.state_file.clone(),
            ));
            store.load().await.context("loading persisted state")?;

            let control = vm::connect(&config.hypervisor).context("building hypervisor client")?;
            let auth = Arc::new(JwtAuthenticator::new(&config.auth, store.clone())?);
            let registry = SessionRegistry::new();
            let metrics = MetricsRegistry::new();

            let downstream = HostDownstream::new(&config.gateway).context("loading ssh identity")?;
            let gateway = SessionGateway::new(
                store.clone(),
                auth,
                control.clone(),
                Arc::new(downstream),
                registry.clone(),
                GatewaySettings::from_config(&config),
                metrics.clone(),
            );

            // Spawn periodic state persistence
            {
                let store = Arc::clone(&store);
                let interval_secs = config.server.state_persist_interval_secs;
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
                    loop {
                        interval.tick().await;
                        if let Err(e) = store.save().await {
                            tracing::warn!(error = %e, "periodic state save failed");
                        }
                    }
                });
            }

            let provisioner = Arc::new(Provisioner::new(
                store.clone(),
                control.clone(),
                registry.clone(),
                metrics.clone(),
            ));

            let shutdown = CancellationToken::new();
            let mut monitor_tasks = if config.monitor.enabled {
                let monitor = Arc::new(LifecycleMonitor::new(
                    store.clone(),
                    control,
                    registry.clone(),
                    config.monitor.clone(),
                    metrics.clone(),
                ));
                Some(monitor.spawn(shutdown.child_token()))
            } else {
                tracing::warn!("lifecycle monitor disabled by configuration");
                None
            };

            if let Some(port) = metrics_port {
                let addr = SocketAddr::from(([127, 0, 0, 1], port));
                let app = metrics::router(metrics.clone(), registry.clone(), store.clone(), provisioner);
                metrics::start_metrics_server(addr, app);
            }

            let addr = SocketAddr::new(config.server.bind_addr, config.server.port);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding tunnel listener on {}", addr))?;
            tracing::info!(%addr, "vpsgate ready, accepting tunnel connections");

            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to register SIGTERM handler")?;
            let server_shutdown = shutdown.clone();
            let app = gateway.router();
            let server = async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                    .await
            };

            // Start the tunnel server, but also listen for termination signals
            // and monitor exits so we always get a chance to clean up.
            let serve_result = tokio::select! {
                result = server => {
                    result.context("tunnel server failed")
                }
                exited = async {
                    match monitor_tasks.as_mut() {
                        Some(tasks) => tasks.join_next().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match exited {
                        Some(Ok(cadence)) => Err(anyhow::anyhow!("monitor {} task exited unexpectedly", cadence)),
                        Some(Err(e)) => Err(anyhow::anyhow!("monitor task panicked: {}", e)),
                        None => Err(anyhow::anyhow!("monitor tasks exited")),
                    }
                }
                _ = async {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("received SIGINT, initiating shutdown");
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("received SIGTERM, initiating shutdown");
                        }
                    }
                } => {
                    Ok(())
                }
            };

            // Graceful shutdown: always run regardless of how serving ended.
            shutdown.cancel();
            if let Some(mut tasks) = monitor_tasks.take() {
                while tasks.join_next().await.is_some() {}
            }
            let closed = registry.close_all();
            tracing::info!(sessions_closed = closed, "closing sessions, saving state");
            // Let session tasks send their final frames.
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let Err(e) = store.save().await {
                tracing::warn!(error = %e, "final state save failed");
            }
            tracing::info!("vpsgate shut down");

            serve_result?;
        }
    }

    Ok(())
}
