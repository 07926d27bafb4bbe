//! Covenant Settlement Server
//!
//! Internal JSON RPC for the escrow and commission settlement engine, plus the
//! reconciliation sweep that drives deadline-based transitions.
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings
//! covenant-server
//!
//! # Start with a config file
//! covenant-server --config /etc/covenant/settlement.toml
//!
//! # Environment overrides
//! COVENANT__SERVER__PORT=9000 covenant-server
//! ```
//!
//! Sending `SIGHUP` reloads commission tiers and fraud rules from the same
//! configuration sources without a restart.

mod config;
mod error;
mod extractors;
mod handlers;
mod routes;
mod state;

use std::sync::Arc;

use clap::Parser;
use covenant_types::SystemClock;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LoggingConfig, ServerConfig};
use crate::state::AppState;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Covenant settlement server
#[derive(Parser, Debug)]
#[command(name = "covenant-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "COVENANT_CONFIG")]
    config: Option<String>,

    /// Host to bind to
    #[arg(long, env = "COVENANT_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "COVENANT_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COVENANT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "COVENANT_LOG_FORMAT")]
    log_format: Option<String>,

    /// Enable development mode (direct wallet deposits)
    #[arg(long, env = "COVENANT_DEV_MODE")]
    dev_mode: bool,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut server_config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut server_config);

    init_logging(&server_config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        dev_mode = args.dev_mode,
        "Starting Covenant settlement server"
    );

    let state = Arc::new(AppState::build(
        &server_config,
        Arc::new(SystemClock),
        args.dev_mode,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = if server_config.server.run_sweeper {
        Some(
            state
                .reconciler
                .clone()
                .spawn(server_config.reconciler.interval(), shutdown_rx.clone()),
        )
    } else {
        tracing::info!("Sweep worker disabled for this instance");
        None
    };

    let reloader = tokio::spawn(reload_on_hangup(
        state.clone(),
        args,
        shutdown_rx,
    ));

    let app = routes::create_router(state, server_config.server.request_timeout());
    let addr = server_config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "Server listening");

    let server_shutdown = shutdown_tx.subscribe();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped(server_shutdown))
            .await
    });

    tokio::select! {
        joined = &mut server => {
            // The listener failed before any shutdown was requested
            let _ = shutdown_tx.send(true);
            joined??;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            let grace = server_config.server.shutdown_timeout();
            tracing::info!(grace_secs = grace.as_secs(), "Draining in-flight requests");
            match tokio::time::timeout(grace, &mut server).await {
                Ok(joined) => joined??,
                Err(_) => {
                    tracing::warn!("Grace period elapsed; dropping remaining connections");
                    server.abort();
                }
            }
        }
    }

    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            tracing::error!(error = %e, "Sweep worker ended abnormally");
        }
    }
    if let Err(e) = reloader.await {
        tracing::error!(error = %e, "Reload task ended abnormally");
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}

// =============================================================================
// Initialization
// =============================================================================

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => {
            subscriber
                .with(fmt::layer().json().with_target(true))
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().pretty().with_target(true))
                .init();
        }
    }
}

// =============================================================================
// Config Reload
// =============================================================================

/// Reload commission tiers and fraud rules on SIGHUP
#[cfg(unix)]
async fn reload_on_hangup(state: Arc<AppState>, args: Args, mut shutdown: watch::Receiver<bool>) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!(error = %e, "SIGHUP handler unavailable; config reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                tracing::info!("Received SIGHUP, reloading configuration");
                let reloaded = ServerConfig::load(args.config.as_deref()).and_then(|mut config| {
                    args.apply(&mut config);
                    state.reload(&config)
                });
                match reloaded {
                    Ok(()) => tracing::info!("Commission tiers and fraud rules reloaded"),
                    Err(e) => tracing::error!(error = %e, "Config reload failed; keeping current settings"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_state: Arc<AppState>, _args: Args, _shutdown: watch::Receiver<bool>) {}

// =============================================================================
// Graceful Shutdown
// =============================================================================

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Resolves once the shutdown flag is set
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
