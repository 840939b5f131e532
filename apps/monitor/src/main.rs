//! sessionlink monitor: keeps a session connection alive and logs every
//! notification the connection manager emits.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sessionlink_connection::{
    ChannelHandler, ConnectionEvent, ConnectionManager, ConnectionState,
};

use crate::config::MonitorConfig;

/// Connects to a backend session and logs connection state changes,
/// retries and inbound payloads.
#[derive(Parser)]
#[command(name = "sessionlink-monitor", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "SESSIONLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Candidate base URI; repeat to try several in order. Overrides the
    /// configuration file.
    #[arg(short = 'u', long = "uri")]
    uris: Vec<String>,

    /// Session id to resume.
    #[arg(long, env = "SESSIONLINK_SESSION_ID")]
    session_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MonitorConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => MonitorConfig::load().context("failed to load config")?,
    };
    if !cli.uris.is_empty() {
        config.base_uris = cli.uris;
    }
    if cli.session_id.is_some() {
        config.session_id = cli.session_id;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        candidates = ?config.base_uris,
        "starting sessionlink monitor"
    );

    let (handler, mut events) = ChannelHandler::new();
    let manager = ConnectionManager::new(config.connection_config()?, Arc::new(handler))?;
    manager.start()?;

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };
                if let Some(outcome) = log_event(event) {
                    break outcome;
                }
            }
        }
    };

    manager.shutdown().await?;
    info!("monitor stopped");
    result
}

/// Logs one notification. Returns the exit outcome once the connection is
/// gone for good.
fn log_event(event: ConnectionEvent) -> Option<anyhow::Result<()>> {
    match event {
        ConnectionEvent::StateChanged { state, error } => {
            match &error {
                Some(err) => warn!(state = %state, error = %err, "connection state changed"),
                None => info!(state = %state, "connection state changed"),
            }
            if state == ConnectionState::DisconnectedForever {
                error!("connection lost permanently");
                return Some(Err(anyhow::anyhow!(
                    "disconnected forever: {}",
                    error.unwrap_or_else(|| "no reason given".into())
                )));
            }
        }
        ConnectionEvent::Message(message) => {
            info!(seq = message.seq, len = message.data.len(), "message received");
        }
        ConnectionEvent::Retry {
            total_tries,
            error,
            delay,
        } => {
            warn!(
                total_tries,
                delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
                error = %error,
                "connection attempt failed"
            );
        }
        ConnectionEvent::HostConfig(host) => {
            info!(
                allowed_origins = host.allowed_origins.len(),
                metrics = host.metrics_url.is_some(),
                "host configuration received"
            );
        }
    }
    None
}
