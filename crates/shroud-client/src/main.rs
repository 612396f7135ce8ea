//! `shroud`
//!
//! Keeps one encrypted session to the relay and serves local interception
//! points over a TCP bridge.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use shroud_client::{
    Bridge, Correlator, DirectFetch, HttpKeySource, KeySource, MultiplexingHub, ReqwestFetch,
    SessionConfig, SessionManager, StaticKeySource, WebSocketConnector,
};
use shroud_core::config::load_config;
use shroud_core::tracing_init::{default_filter, init_tracing};
use shroud_core::{Config, FallbackMode};

#[derive(Parser, Debug)]
#[command(name = "shroud")]
#[command(version, about = "Shroud - encrypted request tunnel client")]
struct Args {
    /// Config file layered over the global settings.json.
    #[arg(long, env = "SHROUD_CONFIG")]
    config: Option<PathBuf>,

    /// Relay WebSocket URL (ws:// or wss://).
    #[arg(long)]
    relay_url: Option<String>,

    /// URL of the relay public key document.
    #[arg(long)]
    key_url: Option<String>,

    /// Pinned relay public key document on disk.
    #[arg(long)]
    key_path: Option<PathBuf>,

    /// Local address interception points connect to.
    #[arg(long)]
    listen: Option<String>,

    /// Fallback when the tunnel cannot answer.
    #[arg(long, value_parser = ["synthetic", "passthrough"])]
    fallback: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SHROUD_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.relay_url {
            config.tunnel.relay_url.clone_from(url);
        }
        if let Some(url) = &self.key_url {
            config.tunnel.key_url = Some(url.clone());
        }
        if let Some(path) = &self.key_path {
            config.tunnel.key_path = Some(path.clone());
        }
        if let Some(addr) = &self.listen {
            config.bridge.listen_addr.clone_from(addr);
        }
        match self.fallback.as_deref() {
            Some("passthrough") => config.adapter.fallback = FallbackMode::Passthrough,
            Some(_) => config.adapter.fallback = FallbackMode::Synthetic,
            None => {}
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(
        &default_filter(&["shroud-client", "shroud-core"], &config.logging.level),
        config.logging.json,
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        relay_url = %config.tunnel.relay_url,
        listen = %config.bridge.listen_addr,
        pending_on_reconnect = ?config.tunnel.pending_on_reconnect,
        "Starting shroud"
    );

    let key_source: Arc<dyn KeySource> = if let Some(path) = &config.tunnel.key_path {
        info!(path = %path.display(), "Using pinned relay key");
        Arc::new(StaticKeySource::from_file(path)?)
    } else {
        let url = config.tunnel.resolved_key_url()?;
        info!(url = %url, "Fetching relay key per handshake");
        Arc::new(HttpKeySource::new(url)?)
    };

    let connector = Arc::new(WebSocketConnector::new(config.tunnel.relay_url.clone()));
    let correlator = Arc::new(Correlator::new(config.correlator.deadline()));
    let session = Arc::new(SessionManager::new(
        connector,
        key_source,
        Arc::clone(&correlator),
        SessionConfig::from(&config.tunnel),
    ));
    let hub = Arc::new(MultiplexingHub::new(Arc::clone(&session)));

    let direct: Option<Arc<dyn DirectFetch>> = match config.adapter.fallback {
        FallbackMode::Passthrough => Some(Arc::new(ReqwestFetch::new()?)),
        FallbackMode::Synthetic => None,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let session_handle = {
        let session = Arc::clone(&session);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            session.run(shutdown_rx).await;
        })
    };
    let sweeper_handle =
        correlator.spawn_sweeper(config.correlator.sweep_interval(), shutdown_rx.clone());

    let listener = TcpListener::bind(&config.bridge.listen_addr).await?;
    info!(addr = %config.bridge.listen_addr, "Bridge listening");
    let bridge = Bridge::new(hub, config.adapter.clone(), direct);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        () = bridge.serve(listener, shutdown_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = session_handle.await;
    let _ = sweeper_handle.await;

    info!("Shroud stopped");
    Ok(())
}
