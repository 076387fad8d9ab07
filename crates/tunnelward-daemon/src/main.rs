//! `tunnelward` Daemon
//!
//! Runs one supervised reverse tunnel built from the settings hierarchy and
//! command-line overrides, and logs its lifecycle until interrupted.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use tunnelward_core::config::load_config;
use tunnelward_core::tracing_init::{filter_for, init_tracing};
use tunnelward_core::{Config, Protocol};
use tunnelward_daemon::{TunnelEvent, TunnelSupervisor, settings};

#[derive(Parser, Debug)]
#[command(name = "tunnelward")]
#[command(version, about = "tunnelward - reverse tunnel client supervisor")]
struct Args {
    /// Settings file layered over the global settings
    #[arg(long, env = "TUNNELWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the bundled `client_<os>_<arch>` binaries
    #[arg(long, env = "TUNNELWARD_BIN_DIR")]
    bin_dir: Option<PathBuf>,

    /// Local address of the service to expose
    #[arg(long)]
    local_host: Option<String>,

    /// Local port of the service to expose
    #[arg(long)]
    local_port: Option<u16>,

    /// Relay server host
    #[arg(long, env = "TUNNELWARD_SERVER_ADDR")]
    server_addr: Option<String>,

    /// Relay server control port
    #[arg(long, env = "TUNNELWARD_SERVER_PORT")]
    server_port: Option<u16>,

    /// Proxy name registered with the relay
    #[arg(long, env = "TUNNELWARD_PROXY_NAME")]
    proxy_name: Option<String>,

    /// Requested public subdomain
    #[arg(long)]
    subdomain: Option<String>,

    /// Wire protocol between client and relay (tcp, kcp, quic, websocket)
    #[arg(long)]
    protocol: Option<Protocol>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "TUNNELWARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TUNNELWARD_LOG_JSON")]
    log_json: bool,

    /// Seconds to wait for the client to exit after SIGTERM before killing it.
    #[arg(long, env = "TUNNELWARD_TERMINATE_TIMEOUT")]
    terminate_timeout: Option<u64>,
}

impl Args {
    /// Layer command-line values over the loaded settings.
    fn apply(self, config: &mut Config) {
        let tunnel = &mut config.tunnel;
        if let Some(dir) = self.bin_dir {
            config.binary.dir = Some(dir);
        }
        if let Some(host) = self.local_host {
            tunnel.local_host = host;
        }
        if let Some(port) = self.local_port {
            tunnel.local_port = port;
        }
        if let Some(addr) = self.server_addr {
            tunnel.server_addr = addr;
        }
        if let Some(port) = self.server_port {
            tunnel.server_port = port;
        }
        if let Some(name) = self.proxy_name {
            tunnel.proxy_name = name;
        }
        if self.subdomain.is_some() {
            tunnel.subdomain = self.subdomain;
        }
        if let Some(protocol) = self.protocol {
            tunnel.protocol = protocol;
        }
        if let Some(level) = self.log_level {
            config.daemon.log_level = level;
        }
        if self.log_json {
            config.daemon.log_json = true;
        }
        if let Some(secs) = self.terminate_timeout {
            config.daemon.terminate_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();
    let explicit = args.config.take();
    let mut config = load_config(explicit.as_deref())?;
    args.apply(&mut config);

    init_tracing(
        &filter_for("tunnelward_daemon", &config.daemon.log_level),
        config.daemon.log_json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.tunnel.server_endpoint(),
        local = %config.tunnel.local_endpoint(),
        proxy = %config.tunnel.proxy_name,
        relays = config.failover.relays.len(),
        "Starting tunnelward"
    );

    let supervisor = TunnelSupervisor::new(settings::supervisor_options(&config)?);
    let events = tokio::spawn(log_events(supervisor.subscribe()));

    let status = supervisor.start(config.tunnel.clone()).await?;
    info!(phase = %status.phase, "Tunnel supervisor running");

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let status = supervisor.stop().await;
    drop(supervisor);
    events.abort();
    info!(phase = %status.phase, "tunnelward stopped");
    Ok(())
}

async fn log_events(mut rx: broadcast::Receiver<TunnelEvent>) {
    loop {
        match rx.recv().await {
            Ok(TunnelEvent::UrlDetected(url)) => {
                info!(url = %url.url, run_id = url.run_id, "Tunnel URL available");
            }
            Ok(TunnelEvent::ReconnectionAttempted(attempt)) => {
                info!(
                    seq = attempt.seq,
                    delay_ms = u64::try_from(attempt.delay.as_millis()).unwrap_or(u64::MAX),
                    class = ?attempt.classification,
                    outcome = ?attempt.outcome,
                    "Reconnection attempt"
                );
            }
            Ok(TunnelEvent::RelayChanged(relay)) => {
                warn!(relay = %relay, "Switched relay server");
            }
            Ok(TunnelEvent::RecoveryFailed { reason }) => {
                error!(reason = %reason, "Automatic recovery gave up");
            }
            Ok(event) => debug!(kind = event.kind(), "Tunnel event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event log lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
