//! Control surface over the tunnel components.
//!
//! [`TunnelSupervisor`] wires the binary manager, process supervisor, health
//! monitor, reconnection and failover managers and the status aggregator onto
//! one event hub, and exposes the operations an outer layer (HTTP API, CLI)
//! maps onto directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnelward_core::{RelayServerInfo, TunnelConfig};

use crate::binary::{BinaryInfo, BinaryManager, Platform};
use crate::error::{Result, TunnelError};
use crate::events::{DEFAULT_EVENT_CAPACITY, EventHub, TunnelEvent};
use crate::failover::{FailoverManager, SelectionStrategy};
use crate::generator;
use crate::health::{HealthConfig, HealthMonitor, HealthStatus, Probe};
use crate::process::{
    DEFAULT_TERMINATE_TIMEOUT, ProcessState, ProcessStatus, ProcessSupervisor, TunnelUrlInfo,
};
use crate::reconnect::{ReconnectPolicy, ReconnectionAttempt, ReconnectionManager};
use crate::status::{CompositeStatus, StatusAggregator};

/// Construction options for a [`TunnelSupervisor`].
#[derive(Clone)]
pub struct SupervisorOptions {
    pub binary_dir: PathBuf,
    pub verify_checksum: bool,
    /// Platform override; `None` detects the host.
    pub platform: Option<Platform>,
    /// Grace period between SIGTERM and a forced kill.
    pub terminate_timeout: Duration,
    pub health: HealthConfig,
    pub reconnect: ReconnectPolicy,
    /// Failover candidates in priority order.
    pub relays: Vec<RelayServerInfo>,
    pub selection: SelectionStrategy,
    /// Replaces the TCP connect probe.
    pub probe: Option<Arc<dyn Probe>>,
    pub event_capacity: usize,
}

impl SupervisorOptions {
    pub fn new(binary_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_dir: binary_dir.into(),
            verify_checksum: false,
            platform: Platform::current(),
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            health: HealthConfig::default(),
            reconnect: ReconnectPolicy::default(),
            relays: Vec::new(),
            selection: SelectionStrategy::default(),
            probe: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn with_relays(mut self, relays: Vec<RelayServerInfo>, selection: SelectionStrategy) -> Self {
        self.relays = relays;
        self.selection = selection;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("binary_dir", &self.binary_dir)
            .field("verify_checksum", &self.verify_checksum)
            .field("platform", &self.platform)
            .field("terminate_timeout", &self.terminate_timeout)
            .field("health", &self.health)
            .field("reconnect", &self.reconnect)
            .field("relays", &self.relays)
            .field("selection", &self.selection)
            .field("probe", &self.probe.as_ref().map(|_| ".."))
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

/// Supervises one tunnel end to end.
///
/// Must be created inside a tokio runtime: construction spawns the
/// reconnection and status aggregation loops, which are aborted on drop.
pub struct TunnelSupervisor {
    events: EventHub,
    binary: Arc<BinaryManager>,
    process: Arc<ProcessSupervisor>,
    health: Arc<HealthMonitor>,
    reconnect: Arc<ReconnectionManager>,
    failover: Arc<FailoverManager>,
    status: Arc<StatusAggregator>,
    control: tokio::sync::Mutex<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl TunnelSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let events = EventHub::new(options.event_capacity);
        let binary = Arc::new(
            BinaryManager::new(options.binary_dir)
                .with_checksum_verification(options.verify_checksum)
                .with_platform(options.platform),
        );
        let process = Arc::new(
            ProcessSupervisor::new(Arc::clone(&binary), events.clone())
                .with_terminate_timeout(options.terminate_timeout),
        );

        let mut health = HealthMonitor::new(
            options.health,
            process.watch_status(),
            process.watch_url(),
            events.clone(),
        );
        if let Some(probe) = options.probe {
            health = health.with_probe(probe);
        }
        let health = Arc::new(health);

        let failover = Arc::new(FailoverManager::new(options.relays, options.selection));
        let reconnect = Arc::new(ReconnectionManager::new(
            options.reconnect,
            Arc::clone(&process),
            Arc::clone(&failover),
            events.clone(),
        ));
        let status = Arc::new(StatusAggregator::new(
            process.watch_status(),
            process.watch_url(),
            health.watch_health(),
            failover.watch_current(),
            reconnect.watch_state(),
        ));

        let tasks = vec![reconnect.spawn(), status.spawn()];
        Self {
            events,
            binary,
            process,
            health,
            reconnect,
            failover,
            status,
            control: tokio::sync::Mutex::new(()),
            tasks,
        }
    }

    /// Start the tunnel and begin monitoring it.
    ///
    /// A no-op returning the current status while a tunnel is active.
    pub async fn start(&self, config: TunnelConfig) -> Result<CompositeStatus> {
        generator::validate(&config)?;
        let _guard = self.control.lock().await;

        if let Some(active) = self.active_process() {
            debug!(run_id = active.run_id, "Tunnel already active");
            return Ok(self.status());
        }

        self.reconnect.resume();
        let relay = self.failover.begin(&config);
        info!(relay = %relay, local = %config.local_endpoint(), "Starting tunnel");
        if let Err(e) = self.process.start(config).await {
            self.reconnect.suspend();
            warn!(error = %e, "Tunnel failed to start");
            return Err(e);
        }
        self.health.start_monitoring(self.health.config().interval);
        Ok(self.status())
    }

    /// Stop the tunnel. Pending reconnection is cancelled first, so no
    /// restart can follow the stop.
    pub async fn stop(&self) -> CompositeStatus {
        let _guard = self.control.lock().await;
        self.reconnect.suspend();
        self.health.stop_monitoring().await;
        if let Some(status) = self.process.stop().await {
            info!(run_id = status.run_id, "Tunnel stopped");
        }
        self.status()
    }

    /// Restart with the most recent config and fresh recovery counters.
    pub async fn restart(&self) -> Result<CompositeStatus> {
        let _guard = self.control.lock().await;
        let config = self.process.last_config().ok_or(TunnelError::NoPriorConfig)?;

        self.reconnect.resume();
        self.failover.begin(&config);
        if let Err(e) = self.process.restart_with(config).await {
            self.reconnect.suspend();
            warn!(error = %e, "Tunnel failed to restart");
            return Err(e);
        }
        self.health.start_monitoring(self.health.config().interval);
        Ok(self.status())
    }

    /// Composite status folded from the latest snapshots.
    pub fn status(&self) -> CompositeStatus {
        self.status.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<Arc<CompositeStatus>> {
        self.status.watch_status()
    }

    pub fn tunnel_url(&self) -> Option<Arc<TunnelUrlInfo>> {
        self.process.tunnel_url()
    }

    pub fn process_status(&self) -> Option<Arc<ProcessStatus>> {
        self.process.status()
    }

    pub fn health(&self) -> Arc<HealthStatus> {
        self.health.status()
    }

    /// Probe immediately instead of waiting for the next tick.
    pub async fn check_health(&self) -> Arc<HealthStatus> {
        self.health.check_now().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub fn reconnection_history(&self) -> Vec<ReconnectionAttempt> {
        self.reconnect.history()
    }

    /// Failover candidates with their last-known health.
    pub fn relays(&self) -> Vec<RelayServerInfo> {
        self.failover.candidates()
    }

    pub fn current_relay(&self) -> Option<RelayServerInfo> {
        self.failover.current()
    }

    pub fn update_relay_score(&self, address: &str, port: u16, score: f64) -> bool {
        self.failover.update_score(address, port, score)
    }

    pub fn binary_info(&self) -> Option<Arc<BinaryInfo>> {
        self.binary.cached_info()
    }

    pub async fn revalidate_binary(&self) -> Result<Arc<BinaryInfo>> {
        self.binary.revalidate().await
    }

    /// Accept a replaced client binary after a failed revalidation.
    pub fn reset_binary(&self) {
        self.binary.reset();
    }

    /// Client processes spawned so far.
    pub fn spawn_count(&self) -> u64 {
        self.process.spawn_count()
    }

    fn active_process(&self) -> Option<Arc<ProcessStatus>> {
        self.process
            .status()
            .filter(|s| s.state != ProcessState::Stopped)
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        self.reconnect.suspend();
        self.health.abort_monitoring();
        for task in &self.tasks {
            task.abort();
        }
    }
}
