//! Periodic end-to-end health checking.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::{Probe, ProbeTarget, TcpProbe};
use super::types::{HealthConfig, HealthState, HealthStatus};
use crate::events::{EventHub, TunnelEvent};
use crate::process::{ProcessStatus, TunnelUrlInfo};

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Probes the tunnel independently of whether the process is alive.
pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn Probe>,
    process_rx: watch::Receiver<Option<Arc<ProcessStatus>>>,
    url_rx: watch::Receiver<Option<Arc<TunnelUrlInfo>>>,
    health_tx: watch::Sender<Arc<HealthStatus>>,
    events: EventHub,
    task: Mutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        process_rx: watch::Receiver<Option<Arc<ProcessStatus>>>,
        url_rx: watch::Receiver<Option<Arc<TunnelUrlInfo>>>,
        events: EventHub,
    ) -> Self {
        let (health_tx, _) = watch::channel(Arc::new(HealthStatus::unknown()));
        Self {
            config,
            probe: Arc::new(TcpProbe),
            process_rx,
            url_rx,
            health_tx,
            events,
            task: Mutex::new(None),
        }
    }

    /// Replace the default TCP probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<HealthStatus> {
        Arc::clone(&self.health_tx.borrow())
    }

    pub fn watch_health(&self) -> watch::Receiver<Arc<HealthStatus>> {
        self.health_tx.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Run a single check and publish its result.
    pub async fn check_now(&self) -> Arc<HealthStatus> {
        let process = self.process_rx.borrow().clone();
        let url = self.url_rx.borrow().clone();
        let mut status = self.evaluate(process.as_deref(), url.as_deref()).await;

        let previous = self.status();
        status.consecutive_failures = if status.state == HealthState::Unhealthy {
            if previous.run_id == status.run_id {
                previous.consecutive_failures.saturating_add(1)
            } else {
                1
            }
        } else {
            0
        };

        match status.state {
            HealthState::Unhealthy => warn!(
                run_id = ?status.run_id,
                target = ?status.target,
                failures = status.consecutive_failures,
                message = ?status.message,
                "Health check failed"
            ),
            HealthState::Degraded => info!(
                run_id = ?status.run_id,
                latency = ?status.latency,
                "Tunnel reachable but slow"
            ),
            _ => debug!(run_id = ?status.run_id, state = ?status.state, "Health check"),
        }
        self.publish(status)
    }

    /// Start checking every `interval`, replacing any running loop.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(interval, token.clone()));
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(MonitorTask { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
            previous.handle.abort();
        }
        info!(interval_secs = interval.as_secs_f64(), "Health monitoring started");
    }

    fn take_task(&self) -> Option<MonitorTask> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Cancel the loop without waiting for it to finish.
    pub fn abort_monitoring(&self) {
        if let Some(task) = self.take_task() {
            task.token.cancel();
            task.handle.abort();
        }
    }

    /// Stop the loop and reset the status to `Unknown`.
    pub async fn stop_monitoring(&self) {
        if let Some(task) = self.take_task() {
            task.token.cancel();
            task.handle.abort();
            let _ = task.handle.await;
            info!("Health monitoring stopped");
        }
        self.publish(HealthStatus::unknown());
    }

    async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut url_rx = self.url_rx.clone();
        url_rx.mark_unchanged();

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_now().await;
                }
                changed = url_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let has_url = url_rx.borrow_and_update().is_some();
                    if has_url {
                        self.check_now().await;
                        ticker.reset();
                    } else {
                        self.publish(HealthStatus {
                            run_id: self.process_rx.borrow().as_ref().map(|p| p.run_id),
                            ..HealthStatus::unknown()
                        });
                    }
                }
            }
        }
        debug!("Health monitor loop exited");
    }

    async fn evaluate(
        &self,
        process: Option<&ProcessStatus>,
        url: Option<&TunnelUrlInfo>,
    ) -> HealthStatus {
        let now = Some(SystemTime::now());
        let Some(process) = process.filter(|p| p.is_running()) else {
            return HealthStatus {
                checked_at: now,
                run_id: process.map(|p| p.run_id),
                message: Some("tunnel client not running".into()),
                ..HealthStatus::unknown()
            };
        };
        let run_id = Some(process.run_id);

        let Some(url) = url.filter(|u| u.run_id == process.run_id) else {
            let overdue = process
                .uptime()
                .is_some_and(|uptime| uptime >= self.config.url_timeout);
            return HealthStatus {
                state: if overdue {
                    HealthState::Unhealthy
                } else {
                    HealthState::Unknown
                },
                checked_at: now,
                run_id,
                message: Some(if overdue {
                    "no tunnel URL reported".into()
                } else {
                    "waiting for tunnel URL".into()
                }),
                ..HealthStatus::unknown()
            };
        };

        let target = ProbeTarget::from_url(&url.url).or_else(|| {
            let fallback = self
                .config
                .fallback
                .clone()
                .unwrap_or_else(|| process.config.local_endpoint());
            debug!(url = %url.url, fallback = %fallback, "URL not probeable, using fallback");
            ProbeTarget::from_endpoint(&fallback)
        });
        let Some(target) = target else {
            return HealthStatus {
                state: HealthState::Unhealthy,
                checked_at: now,
                run_id,
                message: Some(format!("no probe target for {}", url.url)),
                ..HealthStatus::unknown()
            };
        };

        match self.probe.probe(&target, self.config.timeout).await {
            Ok(latency) => HealthStatus {
                state: if latency > self.config.degraded_latency {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                },
                checked_at: Some(SystemTime::now()),
                latency: Some(latency),
                target: Some(target.to_string()),
                run_id,
                consecutive_failures: 0,
                message: None,
            },
            Err(e) => HealthStatus {
                state: HealthState::Unhealthy,
                checked_at: Some(SystemTime::now()),
                latency: None,
                target: Some(target.to_string()),
                run_id,
                consecutive_failures: 0,
                message: Some(e.to_string()),
            },
        }
    }

    fn publish(&self, status: HealthStatus) -> Arc<HealthStatus> {
        let status = Arc::new(status);
        self.health_tx.send_replace(Arc::clone(&status));
        self.events
            .publish(TunnelEvent::HealthChecked(Arc::clone(&status)));
        status
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tunnelward_core::TunnelConfig;

    use super::*;
    use crate::error::{Result, TunnelError};

    struct ScriptedProbe {
        results: Vec<Result<Duration>>,
        calls: AtomicUsize,
        targets: Mutex<Vec<ProbeTarget>>,
    }

    impl ScriptedProbe {
        fn new(results: Vec<Result<Duration>>) -> Arc<Self> {
            Arc::new(Self {
                results,
                calls: AtomicUsize::new(0),
                targets: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, target: &ProbeTarget, _timeout: Duration) -> Result<Duration> {
            self.targets.lock().unwrap().push(target.clone());
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.results.get(i.min(self.results.len() - 1)).unwrap() {
                Ok(d) => Ok(*d),
                Err(e) => Err(TunnelError::HealthCheckFailed(e.to_string())),
            }
        }
    }

    struct Fixture {
        process_tx: watch::Sender<Option<Arc<ProcessStatus>>>,
        url_tx: watch::Sender<Option<Arc<TunnelUrlInfo>>>,
        monitor: Arc<HealthMonitor>,
    }

    fn fixture(config: HealthConfig, probe: Arc<dyn Probe>) -> Fixture {
        let (process_tx, process_rx) = watch::channel(None);
        let (url_tx, url_rx) = watch::channel(None);
        let monitor = Arc::new(
            HealthMonitor::new(config, process_rx, url_rx, EventHub::default()).with_probe(probe),
        );
        Fixture {
            process_tx,
            url_tx,
            monitor,
        }
    }

    fn running(run_id: u64) -> Arc<ProcessStatus> {
        let config = TunnelConfig::new("127.0.0.1", 5000, "relay.example", 7000, "p1");
        Arc::new(ProcessStatus::starting(run_id, config).running(Some(100)))
    }

    fn url(run_id: u64, raw: &str) -> Arc<TunnelUrlInfo> {
        Arc::new(TunnelUrlInfo {
            url: raw.into(),
            run_id,
            detected_at: SystemTime::now(),
        })
    }

    #[tokio::test]
    async fn unknown_without_process_or_url() {
        let f = fixture(HealthConfig::default(), ScriptedProbe::new(vec![Ok(Duration::ZERO)]));
        assert_eq!(f.monitor.check_now().await.state, HealthState::Unknown);

        f.process_tx.send_replace(Some(running(1)));
        let status = f.monitor.check_now().await;
        assert_eq!(status.state, HealthState::Unknown);
        assert_eq!(status.run_id, Some(1));
    }

    #[tokio::test]
    async fn missing_url_past_timeout_is_unhealthy() {
        let config = HealthConfig {
            url_timeout: Duration::ZERO,
            ..HealthConfig::default()
        };
        let f = fixture(config, ScriptedProbe::new(vec![Ok(Duration::ZERO)]));
        f.process_tx.send_replace(Some(running(1)));
        let status = f.monitor.check_now().await;
        assert_eq!(status.state, HealthState::Unhealthy);
        assert_eq!(status.message.as_deref(), Some("no tunnel URL reported"));
    }

    #[tokio::test]
    async fn classifies_latency() {
        let probe = ScriptedProbe::new(vec![
            Ok(Duration::from_millis(10)),
            Ok(Duration::from_secs(2)),
        ]);
        let f = fixture(HealthConfig::default(), probe);
        f.process_tx.send_replace(Some(running(1)));
        f.url_tx.send_replace(Some(url(1, "https://p1.relay.example")));

        let first = f.monitor.check_now().await;
        assert_eq!(first.state, HealthState::Healthy);
        assert_eq!(first.target.as_deref(), Some("p1.relay.example:443"));
        assert_eq!(f.monitor.check_now().await.state, HealthState::Degraded);
    }

    #[tokio::test]
    async fn counts_consecutive_failures_per_run() {
        let probe = ScriptedProbe::new(vec![Err(TunnelError::HealthCheckFailed("down".into()))]);
        let f = fixture(HealthConfig::default(), probe);
        f.process_tx.send_replace(Some(running(1)));
        f.url_tx.send_replace(Some(url(1, "https://p1.relay.example")));

        assert_eq!(f.monitor.check_now().await.consecutive_failures, 1);
        assert_eq!(f.monitor.check_now().await.consecutive_failures, 2);

        f.process_tx.send_replace(Some(running(2)));
        f.url_tx.send_replace(Some(url(2, "https://p1.relay.example")));
        assert_eq!(f.monitor.check_now().await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn unparseable_url_falls_back_to_local_endpoint() {
        let probe = ScriptedProbe::new(vec![Ok(Duration::ZERO)]);
        let f = fixture(HealthConfig::default(), Arc::clone(&probe) as Arc<dyn Probe>);
        f.process_tx.send_replace(Some(running(1)));
        f.url_tx.send_replace(Some(url(1, "tcp://relay.example")));

        assert_eq!(f.monitor.check_now().await.state, HealthState::Healthy);
        assert_eq!(
            probe.targets.lock().unwrap().as_slice(),
            &[ProbeTarget::new("127.0.0.1", 5000)]
        );
    }

    #[tokio::test]
    async fn url_from_previous_run_is_ignored() {
        let f = fixture(HealthConfig::default(), ScriptedProbe::new(vec![Ok(Duration::ZERO)]));
        f.process_tx.send_replace(Some(running(2)));
        f.url_tx.send_replace(Some(url(1, "https://old.relay.example")));
        assert_eq!(f.monitor.check_now().await.state, HealthState::Unknown);
    }

    #[tokio::test]
    async fn new_url_triggers_immediate_check() {
        let f = fixture(HealthConfig::default(), ScriptedProbe::new(vec![Ok(Duration::ZERO)]));
        f.process_tx.send_replace(Some(running(1)));
        let mut health_rx = f.monitor.watch_health();
        f.monitor.start_monitoring(Duration::from_secs(3600));

        f.url_tx.send_replace(Some(url(1, "https://p1.relay.example")));
        tokio::time::timeout(Duration::from_secs(5), async {
            while health_rx.borrow_and_update().state != HealthState::Healthy {
                health_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        f.url_tx.send_replace(None);
        tokio::time::timeout(Duration::from_secs(5), async {
            while health_rx.borrow_and_update().state != HealthState::Unknown {
                health_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert!(f.monitor.is_monitoring());
        f.monitor.stop_monitoring().await;
        assert!(!f.monitor.is_monitoring());
        assert_eq!(f.monitor.status().state, HealthState::Unknown);
    }
}
