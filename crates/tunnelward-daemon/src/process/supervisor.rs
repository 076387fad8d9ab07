//! Single-slot supervisor for the tunnel client process.
//!
//! At most one client runs per supervisor. Lifecycle operations (`start`,
//! `stop`, `restart*`) are serialized by an async lock; the process slot
//! itself sits behind a short synchronous lock that is never held across an
//! await. Every transition publishes a fresh [`ProcessStatus`] while the slot
//! lock is held, so subscribers observe transitions in order.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnelward_core::TunnelConfig;

use super::output::{OutputTail, extract_url};
use super::types::{ExitReason, ProcessState, ProcessStatus, TunnelUrlInfo};
use crate::binary::BinaryManager;
use crate::error::{Result, TunnelError};
use crate::events::{EventHub, TunnelEvent};
use crate::generator;

/// Grace period between SIGTERM and a forced kill.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the exit monitor waits for the output readers to drain.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Target under which client output is re-logged.
const CLIENT_LOG_TARGET: &str = "tunnelward::client";

struct RunHandle {
    run_id: u64,
    pid: Option<u32>,
    /// Asks the exit monitor to send SIGTERM while it still owns the child.
    term_tx: Option<oneshot::Sender<()>>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<Option<i32>>>,
}

#[derive(Default)]
struct Slot {
    run_seq: u64,
    current: Option<RunHandle>,
    last_config: Option<TunnelConfig>,
}

/// State shared with the per-run reader and monitor tasks.
struct Shared {
    slot: Mutex<Slot>,
    status_tx: watch::Sender<Option<Arc<ProcessStatus>>>,
    url_tx: watch::Sender<Option<Arc<TunnelUrlInfo>>>,
    events: EventHub,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a transition. Callers hold the slot lock.
    fn publish_status(&self, _slot: &Slot, status: ProcessStatus) -> Arc<ProcessStatus> {
        let status = Arc::new(status);
        self.status_tx.send_replace(Some(Arc::clone(&status)));
        self.events
            .publish(TunnelEvent::StatusChanged(Arc::clone(&status)));
        status
    }

    fn current_snapshot(&self, run_id: u64) -> Option<Arc<ProcessStatus>> {
        self.status_tx
            .borrow()
            .as_ref()
            .filter(|s| s.run_id == run_id)
            .cloned()
    }

    fn publish_url(&self, run_id: u64, url: String) {
        let slot = self.lock();
        if slot.current.as_ref().map(|h| h.run_id) != Some(run_id) {
            return;
        }
        let unchanged = self
            .url_tx
            .borrow()
            .as_ref()
            .is_some_and(|u| u.run_id == run_id && u.url == url);
        if unchanged {
            return;
        }
        info!(run_id, url = %url, "Tunnel URL detected");
        let info = Arc::new(TunnelUrlInfo {
            url,
            run_id,
            detected_at: SystemTime::now(),
        });
        self.url_tx.send_replace(Some(Arc::clone(&info)));
        self.events.publish(TunnelEvent::UrlDetected(info));
        drop(slot);
    }

    /// Record an exit nobody asked for. Stale runs are ignored.
    fn finish_unexpected(&self, run_id: u64, exit_code: Option<i32>, output_tail: Vec<String>) {
        let mut slot = self.lock();
        if slot.current.as_ref().map(|h| h.run_id) != Some(run_id) {
            return;
        }
        slot.current = None;
        let Some(previous) = self.current_snapshot(run_id) else {
            return;
        };
        warn!(run_id, pid = ?previous.pid, exit_code, "Tunnel client exited unexpectedly");
        self.url_tx.send_replace(None);
        let status = self.publish_status(&slot, previous.stopped(exit_code, ExitReason::Unexpected));
        self.events.publish(TunnelEvent::ProcessExited {
            status,
            output_tail,
        });
        drop(slot);
    }
}

/// Owns the lifecycle of the external tunnel client.
pub struct ProcessSupervisor {
    binary: Arc<BinaryManager>,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
    terminate_timeout: Duration,
    spawn_count: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(binary: Arc<BinaryManager>, events: EventHub) -> Self {
        let (status_tx, _) = watch::channel(None);
        let (url_tx, _) = watch::channel(None);
        Self {
            binary,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                status_tx,
                url_tx,
                events,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            spawn_count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Start the client. Returns once the process has a PID, not once it
    /// reports a URL. While a client is already active this returns its
    /// status without spawning another.
    pub async fn start(&self, config: TunnelConfig) -> Result<Arc<ProcessStatus>> {
        generator::validate(&config)?;
        let _guard = self.lifecycle.lock().await;

        if let Some(status) = self.active_status() {
            if status.config != config {
                warn!(run_id = status.run_id, "Start ignored: a tunnel with a different config is active");
            }
            debug!(run_id = status.run_id, "Start while active, returning current status");
            return Ok(status);
        }
        self.spawn_locked(config).await
    }

    /// Stop the client: SIGTERM, then a forced kill after the grace period.
    /// Returns the final status; a no-op when nothing is running.
    pub async fn stop(&self) -> Option<Arc<ProcessStatus>> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    /// Stop, then start again with the most recent config.
    pub async fn restart(&self) -> Result<Arc<ProcessStatus>> {
        self.restart_inner(None, None)
            .await?
            .ok_or(TunnelError::NoPriorConfig)
    }

    /// Stop, then start with a new config.
    pub async fn restart_with(&self, config: TunnelConfig) -> Result<Arc<ProcessStatus>> {
        self.restart_inner(Some(config), None)
            .await?
            .ok_or(TunnelError::NoPriorConfig)
    }

    /// Restart unless `token` is cancelled by the time the lifecycle lock is
    /// held. Returns `Ok(None)` when cancelled; nothing is stopped or spawned
    /// in that case.
    pub async fn restart_guarded(
        &self,
        config: Option<TunnelConfig>,
        token: &CancellationToken,
    ) -> Result<Option<Arc<ProcessStatus>>> {
        self.restart_inner(config, Some(token)).await
    }

    async fn restart_inner(
        &self,
        config: Option<TunnelConfig>,
        token: Option<&CancellationToken>,
    ) -> Result<Option<Arc<ProcessStatus>>> {
        if let Some(config) = &config {
            generator::validate(config)?;
        }
        let _guard = self.lifecycle.lock().await;

        if token.is_some_and(CancellationToken::is_cancelled) {
            debug!("Restart cancelled before it began");
            return Ok(None);
        }
        let config = match config {
            Some(config) => config,
            None => self
                .shared
                .lock()
                .last_config
                .clone()
                .ok_or(TunnelError::NoPriorConfig)?,
        };

        self.stop_locked().await;
        self.spawn_locked(config).await.map(Some)
    }

    /// Latest process snapshot; `None` before the first start.
    pub fn status(&self) -> Option<Arc<ProcessStatus>> {
        self.shared.status_tx.borrow().clone()
    }

    /// URL reported by the current run.
    pub fn tunnel_url(&self) -> Option<Arc<TunnelUrlInfo>> {
        self.shared.url_tx.borrow().clone()
    }

    pub fn last_config(&self) -> Option<TunnelConfig> {
        self.shared.lock().last_config.clone()
    }

    /// Run id of the active process, if any.
    pub fn current_run_id(&self) -> Option<u64> {
        self.shared.lock().current.as_ref().map(|h| h.run_id)
    }

    /// Processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    pub fn watch_status(&self) -> watch::Receiver<Option<Arc<ProcessStatus>>> {
        self.shared.status_tx.subscribe()
    }

    pub fn watch_url(&self) -> watch::Receiver<Option<Arc<TunnelUrlInfo>>> {
        self.shared.url_tx.subscribe()
    }

    fn active_status(&self) -> Option<Arc<ProcessStatus>> {
        self.status()
            .filter(|s| s.state != ProcessState::Stopped)
    }

    async fn spawn_locked(&self, config: TunnelConfig) -> Result<Arc<ProcessStatus>> {
        let binary = self.binary.ensure_binary().await?;
        let args = generator::build_arguments(&config);

        let starting = {
            let mut slot = self.shared.lock();
            slot.run_seq += 1;
            slot.last_config = Some(config.clone());
            let status = ProcessStatus::starting(slot.run_seq, config);
            self.shared.publish_status(&slot, status)
        };
        let run_id = starting.run_id;

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            run_id,
            binary = %binary.display(),
            server = %starting.config.server_endpoint(),
            local = %starting.config.local_endpoint(),
            proxy = %starting.config.proxy_name,
            "Spawning tunnel client"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let slot = self.shared.lock();
                self.shared.publish_status(
                    &slot,
                    ProcessStatus {
                        state: ProcessState::Stopped,
                        exited_at: Some(SystemTime::now()),
                        ..(*starting).clone()
                    },
                );
                drop(slot);
                warn!(run_id, error = %e, "Failed to spawn tunnel client");
                return Err(TunnelError::ProcessSpawnFailed(e.to_string()));
            }
        };
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        let pid = child.id();
        let tail = Arc::new(Mutex::new(OutputTail::default()));
        let (term_tx, term_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        // Readers and monitor are registered under the slot lock so they
        // cannot observe the run before it is current.
        let mut slot = self.shared.lock();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_output(
                Arc::clone(&self.shared),
                run_id,
                stdout,
                "stdout",
                Arc::clone(&tail),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_output(
                Arc::clone(&self.shared),
                run_id,
                stderr,
                "stderr",
                Arc::clone(&tail),
            )));
        }
        let monitor = tokio::spawn(monitor_exit(
            Arc::clone(&self.shared),
            run_id,
            child,
            term_rx,
            kill_rx,
            readers,
            tail,
        ));
        slot.current = Some(RunHandle {
            run_id,
            pid,
            term_tx: Some(term_tx),
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
        });
        let running = self.shared.publish_status(&slot, starting.running(pid));
        drop(slot);

        info!(run_id, pid, "Tunnel client running");
        Ok(running)
    }

    async fn stop_locked(&self) -> Option<Arc<ProcessStatus>> {
        let handle = self.shared.lock().current.take();
        let Some(mut handle) = handle else {
            return self.status();
        };
        let run_id = handle.run_id;
        info!(run_id, pid = handle.pid, "Stopping tunnel client");

        if let Some(tx) = handle.term_tx.take() {
            let _ = tx.send(());
        }

        let mut exit_code = None;
        if let Some(mut monitor) = handle.monitor.take() {
            match tokio::time::timeout(self.terminate_timeout, &mut monitor).await {
                Ok(joined) => exit_code = joined.ok().flatten(),
                Err(_) => {
                    warn!(
                        run_id,
                        timeout_secs = self.terminate_timeout.as_secs_f64(),
                        "Tunnel client ignored SIGTERM, killing"
                    );
                    if let Some(tx) = handle.kill_tx.take() {
                        let _ = tx.send(());
                    }
                    exit_code = monitor.await.ok().flatten();
                }
            }
        }

        let slot = self.shared.lock();
        self.shared.url_tx.send_replace(None);
        let stopped = self
            .shared
            .current_snapshot(run_id)
            .map(|prev| {
                self.shared
                    .publish_status(&slot, prev.stopped(exit_code, ExitReason::Requested))
            });
        drop(slot);
        info!(run_id, exit_code, "Tunnel client stopped");
        stopped
    }
}

/// Ask a child that has not been reaped yet to exit. Returns whether a
/// signal was sent; a reaped child has no PID and is left alone.
#[cfg(unix)]
fn terminate(child: &mut Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: `child.id()` is `Some` only until the child is reaped, so the
    // PID still belongs to our child.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, error = %err, "Failed to send SIGTERM");
        return false;
    }
    true
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> bool {
    child.id().is_some() && child.start_kill().is_ok()
}

/// Re-log client output, capture the tail, and scan stdout for URLs.
async fn read_output<R>(
    shared: Arc<Shared>,
    run_id: u64,
    stream: R,
    name: &'static str,
    tail: Arc<Mutex<OutputTail>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: CLIENT_LOG_TARGET, run_id, stream = name, "{line}");
        if name == "stdout"
            && let Some(url) = extract_url(&line)
        {
            shared.publish_url(run_id, url);
        }
        tail.lock().unwrap_or_else(PoisonError::into_inner).push(line);
    }
    debug!(run_id, stream = name, "Output reader finished");
}

/// Own the child until it exits and report exits nobody requested.
async fn monitor_exit(
    shared: Arc<Shared>,
    run_id: u64,
    mut child: Child,
    mut term_rx: oneshot::Receiver<()>,
    mut kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    tail: Arc<Mutex<OutputTail>>,
) -> Option<i32> {
    let mut term_open = true;
    let exit = loop {
        tokio::select! {
            status = child.wait() => break status,
            requested = &mut term_rx, if term_open => {
                term_open = false;
                if requested.is_ok() && terminate(&mut child) {
                    debug!(run_id, "Sent SIGTERM to tunnel client");
                }
            }
            _ = &mut kill_rx => {
                if let Err(e) = child.start_kill() {
                    warn!(run_id, error = %e, "Failed to kill tunnel client");
                }
                break child.wait().await;
            }
        }
    };
    let exit_code = match exit {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(run_id, error = %e, "Error waiting for tunnel client");
            None
        }
    };

    drain_readers(run_id, readers, READER_DRAIN_TIMEOUT).await;

    let output_tail = tail.lock().unwrap_or_else(PoisonError::into_inner).lines();
    shared.finish_unexpected(run_id, exit_code, output_tail);
    exit_code
}

/// Wait for the output readers to finish, aborting any still open after
/// `timeout` (a grandchild can keep the pipe alive).
async fn drain_readers(run_id: u64, readers: Vec<JoinHandle<()>>, timeout: Duration) {
    for mut reader in readers {
        if tokio::time::timeout(timeout, &mut reader).await.is_err() {
            debug!(run_id, "Output reader still open after exit, aborting");
            reader.abort();
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::binary::Platform;

    fn install_client(dir: &Path, script: &str) -> Arc<BinaryManager> {
        let platform = Platform::current().unwrap();
        let path = dir.join(platform.binary_name());
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Arc::new(BinaryManager::new(dir))
    }

    fn config() -> TunnelConfig {
        TunnelConfig::new("127.0.0.1", 5000, "relay.example", 7000, "p1")
    }

    async fn wait_for<F>(mut rx: watch::Receiver<Option<Arc<ProcessStatus>>>, pred: F) -> Arc<ProcessStatus>
    where
        F: Fn(&ProcessStatus) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(status) = rx.borrow_and_update().clone()
                    && pred(&status)
                {
                    return status;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn detects_url_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let binary = install_client(dir.path(), "echo \"proxy ready: https://p1.relay.example\"\nexec sleep 30");
        let supervisor = ProcessSupervisor::new(binary, EventHub::default());

        let status = supervisor.start(config()).await.unwrap();
        assert!(status.is_running());
        assert!(status.pid.is_some());

        let mut url_rx = supervisor.watch_url();
        let url = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(url) = url_rx.borrow_and_update().clone() {
                    return url;
                }
                url_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(url.url, "https://p1.relay.example");
        assert_eq!(url.run_id, status.run_id);

        let stopped = supervisor.stop().await.unwrap();
        assert_eq!(stopped.state, ProcessState::Stopped);
        assert_eq!(stopped.exit_reason, Some(ExitReason::Requested));
        assert!(supervisor.tunnel_url().is_none());
        assert!(supervisor.current_run_id().is_none());
    }

    #[tokio::test]
    async fn unexpected_exit_is_reported_with_tail() {
        let dir = tempfile::tempdir().unwrap();
        let binary = install_client(dir.path(), "echo 'dial tcp: connection refused' >&2\nexit 3");
        let events = EventHub::default();
        let mut rx = events.subscribe();
        let supervisor = ProcessSupervisor::new(binary, events);

        supervisor.start(config()).await.unwrap();
        let stopped = wait_for(supervisor.watch_status(), |s| s.state == ProcessState::Stopped).await;
        assert_eq!(stopped.exit_code, Some(3));
        assert_eq!(stopped.exit_reason, Some(ExitReason::Unexpected));

        let tail = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let TunnelEvent::ProcessExited { output_tail, .. } = rx.recv().await.unwrap() {
                    return output_tail;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(tail, vec!["dial tcp: connection refused"]);
    }

    #[tokio::test]
    async fn status_changes_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let binary = install_client(dir.path(), "exec sleep 30");
        let events = EventHub::default();
        let mut rx = events.subscribe();
        let supervisor = ProcessSupervisor::new(binary, events);

        supervisor.start(config()).await.unwrap();
        supervisor.stop().await;

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TunnelEvent::StatusChanged(status) = event {
                states.push(status.state);
            }
        }
        assert_eq!(
            states,
            vec![ProcessState::Starting, ProcessState::Running, ProcessState::Stopped]
        );
    }

    #[tokio::test]
    async fn sigterm_ignored_gets_killed() {
        let dir = tempfile::tempdir().unwrap();
        let binary = install_client(dir.path(), "trap '' TERM\nwhile true; do sleep 1; done");
        let supervisor = ProcessSupervisor::new(binary, EventHub::default())
            .with_terminate_timeout(Duration::from_millis(300));

        supervisor.start(config()).await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stopped.state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn cancelled_guarded_restart_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let binary = install_client(dir.path(), "exec sleep 30");
        let supervisor = ProcessSupervisor::new(binary, EventHub::default());
        supervisor.start(config()).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(supervisor.restart_guarded(None, &token).await.unwrap().is_none());
        assert_eq!(supervisor.spawn_count(), 1);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let binary = install_client(dir.path(), "exec sleep 30");
        let supervisor = ProcessSupervisor::new(binary, EventHub::default());

        let mut bad = config();
        bad.proxy_name = String::new();
        assert!(matches!(
            supervisor.start(bad).await.unwrap_err(),
            TunnelError::ConfigInvalid(_)
        ));
        assert_eq!(supervisor.spawn_count(), 0);
        assert!(supervisor.status().is_none());
    }

    #[tokio::test]
    async fn replaced_url_is_republished_once() {
        let dir = tempfile::tempdir().unwrap();
        let binary = install_client(
            dir.path(),
            "echo 'ready: https://p1.relay.example'\n\
             echo 'ready: https://p1.relay.example'\n\
             echo 'moved: https://p2.relay.example'\n\
             exec sleep 30",
        );
        let events = EventHub::default();
        let mut rx = events.subscribe();
        let supervisor = ProcessSupervisor::new(binary, events);
        let status = supervisor.start(config()).await.unwrap();

        let mut urls = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let TunnelEvent::UrlDetected(info) = rx.recv().await.unwrap() {
                    assert_eq!(info.run_id, status.run_id);
                    urls.push(info.url.clone());
                    if info.url.contains("p2") {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(urls, vec!["https://p1.relay.example", "https://p2.relay.example"]);
        assert_eq!(supervisor.tunnel_url().unwrap().url, "https://p2.relay.example");
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn reaped_child_is_not_signalled() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        assert!(child.id().is_none());
        assert!(!terminate(&mut child));
    }

    #[tokio::test]
    async fn running_child_is_terminated() {
        let mut child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        assert!(terminate(&mut child));
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.code().is_none());
    }

    #[tokio::test]
    async fn stuck_reader_is_aborted() {
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
        let reader = tokio::spawn(async move {
            let _dropped_tx = dropped_tx;
            std::future::pending::<()>().await;
        });

        drain_readers(1, vec![reader], Duration::from_millis(50)).await;

        // The sender is dropped only once the task is torn down.
        let closed = tokio::time::timeout(Duration::from_secs(5), dropped_rx)
            .await
            .unwrap();
        assert!(closed.is_err());
    }

    #[tokio::test]
    async fn exit_with_background_grandchild_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let binary = install_client(dir.path(), "sleep 5 &\necho 'lost connection'\nexit 1");
        let supervisor = ProcessSupervisor::new(binary, EventHub::default());

        supervisor.start(config()).await.unwrap();
        let stopped = wait_for(supervisor.watch_status(), |s| s.state == ProcessState::Stopped).await;
        assert_eq!(stopped.exit_code, Some(1));
        assert_eq!(stopped.exit_reason, Some(ExitReason::Unexpected));
    }
}

