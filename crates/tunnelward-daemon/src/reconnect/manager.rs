//! Reconnection orchestration.
//!
//! Listens for process exits and failed health checks, classifies them, and
//! restarts the client after a backoff delay. Weighted failures against one
//! relay accumulate; once they reach the policy maximum the manager fails
//! over to another relay instead of retrying locally. At most one restart is
//! pending at a time, and `suspend` cancels it before a deliberate stop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classify::classify_exit;
use super::policy::ReconnectPolicy;
use super::types::{
    AttemptOutcome, FailureClass, ReconnectionAttempt, RecoveryPhase, RecoveryState,
};
use crate::error::TunnelError;
use crate::events::{EventHub, TunnelEvent};
use crate::failover::FailoverManager;
use crate::health::{HealthState, HealthStatus};
use crate::process::{ProcessStatus, ProcessSupervisor};

struct Pending {
    id: u64,
    /// Run whose failure scheduled this work; events for it are ignored.
    failed_run: u64,
    /// History entry this restart belongs to; `None` for failover.
    seq: Option<u32>,
    token: CancellationToken,
}

struct ManagerState {
    suspended: bool,
    attempt: u32,
    restarts: u32,
    phase: RecoveryPhase,
    history: VecDeque<ReconnectionAttempt>,
    pending: Option<Pending>,
    next_pending_id: u64,
}

impl ManagerState {
    fn attempt_mut(&mut self, seq: u32) -> Option<&mut ReconnectionAttempt> {
        self.history.iter_mut().rev().find(|a| a.seq == seq)
    }

    fn set_outcome(&mut self, seq: u32, outcome: AttemptOutcome) -> Option<ReconnectionAttempt> {
        let attempt = self.attempt_mut(seq)?;
        attempt.outcome = outcome;
        Some(attempt.clone())
    }

    fn clear_pending(&mut self, id: u64) {
        if self.pending.as_ref().is_some_and(|p| p.id == id) {
            self.pending = None;
        }
    }
}

/// Restarts the client on failure and escalates to relay failover.
pub struct ReconnectionManager {
    policy: ReconnectPolicy,
    process: Arc<ProcessSupervisor>,
    failover: Arc<FailoverManager>,
    events: EventHub,
    state: Mutex<ManagerState>,
    recovery_tx: watch::Sender<RecoveryState>,
}

impl ReconnectionManager {
    /// New manager, initially suspended.
    pub fn new(
        policy: ReconnectPolicy,
        process: Arc<ProcessSupervisor>,
        failover: Arc<FailoverManager>,
        events: EventHub,
    ) -> Self {
        let (recovery_tx, _) = watch::channel(RecoveryState {
            max_attempts: policy.max_attempts,
            ..RecoveryState::default()
        });
        Self {
            policy,
            process,
            failover,
            events,
            state: Mutex::new(ManagerState {
                suspended: true,
                attempt: 0,
                restarts: 0,
                phase: RecoveryPhase::Idle,
                history: VecDeque::new(),
                pending: None,
                next_pending_id: 0,
            }),
            recovery_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Subscribe to the event hub and react to failures until aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let rx = self.events.subscribe();
        tokio::spawn(Arc::clone(self).run(rx))
    }

    async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<TunnelEvent>) {
        loop {
            match rx.recv().await {
                Ok(TunnelEvent::ProcessExited {
                    status,
                    output_tail,
                }) => self.on_process_exited(&status, &output_tail),
                Ok(TunnelEvent::HealthChecked(health)) => self.on_health_checked(&health),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Reconnection manager lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Enable automatic recovery with fresh counters.
    pub fn resume(&self) {
        let mut state = self.lock();
        if let Some(pending) = state.pending.take() {
            pending.token.cancel();
        }
        state.suspended = false;
        state.attempt = 0;
        state.restarts = 0;
        state.phase = RecoveryPhase::Idle;
        state.history.clear();
        self.publish_state(&state);
        drop(state);
        debug!("Reconnection resumed");
    }

    /// Disable automatic recovery and cancel any pending restart.
    pub fn suspend(&self) {
        let mut state = self.lock();
        state.suspended = true;
        let cancelled = state.pending.take().and_then(|pending| {
            pending.token.cancel();
            pending
                .seq
                .and_then(|seq| state.set_outcome(seq, AttemptOutcome::Cancelled))
        });
        state.attempt = 0;
        state.restarts = 0;
        state.phase = RecoveryPhase::Idle;
        self.publish_state(&state);
        drop(state);

        if let Some(attempt) = cancelled {
            info!(seq = attempt.seq, "Pending reconnection cancelled");
            self.events
                .publish(TunnelEvent::ReconnectionAttempted(attempt));
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.recovery_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<RecoveryState> {
        self.recovery_tx.subscribe()
    }

    /// Attempts in the current failover cycle, oldest first.
    pub fn history(&self) -> Vec<ReconnectionAttempt> {
        self.lock().history.iter().cloned().collect()
    }

    fn publish_state(&self, state: &ManagerState) {
        self.recovery_tx.send_replace(RecoveryState {
            phase: state.phase.clone(),
            attempt: state.attempt,
            max_attempts: self.policy.max_attempts,
        });
    }

    fn on_process_exited(self: &Arc<Self>, status: &ProcessStatus, output_tail: &[String]) {
        let class = classify_exit(status.exit_code, output_tail);
        let detail = output_tail.last().map_or_else(
            || TunnelError::ProcessExitedUnexpectedly {
                code: status.exit_code,
            }
            .to_string(),
            |line| format!("exit code {:?}: {line}", status.exit_code),
        );
        self.on_failure(status.run_id, class, &detail);
    }

    fn on_health_checked(self: &Arc<Self>, health: &HealthStatus) {
        let Some(run_id) = health.run_id else {
            return;
        };
        match health.state {
            HealthState::Unhealthy => {
                let detail = health
                    .message
                    .clone()
                    .unwrap_or_else(|| "health check failed".into());
                self.on_failure(run_id, FailureClass::Transient, &detail);
            }
            HealthState::Healthy | HealthState::Degraded => self.on_recovered(run_id),
            HealthState::Unknown => {}
        }
    }

    fn is_current_run(&self, run_id: u64) -> bool {
        self.process.status().map(|s| s.run_id) == Some(run_id)
    }

    fn on_recovered(&self, run_id: u64) {
        if !self.is_current_run(run_id) {
            return;
        }
        let mut state = self.lock();
        if state.suspended {
            return;
        }
        let mut recovered = Vec::new();
        if let Some(pending) = state.pending.as_ref().filter(|p| p.failed_run == run_id && p.seq.is_some()) {
            // The failed run came back before its restart fired.
            pending.token.cancel();
            let seq = pending.seq;
            state.pending = None;
            recovered.extend(seq.and_then(|s| state.set_outcome(s, AttemptOutcome::Recovered)));
        }
        if let Some(last) = state.history.back_mut()
            && last.outcome == AttemptOutcome::Restarted
        {
            last.outcome = AttemptOutcome::Recovered;
            recovered.push(last.clone());
        }
        let was_recovering = state.attempt > 0 || state.phase != RecoveryPhase::Idle;
        if state.pending.is_none() && !matches!(state.phase, RecoveryPhase::Failed { .. }) {
            state.attempt = 0;
            state.restarts = 0;
            state.phase = RecoveryPhase::Idle;
        }
        self.publish_state(&state);
        drop(state);

        self.failover.mark_current_healthy();
        if was_recovering {
            info!(run_id, "Tunnel recovered");
        }
        for attempt in recovered {
            self.events
                .publish(TunnelEvent::ReconnectionAttempted(attempt));
        }
    }

    fn on_failure(self: &Arc<Self>, run_id: u64, class: FailureClass, detail: &str) {
        if !self.is_current_run(run_id) {
            debug!(run_id, "Ignoring failure of a stale run");
            return;
        }
        let mut state = self.lock();
        if state.suspended || matches!(state.phase, RecoveryPhase::Failed { .. }) {
            return;
        }
        if state.pending.as_ref().is_some_and(|p| run_id <= p.failed_run) {
            debug!(run_id, "Recovery already scheduled for this run");
            return;
        }

        if class == FailureClass::Fatal {
            let reason = format!("fatal client failure: {detail}");
            state.phase = RecoveryPhase::Failed {
                reason: reason.clone(),
            };
            self.publish_state(&state);
            drop(state);
            error!(run_id, reason = %reason, "Not retrying tunnel client");
            self.events.publish(TunnelEvent::RecoveryFailed { reason });
            return;
        }

        let weight = match class {
            FailureClass::ServerUnreachable => self.policy.unreachable_weight.max(1),
            _ => 1,
        };
        state.attempt = state.attempt.saturating_add(weight);
        // The previous restart produced this run, even if its task has not
        // recorded the outcome yet.
        if let Some(last) = state.history.back_mut()
            && matches!(last.outcome, AttemptOutcome::Restarted | AttemptOutcome::Pending)
        {
            last.outcome = AttemptOutcome::Failed;
        }

        let token = CancellationToken::new();
        let id = state.next_pending_id;
        state.next_pending_id += 1;

        if self.policy.should_failover(state.attempt) {
            state.phase = RecoveryPhase::FailingOver;
            state.pending = Some(Pending {
                id,
                failed_run: run_id,
                seq: None,
                token: token.clone(),
            });
            self.publish_state(&state);
            let attempt = state.attempt;
            drop(state);
            warn!(
                run_id,
                attempt,
                max_attempts = self.policy.max_attempts,
                detail,
                "Retries exhausted against relay, failing over"
            );
            tokio::spawn(Arc::clone(self).fail_over(id, token));
            return;
        }

        let delay = self.policy.strategy.delay_for_attempt(state.restarts);
        state.restarts += 1;
        let attempt = ReconnectionAttempt {
            seq: state.restarts,
            delay,
            classification: class,
            outcome: AttemptOutcome::Pending,
            at: SystemTime::now(),
        };
        state.history.push_back(attempt.clone());
        while state.history.len() > self.policy.history_retention {
            state.history.pop_front();
        }
        state.phase = RecoveryPhase::Reconnecting {
            attempt: state.attempt,
            max_attempts: self.policy.max_attempts,
        };
        state.pending = Some(Pending {
            id,
            failed_run: run_id,
            seq: Some(attempt.seq),
            token: token.clone(),
        });
        self.publish_state(&state);
        let counted = state.attempt;
        drop(state);

        info!(
            run_id,
            attempt = counted,
            max_attempts = self.policy.max_attempts,
            classification = ?class,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            detail,
            "Scheduling tunnel restart"
        );
        self.events
            .publish(TunnelEvent::ReconnectionAttempted(attempt.clone()));
        tokio::spawn(Arc::clone(self).restart_after(id, attempt.seq, delay, token));
    }

    async fn restart_after(
        self: Arc<Self>,
        id: u64,
        seq: u32,
        delay: Duration,
        token: CancellationToken,
    ) {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = token.cancelled() => return,
        }

        let result = self.process.restart_guarded(None, &token).await;

        let mut state = self.lock();
        let (outcome, terminal) = match &result {
            Ok(Some(status)) => {
                info!(seq, run_id = status.run_id, pid = status.pid, "Tunnel client restarted");
                (AttemptOutcome::Restarted, None)
            }
            Ok(None) => {
                debug!(seq, "Restart cancelled");
                return;
            }
            Err(e) => {
                warn!(seq, error = %e, "Restart failed");
                let terminal = e.is_synchronous().then(|| format!("restart failed: {e}"));
                (AttemptOutcome::Failed, terminal)
            }
        };
        if state.pending.as_ref().is_none_or(|p| p.id != id) {
            // Superseded by suspend/resume while restarting.
            return;
        }
        state.clear_pending(id);
        let updated = state.set_outcome(seq, outcome);
        if let Some(reason) = &terminal {
            state.phase = RecoveryPhase::Failed {
                reason: reason.clone(),
            };
        }
        self.publish_state(&state);
        drop(state);

        if let Some(attempt) = updated {
            self.events
                .publish(TunnelEvent::ReconnectionAttempted(attempt));
        }
        if let Some(reason) = terminal {
            self.events.publish(TunnelEvent::RecoveryFailed { reason });
        }
    }

    async fn fail_over(self: Arc<Self>, id: u64, token: CancellationToken) {
        // Selection happens under the state lock, atomically with `suspend`.
        let relay = {
            let mut state = self.lock();
            if token.is_cancelled() || state.pending.as_ref().is_none_or(|p| p.id != id) {
                debug!("Failover cancelled before selecting a relay");
                return;
            }
            let Some(relay) = self.failover.select_next() else {
                drop(state);
                self.give_up(id, TunnelError::NoAlternateRelay.to_string());
                return;
            };
            state.attempt = 0;
            state.restarts = 0;
            state.history.clear();
            self.publish_state(&state);
            relay
        };
        self.events.publish(TunnelEvent::RelayChanged(relay.clone()));

        let Some(config) = self.process.last_config() else {
            self.give_up(id, TunnelError::NoPriorConfig.to_string());
            return;
        };
        match self
            .process
            .restart_guarded(Some(config.with_relay(&relay)), &token)
            .await
        {
            Ok(Some(status)) => {
                info!(relay = %relay, run_id = status.run_id, "Tunnel restarted on new relay");
                let mut state = self.lock();
                if state.pending.as_ref().is_some_and(|p| p.id == id) {
                    state.clear_pending(id);
                    state.phase = RecoveryPhase::Idle;
                    self.publish_state(&state);
                }
            }
            Ok(None) => debug!(relay = %relay, "Failover restart cancelled"),
            Err(e) => self.give_up(id, format!("restart on {relay} failed: {e}")),
        }
    }

    fn give_up(&self, id: u64, reason: String) {
        let mut state = self.lock();
        if state.pending.as_ref().is_none_or(|p| p.id != id) {
            return;
        }
        state.clear_pending(id);
        state.phase = RecoveryPhase::Failed {
            reason: reason.clone(),
        };
        self.publish_state(&state);
        drop(state);
        error!(reason = %reason, "Automatic recovery failed");
        self.events.publish(TunnelEvent::RecoveryFailed { reason });
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use tunnelward_core::{RelayHealth, RelayServerInfo, TunnelConfig};

    use super::*;
    use crate::binary::{BinaryManager, Platform};
    use crate::failover::SelectionStrategy;
    use crate::process::ProcessState;
    use crate::reconnect::BackoffStrategy;

    struct Fixture {
        _dir: tempfile::TempDir,
        events: EventHub,
        process: Arc<ProcessSupervisor>,
        failover: Arc<FailoverManager>,
        manager: Arc<ReconnectionManager>,
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            strategy: BackoffStrategy::Custom(Arc::new(|_| Duration::from_millis(20))),
            max_attempts,
            ..ReconnectPolicy::default()
        }
    }

    fn fixture(script: &str, max_attempts: u32) -> Fixture {
        fixture_with(script, policy(max_attempts), Vec::new())
    }

    fn fixture_with(script: &str, policy: ReconnectPolicy, relays: Vec<RelayServerInfo>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(Platform::current().unwrap().binary_name());
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let events = EventHub::default();
        let binary = Arc::new(BinaryManager::new(Path::new(dir.path())));
        let process = Arc::new(ProcessSupervisor::new(binary, events.clone()));
        let failover = Arc::new(FailoverManager::new(relays, SelectionStrategy::BestScore));
        let manager = Arc::new(ReconnectionManager::new(
            policy,
            Arc::clone(&process),
            Arc::clone(&failover),
            events.clone(),
        ));
        Fixture {
            _dir: dir,
            events,
            process,
            failover,
            manager,
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig::new("127.0.0.1", 5000, "relay.example", 7000, "p1")
    }

    #[tokio::test]
    async fn unreachable_failures_escalate_faster() {
        let f = fixture("echo 'dial tcp 10.0.0.1:7000: connection refused'\nexit 1", 4);
        let mut rx = f.events.subscribe();
        let task = f.manager.spawn();
        f.manager.resume();
        f.failover.begin(&config());
        f.process.start(config()).await.unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let TunnelEvent::RecoveryFailed { reason } = rx.recv().await.unwrap() {
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reason, TunnelError::NoAlternateRelay.to_string());

        // Two weighted failures reach the maximum of four.
        let state = f.manager.state();
        assert_eq!(state.attempt, 4);
        assert!(matches!(state.phase, RecoveryPhase::Failed { .. }));
        let history = f.manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].classification, FailureClass::ServerUnreachable);
        assert_eq!(history[0].outcome, AttemptOutcome::Failed);
        assert_eq!(f.process.spawn_count(), 2);
        task.abort();
    }

    #[tokio::test]
    async fn suspended_manager_ignores_exits() {
        let f = fixture("exit 1", 5);
        let task = f.manager.spawn();
        let mut status_rx = f.process.watch_status();
        f.process.start(config()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while status_rx
                .borrow_and_update()
                .as_ref()
                .is_none_or(|s| s.state != ProcessState::Stopped)
            {
                status_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.process.spawn_count(), 1);
        assert!(f.manager.history().is_empty());
        assert_eq!(f.manager.state().phase, RecoveryPhase::Idle);
        task.abort();
    }

    #[tokio::test]
    async fn history_is_bounded_by_retention() {
        let f = fixture_with(
            "echo 'connection reset'\nexit 1",
            ReconnectPolicy {
                history_retention: 3,
                ..policy(50)
            },
            Vec::new(),
        );
        let mut rx = f.events.subscribe();
        let task = f.manager.spawn();
        f.manager.resume();
        f.failover.begin(&config());
        f.process.start(config()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let TunnelEvent::ReconnectionAttempted(a) = rx.recv().await.unwrap()
                    && a.seq >= 6
                {
                    return;
                }
            }
        })
        .await
        .unwrap();
        f.manager.suspend();

        let history = f.manager.history();
        assert_eq!(history.len(), 3);
        let last = history.last().unwrap().seq;
        assert!(last >= 6);
        let seqs: Vec<u32> = history.iter().map(|a| a.seq).collect();
        assert_eq!(seqs, vec![last - 2, last - 1, last]);
        f.process.stop().await;
        task.abort();
    }

    #[tokio::test]
    async fn cancelled_failover_keeps_current_relay() {
        let relays = vec![
            RelayServerInfo::new("relay.example", 7000).with_score(9.0),
            RelayServerInfo::new("relay.other.example", 7000).with_score(1.0),
        ];
        let f = fixture_with("exec sleep 30", policy(1), relays);
        f.manager.resume();
        f.failover.begin(&config());

        let token = CancellationToken::new();
        f.manager.lock().pending = Some(Pending {
            id: 7,
            failed_run: 1,
            seq: None,
            token: token.clone(),
        });
        f.manager.suspend();
        assert!(token.is_cancelled());

        Arc::clone(&f.manager).fail_over(7, token).await;

        assert_eq!(f.failover.current().unwrap().address, "relay.example");
        assert!(
            f.failover
                .candidates()
                .iter()
                .all(|r| r.health != RelayHealth::Failed)
        );
        assert_eq!(f.process.spawn_count(), 0);
    }
}
