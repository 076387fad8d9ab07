//! Relay server failover.
//!
//! Keeps the prioritized relay candidates and the one currently in use.
//! How a replacement is chosen is a [`SelectionStrategy`]; relay scoring is
//! left to whoever fills in `score`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{info, warn};
use tunnelward_core::{RelayHealth, RelayServerInfo, TunnelConfig};

/// Custom selector: candidates plus the current index, returning the index
/// to switch to. Only eligible indices (not failed, not current) are honored.
pub type SelectFn = Arc<dyn Fn(&[RelayServerInfo], Option<usize>) -> Option<usize> + Send + Sync>;

/// How the next relay is picked.
#[derive(Clone, Default)]
pub enum SelectionStrategy {
    /// Highest score; list order breaks ties.
    #[default]
    BestScore,
    /// Next in list order after the current relay, preferring one in a
    /// different region.
    RoundRobin,
    Custom(SelectFn),
}

impl fmt::Debug for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BestScore => f.write_str("BestScore"),
            Self::RoundRobin => f.write_str("RoundRobin"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Default)]
struct Candidates {
    relays: Vec<RelayServerInfo>,
    current: Option<usize>,
}

impl Candidates {
    fn eligible(&self, index: usize) -> bool {
        Some(index) != self.current && self.relays[index].health != RelayHealth::Failed
    }
}

/// Chooses alternate relays once the current one is exhausted.
pub struct FailoverManager {
    strategy: SelectionStrategy,
    state: Mutex<Candidates>,
    current_tx: watch::Sender<Option<RelayServerInfo>>,
}

impl FailoverManager {
    pub fn new(relays: Vec<RelayServerInfo>, strategy: SelectionStrategy) -> Self {
        let (current_tx, _) = watch::channel(None);
        Self {
            strategy,
            state: Mutex::new(Candidates {
                relays,
                current: None,
            }),
            current_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Candidates> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new failover cycle for `config`.
    ///
    /// Clears failure marks and makes the config's relay current, adding it
    /// to the front of the list if it is not a known candidate.
    pub fn begin(&self, config: &TunnelConfig) -> RelayServerInfo {
        let mut state = self.lock();
        for relay in &mut state.relays {
            relay.health = RelayHealth::Unknown;
        }
        let index = if let Some(i) = state.relays.iter().position(|r| config.targets(r)) {
            i
        } else {
            state
                .relays
                .insert(0, RelayServerInfo::new(config.server_addr.clone(), config.server_port));
            0
        };
        state.current = Some(index);
        let current = state.relays[index].clone();
        self.current_tx.send_replace(Some(current.clone()));
        drop(state);
        current
    }

    /// Mark the current relay failed and switch to the next eligible one.
    /// `None` when every alternative has failed.
    pub fn select_next(&self) -> Option<RelayServerInfo> {
        let mut state = self.lock();
        let current = state.current;
        let failed = current.map(|i| {
            state.relays[i].health = RelayHealth::Failed;
            state.relays[i].clone()
        });

        let Some(next) = self.pick(&state) else {
            warn!(failed = ?failed.as_ref().map(ToString::to_string), "No alternate relay available");
            return None;
        };
        state.current = Some(next);
        let relay = state.relays[next].clone();
        self.current_tx.send_replace(Some(relay.clone()));
        drop(state);

        info!(
            from = ?failed.as_ref().map(ToString::to_string),
            to = %relay,
            region = relay.region.as_deref().unwrap_or("-"),
            "Failing over to relay"
        );
        Some(relay)
    }

    fn pick(&self, state: &Candidates) -> Option<usize> {
        match &self.strategy {
            SelectionStrategy::BestScore => (0..state.relays.len())
                .filter(|&i| state.eligible(i))
                .fold(None, |best: Option<usize>, i| match best {
                    Some(b) if state.relays[b].score >= state.relays[i].score => Some(b),
                    _ => Some(i),
                }),
            SelectionStrategy::RoundRobin => {
                let len = state.relays.len();
                let start = state.current.map_or(0, |c| c + 1);
                let order: Vec<usize> = (0..len)
                    .map(|offset| (start + offset) % len)
                    .filter(|&i| state.eligible(i))
                    .collect();
                let current_region = state
                    .current
                    .and_then(|c| state.relays[c].region.as_deref());
                order
                    .iter()
                    .copied()
                    .find(|&i| {
                        current_region.is_some()
                            && state.relays[i].region.as_deref() != current_region
                    })
                    .or_else(|| order.first().copied())
            }
            SelectionStrategy::Custom(select) => select(&state.relays, state.current)
                .filter(|&i| i < state.relays.len() && state.eligible(i)),
        }
    }

    pub fn mark_current_healthy(&self) {
        let mut state = self.lock();
        if let Some(i) = state.current {
            state.relays[i].health = RelayHealth::Healthy;
            let relay = state.relays[i].clone();
            self.current_tx.send_replace(Some(relay));
        }
    }

    /// Update a candidate's score. Returns `false` for unknown relays.
    pub fn update_score(&self, address: &str, port: u16, score: f64) -> bool {
        let mut state = self.lock();
        let Some(i) = state
            .relays
            .iter()
            .position(|r| r.address == address && r.port == port)
        else {
            return false;
        };
        state.relays[i].score = score;
        if state.current == Some(i) {
            let relay = state.relays[i].clone();
            self.current_tx.send_replace(Some(relay));
        }
        true
    }

    pub fn candidates(&self) -> Vec<RelayServerInfo> {
        self.lock().relays.clone()
    }

    pub fn current(&self) -> Option<RelayServerInfo> {
        self.current_tx.borrow().clone()
    }

    pub fn watch_current(&self) -> watch::Receiver<Option<RelayServerInfo>> {
        self.current_tx.subscribe()
    }
}
