//! Backoff strategies and reconnection policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Caller-supplied delay function: attempt number (0-indexed) to delay.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How long to wait before the n-th restart.
#[derive(Clone)]
pub enum BackoffStrategy {
    /// `min(base * 2^n, cap)` plus jitter in `[0, jitter)`.
    Exponential {
        base: Duration,
        cap: Duration,
        jitter: Duration,
    },
    /// `min(base + n * step, cap)` plus jitter in `[0, jitter)`.
    Linear {
        base: Duration,
        step: Duration,
        cap: Duration,
        jitter: Duration,
    },
    Custom(DelayFn),
}

impl fmt::Debug for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential { base, cap, jitter } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("cap", cap)
                .field("jitter", jitter)
                .finish(),
            Self::Linear {
                base,
                step,
                cap,
                jitter,
            } => f
                .debug_struct("Linear")
                .field("base", base)
                .field("step", step)
                .field("cap", cap)
                .field("jitter", jitter)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffStrategy {
    /// Delay for a given attempt number (0-indexed), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential { base, cap, .. } => base
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(*cap),
            Self::Linear { base, step, cap, .. } => base
                .saturating_add(step.saturating_mul(attempt))
                .min(*cap),
            Self::Custom(f) => f(attempt),
        }
    }

    /// Delay for a given attempt number with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = match self {
            Self::Exponential { jitter, .. } | Self::Linear { jitter, .. } => *jitter,
            Self::Custom(_) => Duration::ZERO,
        };
        self.base_delay(attempt) + random_jitter(jitter)
    }
}

fn random_jitter(max: Duration) -> Duration {
    let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

/// Reconnection policy for one relay.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    /// Weighted failures tolerated before failing over to another relay.
    pub max_attempts: u32,
    /// Weight of a "server unreachable" failure; transient failures count 1.
    pub unreachable_weight: u32,
    /// Reconnection attempts kept in history.
    pub history_retention: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            max_attempts: 5,
            unreachable_weight: 2,
            history_retention: 50,
        }
    }
}

impl ReconnectPolicy {
    /// Whether the weighted attempt count calls for failover.
    pub const fn should_failover(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
