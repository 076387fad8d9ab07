//! Automatic recovery: failure classification, backoff, and restarts.

pub mod classify;
pub mod manager;
pub mod policy;
pub mod types;

pub use classify::classify_exit;
pub use manager::ReconnectionManager;
pub use policy::{BackoffStrategy, DelayFn, ReconnectPolicy};
pub use types::{
    AttemptOutcome, FailureClass, ReconnectionAttempt, RecoveryPhase, RecoveryState,
};
