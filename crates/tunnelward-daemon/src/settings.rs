//! Mapping from loaded settings to supervisor options.

use std::time::Duration;

use tunnelward_core::Config;
use tunnelward_core::config::{
    BackoffKind, HealthSettings, ReconnectSettings, SelectionKind,
};

use crate::binary::BinaryManager;
use crate::error::{Result, TunnelError};
use crate::failover::SelectionStrategy;
use crate::health::HealthConfig;
use crate::reconnect::{BackoffStrategy, ReconnectPolicy};
use crate::supervisor::SupervisorOptions;

/// Build supervisor options from settings.
///
/// Fails when no binary directory is configured and the platform has no
/// per-user data directory to default to.
pub fn supervisor_options(config: &Config) -> Result<SupervisorOptions> {
    let binary_dir = config
        .binary
        .dir
        .clone()
        .or_else(BinaryManager::default_dir)
        .ok_or_else(|| {
            TunnelError::ConfigInvalid("no binary directory configured".to_string())
        })?;

    let mut options = SupervisorOptions::new(binary_dir)
        .with_health(health_config(&config.health))
        .with_reconnect_policy(reconnect_policy(&config.reconnect))
        .with_relays(
            config.failover.relays.clone(),
            selection_strategy(config.failover.strategy),
        )
        .with_terminate_timeout(Duration::from_secs(config.daemon.terminate_timeout_secs));
    options.verify_checksum = config.binary.verify_checksum;
    Ok(options)
}

pub fn health_config(settings: &HealthSettings) -> HealthConfig {
    HealthConfig {
        interval: Duration::from_secs(settings.interval_secs.max(1)),
        timeout: Duration::from_millis(settings.timeout_ms),
        degraded_latency: Duration::from_millis(settings.degraded_latency_ms),
        url_timeout: Duration::from_secs(settings.url_timeout_secs),
        fallback: None,
    }
}

pub fn reconnect_policy(settings: &ReconnectSettings) -> ReconnectPolicy {
    let base = Duration::from_millis(settings.base_delay_ms);
    let cap = Duration::from_millis(settings.max_delay_ms);
    let jitter = Duration::from_millis(settings.jitter_ms);
    let strategy = match settings.strategy {
        BackoffKind::Exponential => BackoffStrategy::Exponential { base, cap, jitter },
        BackoffKind::Linear => BackoffStrategy::Linear {
            base,
            step: Duration::from_millis(settings.step_ms),
            cap,
            jitter,
        },
    };
    ReconnectPolicy {
        strategy,
        max_attempts: settings.max_attempts.max(1),
        unreachable_weight: settings.unreachable_weight.max(1),
        history_retention: settings.history_retention,
    }
}

pub fn selection_strategy(kind: SelectionKind) -> SelectionStrategy {
    match kind {
        SelectionKind::BestScore => SelectionStrategy::BestScore,
        SelectionKind::RoundRobin => SelectionStrategy::RoundRobin,
    }
}
