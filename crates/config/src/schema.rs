//! Config schema types (connection pool, health checks, rotation, promotion,
//! persistence, notifier). Every field has a default so a missing config file
//! yields a fully usable configuration.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrierConfig {
    pub pool: PoolConfig,
    pub health: HealthConfig,
    pub rotation: RotationConfig,
    pub promoter: PromoterConfig,
    pub persistence: PersistenceConfig,
    pub notifier: NotifierConfig,
}

/// Client connection pool limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Hard cap on simultaneously registered client connections.
    pub max_concurrent_connections: usize,
    /// Timeout for establishing a connection, in milliseconds.
    pub connection_timeout_ms: u64,
    /// Timeout for a graceful disconnect before the handle is dropped anyway.
    pub disconnect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 100,
            connection_timeout_ms: 30_000,
            disconnect_timeout_ms: 5_000,
        }
    }
}

/// Health checker cadence and probe timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health sweeps, in milliseconds (5 min).
    pub check_interval_ms: u64,
    /// Age after which a shallow check escalates to a `get_self` probe (2 h).
    pub deep_probe_interval_ms: u64,
    /// Timeout for the `get_self` probe (10 s).
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5 * 60 * 1000,
            deep_probe_interval_ms: 2 * 60 * 60 * 1000,
            probe_timeout_ms: 10_000,
        }
    }
}

/// Active-set rotation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Upper bound on the active subset size.
    pub active_slots: usize,
    /// Base rotation period, in milliseconds (4 h).
    pub interval_ms: u64,
    /// Lower clamp for the jittered interval (3 h).
    pub min_interval_ms: u64,
    /// Upper clamp for the jittered interval (6 h).
    pub max_interval_ms: u64,
    /// ± jitter applied to the base interval, as a fraction.
    pub jitter: f64,
    /// Advisory minimum churn fraction between consecutive active sets.
    /// Reported in status; not enforced by selection.
    pub min_active_change: f64,
    /// Number of rotation records retained for diagnostics.
    pub max_history: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            active_slots: 4,
            interval_ms: 4 * 60 * 60 * 1000,
            min_interval_ms: 3 * 60 * 60 * 1000,
            max_interval_ms: 6 * 60 * 60 * 1000,
            jitter: 0.30,
            min_active_change: 0.30,
            max_history: 50,
        }
    }
}

/// Promotion scheduler tick, batching, and per-session bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoterConfig {
    /// Global send tick, in milliseconds (5 s).
    pub tick_interval_ms: u64,
    /// Maximum sessions sending concurrently within one tick.
    pub batch_size: usize,
    /// Maximum random start stagger per session within a batch.
    pub start_stagger_ms: u64,
    /// Age before a sent message is probed for survival (10 s).
    pub message_check_delay_ms: u64,
    /// Per-mobile verification queue cap; overflow drops the oldest 10%.
    pub max_queue_size: usize,
    /// Per-mobile outcome-history cap; overflow keeps the highest counts.
    pub max_results_size: usize,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            batch_size: 3,
            start_stagger_ms: 500,
            message_check_delay_ms: 10_000,
            max_queue_size: 1_000,
            max_results_size: 5_000,
        }
    }
}

/// Snapshot persistence locations and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding the per-mobile `mobileStats-<M>.json` files.
    pub dir: String,
    /// Autosave interval across all sessions, in milliseconds (5 min).
    pub auto_save_interval_ms: u64,
    /// Total deadline for the shutdown flush, in milliseconds (60 s).
    pub shutdown_flush_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: ".".into(),
            auto_save_interval_ms: 5 * 60 * 1000,
            shutdown_flush_timeout_ms: 60_000,
        }
    }
}

/// Outbound alert webhook and remote ban-list feed. Both optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// URL template for fire-and-forget event notifications.
    /// `{event}` and `{detail}` placeholders are substituted per event.
    pub url_template: Option<String>,
    /// Endpoint returning the shared banned-channels list as a JSON array.
    pub banned_list_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_values() {
        let cfg = CrierConfig::default();
        assert_eq!(cfg.rotation.active_slots, 4);
        assert_eq!(cfg.rotation.interval_ms, 14_400_000);
        assert_eq!(cfg.rotation.min_interval_ms, 10_800_000);
        assert_eq!(cfg.rotation.max_interval_ms, 21_600_000);
        assert_eq!(cfg.health.check_interval_ms, 300_000);
        assert_eq!(cfg.pool.connection_timeout_ms, 30_000);
        assert_eq!(cfg.pool.disconnect_timeout_ms, 5_000);
        assert_eq!(cfg.promoter.tick_interval_ms, 5_000);
        assert_eq!(cfg.promoter.message_check_delay_ms, 10_000);
        assert_eq!(cfg.promoter.max_queue_size, 1_000);
        assert_eq!(cfg.promoter.max_results_size, 5_000);
        assert_eq!(cfg.persistence.auto_save_interval_ms, 300_000);
        assert_eq!(cfg.pool.max_concurrent_connections, 100);
        assert_eq!(cfg.rotation.max_history, 50);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: CrierConfig = toml::from_str("[rotation]\nactive_slots = 2\n").unwrap();
        assert_eq!(cfg.rotation.active_slots, 2);
        assert_eq!(cfg.rotation.max_history, 50);
        assert_eq!(cfg.promoter.batch_size, 3);
    }

    #[test]
    fn notifier_defaults_off() {
        let cfg = CrierConfig::default();
        assert!(cfg.notifier.url_template.is_none());
        assert!(cfg.notifier.banned_list_url.is_none());
    }
}
