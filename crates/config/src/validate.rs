//! Configuration validation.
//!
//! Checks value ranges and cross-field consistency (interval clamps,
//! jitter fraction, slot counts) and reports severity-tagged diagnostics
//! instead of failing hard.

use crate::schema::CrierConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "rotation.active_slots".
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn error(&mut self, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path: path.into(),
            message: message.into(),
        });
    }

    fn warning(&mut self, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate a configuration, returning all diagnostics found.
pub fn validate_config(cfg: &CrierConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if cfg.rotation.active_slots == 0 {
        result.error("rotation.active_slots", "must be at least 1");
    }
    if !(0.0..=1.0).contains(&cfg.rotation.jitter) {
        result.error("rotation.jitter", "must be a fraction in [0, 1]");
    }
    if cfg.rotation.min_interval_ms > cfg.rotation.interval_ms {
        result.error(
            "rotation.min_interval_ms",
            "lower clamp exceeds the base interval",
        );
    }
    if cfg.rotation.interval_ms > cfg.rotation.max_interval_ms {
        result.error(
            "rotation.max_interval_ms",
            "upper clamp is below the base interval",
        );
    }
    if !(0.0..=1.0).contains(&cfg.rotation.min_active_change) {
        result.warning(
            "rotation.min_active_change",
            "advisory churn fraction outside [0, 1]",
        );
    }

    if cfg.pool.max_concurrent_connections == 0 {
        result.error("pool.max_concurrent_connections", "must be at least 1");
    }
    if cfg.pool.max_concurrent_connections < cfg.rotation.active_slots {
        result.warning(
            "pool.max_concurrent_connections",
            "smaller than rotation.active_slots; rotation will starve",
        );
    }

    if cfg.promoter.batch_size == 0 {
        result.error("promoter.batch_size", "must be at least 1");
    }
    if cfg.promoter.tick_interval_ms == 0 {
        result.error("promoter.tick_interval_ms", "must be non-zero");
    }
    if cfg.promoter.max_queue_size == 0 {
        result.error("promoter.max_queue_size", "must be non-zero");
    }
    if cfg.promoter.start_stagger_ms >= cfg.promoter.tick_interval_ms {
        result.warning(
            "promoter.start_stagger_ms",
            "stagger exceeds the tick interval",
        );
    }

    if cfg.persistence.auto_save_interval_ms == 0 {
        result.warning("persistence.auto_save_interval_ms", "autosave disabled");
    }

    result
}

#[cfg(test)]
mod tests {
    use {super::*, crate::schema::CrierConfig};

    #[test]
    fn defaults_are_clean() {
        let result = validate_config(&CrierConfig::default());
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn zero_slots_is_error() {
        let mut cfg = CrierConfig::default();
        cfg.rotation.active_slots = 0;
        let result = validate_config(&cfg);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "rotation.active_slots");
    }

    #[test]
    fn inverted_clamps_are_errors() {
        let mut cfg = CrierConfig::default();
        cfg.rotation.min_interval_ms = cfg.rotation.max_interval_ms + 1;
        cfg.rotation.interval_ms = cfg.rotation.max_interval_ms + 2;
        assert!(validate_config(&cfg).has_errors());
    }

    #[test]
    fn small_pool_is_warning_not_error() {
        let mut cfg = CrierConfig::default();
        cfg.pool.max_concurrent_connections = 2;
        let result = validate_config(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].severity, Severity::Warning);
    }

    #[test]
    fn bad_jitter_is_error() {
        let mut cfg = CrierConfig::default();
        cfg.rotation.jitter = 1.5;
        assert!(validate_config(&cfg).has_errors());
    }
}
