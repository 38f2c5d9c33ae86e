use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as epoch milliseconds.
///
/// All cooldowns, cursors, and snapshot stamps in crier are epoch-millis
/// `i64`s; time-dependent predicates take an explicit `now` argument so
/// tests can control the clock.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
