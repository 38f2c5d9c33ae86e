//! Per-mobile promotion state.
//!
//! One [`SessionState`] per mobile, held behind a `std::sync::Mutex`:
//! every operation is a synchronous counter/map update, never held across
//! an `.await` point. The scheduler's re-entrancy guard is a
//! [`SendPermit`] that clears `is_promoting` on drop, so no exit path can
//! leave a session wedged.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use {
    rand::{rngs::StdRng, seq::SliceRandom},
    serde::{Deserialize, Serialize},
    tracing::debug,
};

/// Error code marking a channel as banned for this mobile.
pub const USER_BANNED_CODE: &str = "USER_BANNED_IN_CHANNEL";

/// How long a banned-for-mobile verdict (and any outcome entry) is kept.
pub const RESULT_TTL_MS: i64 = 3 * 24 * 60 * 60 * 1000;

const TWELVE_MINUTES_MS: i64 = 12 * 60 * 1000;
const THREE_MINUTES_MS: i64 = 3 * 60 * 1000;

/// Outcome history for one mobile+channel pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionOutcome {
    pub success: bool,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
    pub last_check_timestamp: i64,
}

/// In-memory record for one promote mobile.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub mobile: String,
    /// Shuffled visit order; reshuffled on every full cycle.
    pub channels: Vec<String>,
    pub channel_index: usize,
    pub promotion_results: HashMap<String, PromotionOutcome>,
    /// Template catalog snapshot taken when the session entered the pool.
    pub promote_msgs: HashMap<String, String>,
    pub last_message_time: i64,
    pub last_checked_time: i64,
    /// Absolute cooldown cutoff (epoch ms); the only rate-limit signal.
    pub sleep_time: i64,
    pub release_time: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub temp_fail_count: i64,
    pub message_count: i64,
    pub converted: i64,
    pub days_left: i64,
    pub is_promoting: bool,
    pub failure_reason: Option<String>,
}

impl SessionState {
    pub fn new(mobile: &str) -> Self {
        Self {
            mobile: mobile.to_string(),
            days_left: -1,
            ..Self::default()
        }
    }

    /// Eligible for a send this tick: not past its account window, past
    /// the per-day message spacing, and not sleeping off a flood wait.
    pub fn is_healthy(&self, now: i64) -> bool {
        self.days_left < 7
            && ((self.last_message_time < now - TWELVE_MINUTES_MS && self.days_left < 1)
                || (self.last_message_time < now - THREE_MINUTES_MS && self.days_left > 0))
            && self.sleep_time < now
    }

    /// Channels this mobile must skip: a recent `USER_BANNED_IN_CHANNEL`
    /// failure holds for three days.
    pub fn banned_channels(&self, now: i64) -> Vec<String> {
        self.promotion_results
            .iter()
            .filter(|(_, r)| {
                !r.success
                    && r.error_message.as_deref() == Some(USER_BANNED_CODE)
                    && r.last_check_timestamp > now - RESULT_TTL_MS
            })
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Record a send outcome. Success bumps the per-channel count and
    /// clears the error; failure keeps the count and stores the code.
    pub fn record_outcome(
        &mut self,
        channel_id: &str,
        success: bool,
        error_message: Option<String>,
        now: i64,
    ) {
        let entry = self
            .promotion_results
            .entry(channel_id.to_string())
            .or_insert(PromotionOutcome {
                success,
                count: 0,
                error_message: None,
                last_check_timestamp: now,
            });
        entry.success = success;
        entry.last_check_timestamp = now;
        if success {
            entry.count += 1;
            entry.error_message = None;
        } else {
            entry.error_message = error_message;
        }
    }

    /// Step the channel cursor; on wrap-around, reshuffle the visit order.
    /// Returns `true` when a reshuffle happened.
    pub fn advance_channel(&mut self, rng: &mut StdRng) -> bool {
        if self.channels.is_empty() {
            return false;
        }
        self.channel_index = (self.channel_index + 1) % self.channels.len();
        if self.channel_index == 0 && self.channels.len() > 1 {
            self.channels.shuffle(rng);
            return true;
        }
        false
    }

    pub fn set_channels(&mut self, channels: Vec<String>) {
        self.channels = channels;
        self.channel_index = 0;
    }

    pub fn current_channel(&self) -> Option<&str> {
        self.channels.get(self.channel_index).map(String::as_str)
    }

    /// Negative days-left means the account window already lapsed: the
    /// outcome history no longer applies and is wiped.
    pub fn set_days_left(&mut self, days_left: i64) {
        self.days_left = days_left;
        if days_left < 0 && !self.promotion_results.is_empty() {
            debug!(mobile = self.mobile, "wiping outcome history (past due)");
            self.promotion_results.clear();
        }
    }

    /// Drop outcome entries older than [`RESULT_TTL_MS`].
    pub fn ttl_cleanup(&mut self, now: i64) {
        self.promotion_results
            .retain(|_, r| r.last_check_timestamp >= now - RESULT_TTL_MS);
    }

    /// Bound the outcome history, keeping the entries with the highest
    /// send counts.
    pub fn size_cleanup(&mut self, max_entries: usize) {
        if self.promotion_results.len() <= max_entries {
            return;
        }
        let mut entries: Vec<(String, PromotionOutcome)> =
            self.promotion_results.drain().collect();
        entries.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        entries.truncate(max_entries);
        self.promotion_results = entries.into_iter().collect();
    }
}

/// Clears the session's re-entrancy flag when dropped.
pub struct SendPermit {
    state: Arc<Mutex<SessionState>>,
}

impl Drop for SendPermit {
    fn drop(&mut self) {
        lock(&self.state).is_promoting = false;
    }
}

fn lock(state: &Arc<Mutex<SessionState>>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared map of every managed session, keyed by mobile.
#[derive(Default)]
pub struct SessionTracker {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the session for `mobile`.
    pub fn ensure(&self, mobile: &str) -> Arc<Mutex<SessionState>> {
        {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = sessions.get(mobile) {
                return Arc::clone(state);
            }
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            sessions
                .entry(mobile.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(mobile)))),
        )
    }

    pub fn get(&self, mobile: &str) -> Option<Arc<Mutex<SessionState>>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(mobile).cloned()
    }

    /// Purge a session that left active management.
    pub fn remove(&self, mobile: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(mobile);
    }

    pub fn mobiles(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.keys().cloned().collect()
    }

    /// Run `f` against the session for `mobile`, if present.
    pub fn with_state<R>(&self, mobile: &str, f: impl FnOnce(&mut SessionState) -> R) -> Option<R> {
        let state = self.get(mobile)?;
        let mut guard = lock(&state);
        Some(f(&mut guard))
    }

    /// Clone the state for persistence or status reporting.
    pub fn snapshot(&self, mobile: &str) -> Option<SessionState> {
        self.with_state(mobile, |s| s.clone())
    }

    /// Mobiles currently eligible for a send: healthy and not mid-send.
    pub fn healthy_mobiles(&self, now: i64) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut healthy: Vec<String> = sessions
            .iter()
            .filter(|(_, state)| {
                let s = lock(state);
                s.is_healthy(now) && !s.is_promoting
            })
            .map(|(m, _)| m.clone())
            .collect();
        healthy.sort();
        healthy
    }

    /// Claim the per-session send slot. `None` if a send is already in
    /// flight for this mobile.
    pub fn begin_send(&self, mobile: &str) -> Option<SendPermit> {
        let state = self.get(mobile)?;
        {
            let mut guard = lock(&state);
            if guard.is_promoting {
                return None;
            }
            guard.is_promoting = true;
        }
        Some(SendPermit { state })
    }

    // ── Counter and cooldown operations ─────────────────────────────────

    pub fn update_last_message_time(&self, mobile: &str, at: i64) {
        self.with_state(mobile, |s| s.last_message_time = at);
    }

    pub fn update_last_checked_time(&self, mobile: &str, at: i64) {
        self.with_state(mobile, |s| s.last_checked_time = at);
    }

    /// Success also resets the consecutive-failure counter.
    pub fn inc_success(&self, mobile: &str) {
        self.with_state(mobile, |s| {
            s.success_count += 1;
            s.temp_fail_count = 0;
        });
    }

    pub fn inc_failed(&self, mobile: &str) {
        self.with_state(mobile, |s| {
            s.failed_count += 1;
            s.temp_fail_count += 1;
        });
    }

    pub fn inc_message_count(&self, mobile: &str) {
        self.with_state(mobile, |s| s.message_count += 1);
    }

    /// Absolute cooldown cutoff; used for flood waits.
    pub fn set_sleep(&self, mobile: &str, until: i64) {
        self.with_state(mobile, |s| s.sleep_time = until);
    }

    pub fn set_failure_reason(&self, mobile: &str, reason: Option<String>) {
        self.with_state(mobile, |s| s.failure_reason = reason);
    }

    pub fn record_outcome(
        &self,
        mobile: &str,
        channel_id: &str,
        success: bool,
        error_message: Option<String>,
        now: i64,
    ) {
        self.with_state(mobile, |s| {
            s.record_outcome(channel_id, success, error_message, now)
        });
    }

    pub fn advance_channel(&self, mobile: &str, rng: &mut StdRng) {
        self.with_state(mobile, |s| s.advance_channel(rng));
    }

    /// Run both cleanup policies on every session.
    pub fn cleanup(&self, now: i64, max_results: usize) {
        for mobile in self.mobiles() {
            self.with_state(&mobile, |s| {
                s.ttl_cleanup(now);
                s.size_cleanup(max_results);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rand::SeedableRng};

    const MIN: i64 = 60 * 1000;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn healthy_requires_message_spacing_by_days_left() {
        let now = 1_000_000_000;
        let mut s = SessionState::new("+1");

        // days_left > 0: 3-minute spacing.
        s.days_left = 3;
        s.last_message_time = now - 4 * MIN;
        assert!(s.is_healthy(now));
        s.last_message_time = now - 2 * MIN;
        assert!(!s.is_healthy(now));

        // days_left < 1: 12-minute spacing.
        s.days_left = 0;
        s.last_message_time = now - 13 * MIN;
        assert!(s.is_healthy(now));
        s.last_message_time = now - 4 * MIN;
        assert!(!s.is_healthy(now));
    }

    #[test]
    fn sleep_time_blocks_health() {
        let now = 1_000_000_000;
        let mut s = SessionState::new("+1");
        s.days_left = 3;
        s.last_message_time = now - 10 * MIN;
        s.sleep_time = now + 60_000;
        assert!(!s.is_healthy(now));
        s.sleep_time = now - 1;
        assert!(s.is_healthy(now));
    }

    #[test]
    fn expiring_account_is_unhealthy() {
        let now = 1_000_000_000;
        let mut s = SessionState::new("+1");
        s.days_left = 7;
        s.last_message_time = 0;
        assert!(!s.is_healthy(now));
    }

    #[test]
    fn banned_channels_respect_window() {
        let now = 1_000_000_000_000;
        let mut s = SessionState::new("+1");
        s.record_outcome("c1", false, Some(USER_BANNED_CODE.into()), now - 24 * 60 * MIN);
        s.record_outcome("c2", false, Some(USER_BANNED_CODE.into()), now - 4 * 24 * 60 * MIN);
        s.record_outcome("c3", false, Some("CHAT_WRITE_FORBIDDEN".into()), now);
        s.record_outcome("c4", true, None, now);

        let banned = s.banned_channels(now);
        assert_eq!(banned, vec!["c1".to_string()]);
    }

    #[test]
    fn outcome_counts_monotonic_and_reset_on_success() {
        let mut s = SessionState::new("+1");
        s.record_outcome("c1", true, None, 1);
        s.record_outcome("c1", true, None, 2);
        s.record_outcome("c1", false, Some("FLOOD_WAIT".into()), 3);
        let r = &s.promotion_results["c1"];
        assert_eq!(r.count, 2);
        assert!(!r.success);
        assert_eq!(r.error_message.as_deref(), Some("FLOOD_WAIT"));

        s.record_outcome("c1", true, None, 4);
        let r = &s.promotion_results["c1"];
        assert_eq!(r.count, 3);
        assert!(r.error_message.is_none());
    }

    #[test]
    fn advance_wraps_and_reshuffles_once_per_cycle() {
        let mut s = SessionState::new("+1");
        s.set_channels((0..5).map(|i| format!("c{i}")).collect());
        let mut rng = rng();

        let mut reshuffles = 0;
        for _ in 0..5 {
            if s.advance_channel(&mut rng) {
                reshuffles += 1;
            }
        }
        assert_eq!(s.channel_index, 0);
        assert_eq!(reshuffles, 1);
    }

    #[test]
    fn advance_single_channel_stays_put() {
        let mut s = SessionState::new("+1");
        s.set_channels(vec!["c1".into()]);
        let mut rng = rng();
        assert!(!s.advance_channel(&mut rng));
        assert_eq!(s.channel_index, 0);
    }

    #[test]
    fn advance_on_empty_is_noop() {
        let mut s = SessionState::new("+1");
        let mut rng = rng();
        assert!(!s.advance_channel(&mut rng));
    }

    #[test]
    fn negative_days_left_wipes_history() {
        let mut s = SessionState::new("+1");
        s.record_outcome("c1", true, None, 1);
        s.set_days_left(-1);
        assert!(s.promotion_results.is_empty());
    }

    #[test]
    fn ttl_cleanup_drops_stale_entries() {
        let now = 1_000_000_000_000;
        let mut s = SessionState::new("+1");
        s.record_outcome("old", true, None, now - RESULT_TTL_MS - 1);
        s.record_outcome("fresh", true, None, now);
        s.ttl_cleanup(now);
        assert_eq!(s.promotion_results.len(), 1);
        assert!(s.promotion_results.contains_key("fresh"));
    }

    #[test]
    fn size_cleanup_keeps_highest_counts() {
        let mut s = SessionState::new("+1");
        for i in 0..5_001 {
            s.promotion_results.insert(
                format!("c{i}"),
                PromotionOutcome {
                    success: true,
                    count: i,
                    error_message: None,
                    last_check_timestamp: 1,
                },
            );
        }
        s.size_cleanup(5_000);
        assert_eq!(s.promotion_results.len(), 5_000);
        // The lone dropped entry is the lowest count.
        assert!(!s.promotion_results.contains_key("c0"));
        assert!(s.promotion_results.contains_key("c5000"));
    }

    #[test]
    fn permit_blocks_reentry_and_releases_on_drop() {
        let tracker = SessionTracker::new();
        tracker.ensure("+1");

        let permit = tracker.begin_send("+1").expect("first permit");
        assert!(tracker.begin_send("+1").is_none());
        drop(permit);
        assert!(tracker.begin_send("+1").is_some());
    }

    #[test]
    fn healthy_mobiles_excludes_promoting() {
        let now = 1_000_000_000;
        let tracker = SessionTracker::new();
        for m in ["+1", "+2"] {
            tracker.ensure(m);
            tracker.with_state(m, |s| {
                s.days_left = 3;
                s.last_message_time = now - 10 * MIN;
            });
        }

        let _permit = tracker.begin_send("+1").unwrap();
        assert_eq!(tracker.healthy_mobiles(now), vec!["+2".to_string()]);
    }

    #[test]
    fn tracker_counters() {
        let tracker = SessionTracker::new();
        tracker.ensure("+1");
        tracker.inc_failed("+1");
        tracker.inc_failed("+1");
        tracker.inc_success("+1");
        tracker.inc_message_count("+1");

        let s = tracker.snapshot("+1").unwrap();
        assert_eq!(s.success_count, 1);
        assert_eq!(s.failed_count, 2);
        assert_eq!(s.temp_fail_count, 0);
        assert_eq!(s.message_count, 1);
    }
}
