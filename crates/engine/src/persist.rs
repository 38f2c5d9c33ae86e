//! Snapshot persistence: per-mobile JSON stats files.
//!
//! `mobileStats-<M>.json`, pretty-printed, camelCase keys. A missing file
//! is a first run; a corrupt file is logged and treated as missing.
//! Autosave runs on an interval across all sessions in parallel; the
//! shutdown flush does the same under a total deadline.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use {
    futures::future::join_all,
    serde::{Deserialize, Serialize},
    tokio::{sync::Mutex, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crier_config::PersistenceConfig;

use crate::session::{PromotionOutcome, SessionState, SessionTracker};

const SNAPSHOT_VERSION: &str = "1.0";

/// The durable per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileStats {
    pub message_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub days_left: i64,
    pub last_checked_time: i64,
    pub sleep_time: i64,
    pub release_time: i64,
    pub last_message_time: i64,
    pub converted: i64,
}

/// On-disk snapshot of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub mobile_stats: MobileStats,
    pub promotion_results: HashMap<String, PromotionOutcome>,
    pub saved_at: String,
    pub version: String,
}

impl Snapshot {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            mobile_stats: MobileStats {
                message_count: state.message_count,
                success_count: state.success_count,
                failed_count: state.failed_count,
                days_left: state.days_left,
                last_checked_time: state.last_checked_time,
                sleep_time: state.sleep_time,
                release_time: state.release_time,
                last_message_time: state.last_message_time,
                converted: state.converted,
            },
            promotion_results: state.promotion_results.clone(),
            saved_at: chrono::Utc::now().to_rfc3339(),
            version: SNAPSHOT_VERSION.to_string(),
        }
    }

    /// Restore the durable fields into a live session.
    pub fn apply_to(&self, state: &mut SessionState) {
        state.message_count = self.mobile_stats.message_count;
        state.success_count = self.mobile_stats.success_count;
        state.failed_count = self.mobile_stats.failed_count;
        state.days_left = self.mobile_stats.days_left;
        state.last_checked_time = self.mobile_stats.last_checked_time;
        state.sleep_time = self.mobile_stats.sleep_time;
        state.release_time = self.mobile_stats.release_time;
        state.last_message_time = self.mobile_stats.last_message_time;
        state.converted = self.mobile_stats.converted;
        state.promotion_results = self.promotion_results.clone();
    }
}

pub struct StatePersistence {
    dir: PathBuf,
    auto_save_interval_ms: u64,
    flush_timeout_ms: u64,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatePersistence {
    pub fn new(cfg: &PersistenceConfig) -> Arc<Self> {
        Arc::new(Self {
            dir: PathBuf::from(&cfg.dir),
            auto_save_interval_ms: cfg.auto_save_interval_ms,
            flush_timeout_ms: cfg.shutdown_flush_timeout_ms,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    pub fn path_for(&self, mobile: &str) -> PathBuf {
        self.dir.join(format!("mobileStats-{mobile}.json"))
    }

    /// Write one session snapshot to disk.
    pub async fn save(&self, state: &SessionState) -> anyhow::Result<()> {
        let snapshot = Snapshot::from_state(state);
        let path = self.path_for(&state.mobile);
        let json = serde_json::to_string_pretty(&snapshot)?;

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, json)?;
            Ok(())
        })
        .await??;

        debug!(mobile = state.mobile, "snapshot saved");
        Ok(())
    }

    /// Read a session snapshot. Missing file means first run; a corrupt
    /// file is logged and also treated as missing.
    pub async fn load(&self, mobile: &str) -> Option<Snapshot> {
        let path = self.path_for(mobile);
        let raw = tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return None;
            }
            std::fs::read_to_string(&path).ok()
        })
        .await
        .ok()??;

        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(mobile, error = %e, "corrupt snapshot; treating as first run");
                None
            },
        }
    }

    /// Snapshot every tracked session in parallel. Failures are logged,
    /// never raised.
    pub async fn save_all(&self, tracker: &SessionTracker) {
        let states: Vec<SessionState> = tracker
            .mobiles()
            .iter()
            .filter_map(|m| tracker.snapshot(m))
            .collect();
        let count = states.len();

        join_all(states.iter().map(|state| async move {
            if let Err(e) = self.save(state).await {
                warn!(mobile = state.mobile, error = %e, "autosave failed");
            }
        }))
        .await;

        debug!(count, "saved all sessions");
    }

    /// Spawn the autosave timer.
    pub async fn start_autosave(self: &Arc<Self>, tracker: Arc<SessionTracker>) {
        if self.auto_save_interval_ms == 0 {
            return;
        }
        let persistence = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_millis(self.auto_save_interval_ms);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {},
                    () = cancel.cancelled() => break,
                }
                persistence.save_all(&tracker).await;
            }
        });

        *self.handle.lock().await = Some(handle);
        info!(interval_ms = self.auto_save_interval_ms, "autosave started");
    }

    pub async fn stop_autosave(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Best-effort shutdown flush, bounded by the configured deadline.
    pub async fn flush(&self, tracker: &SessionTracker) {
        let deadline = Duration::from_millis(self.flush_timeout_ms);
        if tokio::time::timeout(deadline, self.save_all(tracker))
            .await
            .is_err()
        {
            warn!("shutdown flush exceeded deadline; some sessions unsaved");
        }
    }
}
