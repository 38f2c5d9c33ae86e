//! Rotation timer loop, subset selection, and connect/disconnect deltas.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng},
    tokio::{
        sync::{Mutex, Notify, RwLock},
        task::JoinHandle,
    },
    tracing::{debug, info, warn},
};

use {
    crier_common::now_ms,
    crier_config::RotationConfig,
    crier_transport::{client::HealthMap, ClientRegistry, PoolObserver},
};

/// One completed rotation, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct RotationRecord {
    pub timestamp_ms: i64,
    pub selected: Vec<String>,
}

/// Operator-facing snapshot of the rotation state.
#[derive(Debug, Clone)]
pub struct RotationStatus {
    pub active: Vec<String>,
    pub available: Vec<String>,
    pub candidates: usize,
    pub active_slots: usize,
    pub rotations_completed: u64,
    pub next_rotation_at_ms: Option<i64>,
    /// Advisory churn target; reported, never enforced.
    pub min_active_change: f64,
}

pub struct RotationEngine {
    registry: Arc<ClientRegistry>,
    cfg: RotationConfig,
    candidates: RwLock<Vec<String>>,
    available: RwLock<Vec<String>>,
    active: RwLock<Vec<String>>,
    history: RwLock<VecDeque<RotationRecord>>,
    rng: Mutex<StdRng>,
    rotations: AtomicU64,
    next_rotation_at_ms: RwLock<Option<i64>>,
    running: RwLock<bool>,
    wake: Arc<Notify>,
    timer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RotationEngine {
    pub fn new(registry: Arc<ClientRegistry>, cfg: RotationConfig) -> Arc<Self> {
        Self::with_rng(registry, cfg, StdRng::from_os_rng())
    }

    /// Deterministic variant for tests.
    pub fn with_seed(registry: Arc<ClientRegistry>, cfg: RotationConfig, seed: u64) -> Arc<Self> {
        Self::with_rng(registry, cfg, StdRng::seed_from_u64(seed))
    }

    fn with_rng(registry: Arc<ClientRegistry>, cfg: RotationConfig, rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cfg,
            candidates: RwLock::new(Vec::new()),
            available: RwLock::new(Vec::new()),
            active: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            rng: Mutex::new(rng),
            rotations: AtomicU64::new(0),
            next_rotation_at_ms: RwLock::new(None),
            running: RwLock::new(false),
            wake: Arc::new(Notify::new()),
            timer_handle: Mutex::new(None),
        })
    }

    /// Seed the pools and connect an initial active subset.
    pub async fn initialize(&self, pool: Vec<String>) {
        let mut deduped = Vec::with_capacity(pool.len());
        for mobile in pool {
            if !deduped.contains(&mobile) {
                deduped.push(mobile);
            }
        }

        info!(candidates = deduped.len(), "rotation pool initialized");
        *self.candidates.write().await = deduped.clone();
        *self.available.write().await = deduped;

        let mut initial = self.select_subset().await;
        let failed = self.connect_delta(&initial).await;
        initial.retain(|m| !failed.contains(m));
        self.record_rotation(&initial).await;
        *self.active.write().await = initial;
    }

    /// Resample the active subset and apply the delta: releases first,
    /// then acquires.
    pub async fn rotate(&self) {
        let old = { self.active.read().await.clone() };
        let new = self.select_subset().await;

        let to_remove: Vec<String> = old.iter().filter(|m| !new.contains(m)).cloned().collect();
        let to_add: Vec<String> = new.iter().filter(|m| !old.contains(m)).cloned().collect();

        info!(
            removing = to_remove.len(),
            adding = to_add.len(),
            keeping = old.len() - to_remove.len(),
            "rotating active set"
        );

        for mobile in &to_remove {
            self.registry.release(mobile).await;
        }
        let failed = self.connect_delta(&to_add).await;

        let mut selected = new;
        selected.retain(|m| !failed.contains(m));
        self.record_rotation(&selected).await;
        *self.active.write().await = selected;
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Recompute availability from the latest health snapshot: candidates
    /// explicitly reported unhealthy drop out; mobiles the registry has
    /// never seen stay eligible. Actives that left availability are
    /// released.
    pub async fn refresh_available(&self, health: &HealthMap) {
        let candidates = { self.candidates.read().await.clone() };
        let available: Vec<String> = candidates
            .into_iter()
            .filter(|m| health.get(m).copied().unwrap_or(true))
            .collect();

        let dropped: Vec<String> = {
            let mut active = self.active.write().await;
            let dropped = active
                .iter()
                .filter(|m| !available.contains(m))
                .cloned()
                .collect::<Vec<_>>();
            active.retain(|m| available.contains(m));
            dropped
        };

        for mobile in &dropped {
            debug!(mobile, "active mobile left availability");
            self.registry.release(mobile).await;
        }

        *self.available.write().await = available;
    }

    /// Replace the candidate pool (account records changed).
    pub async fn set_candidates(&self, pool: Vec<String>) {
        *self.candidates.write().await = pool;
    }

    // ── Observers ───────────────────────────────────────────────────────

    pub async fn current_active(&self) -> Vec<String> {
        self.active.read().await.clone()
    }

    pub async fn available(&self) -> Vec<String> {
        self.available.read().await.clone()
    }

    pub async fn history(&self) -> Vec<RotationRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn status(&self) -> RotationStatus {
        RotationStatus {
            active: self.active.read().await.clone(),
            available: self.available.read().await.clone(),
            candidates: self.candidates.read().await.len(),
            active_slots: self.cfg.active_slots,
            rotations_completed: self.rotations.load(Ordering::Relaxed),
            next_rotation_at_ms: *self.next_rotation_at_ms.read().await,
            min_active_change: self.cfg.min_active_change,
        }
    }

    // ── Timer ───────────────────────────────────────────────────────────

    /// Start the jittered rotation timer.
    pub async fn start(self: &Arc<Self>) {
        *self.running.write().await = true;
        self.schedule_next().await;

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.timer_loop().await;
        });
        *self.timer_handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.wake.notify_one();
        if let Some(handle) = self.timer_handle.lock().await.take() {
            handle.abort();
        }
        *self.next_rotation_at_ms.write().await = None;
        info!("rotation timer stopped");
    }

    async fn timer_loop(self: &Arc<Self>) {
        loop {
            if !*self.running.read().await {
                break;
            }

            let sleep_ms = {
                let next = self.next_rotation_at_ms.read().await;
                next.map(|t| (t - now_ms()).max(0) as u64).unwrap_or(60_000)
            };

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {},
                () = self.wake.notified() => continue,
            }

            if !*self.running.read().await {
                break;
            }

            self.rotate().await;
            self.schedule_next().await;
        }
    }

    async fn schedule_next(&self) {
        let interval = self.jittered_interval_ms().await;
        let at = now_ms() + interval as i64;
        *self.next_rotation_at_ms.write().await = Some(at);
        debug!(interval_ms = interval, "next rotation scheduled");
    }

    /// `base·(1 ± jitter)`, clamped to `[min_interval, max_interval]`.
    async fn jittered_interval_ms(&self) -> u64 {
        let base = self.cfg.interval_ms as f64;
        let factor = {
            let mut rng = self.rng.lock().await;
            1.0 + rng.random_range(-self.cfg.jitter..=self.cfg.jitter)
        };
        let jittered = (base * factor) as u64;
        jittered.clamp(self.cfg.min_interval_ms, self.cfg.max_interval_ms)
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Uniform random subset of the available pool, `active_slots` wide.
    async fn select_subset(&self) -> Vec<String> {
        let mut pool = { self.available.read().await.clone() };
        let slots = self.cfg.active_slots.min(pool.len());

        let mut rng = self.rng.lock().await;
        pool.shuffle(&mut *rng);
        pool.truncate(slots);
        pool
    }

    /// Acquire each mobile in `to_add`. Returns the mobiles that failed
    /// permanently and must not enter the active set; they also leave the
    /// candidate pool.
    async fn connect_delta(&self, to_add: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for mobile in to_add {
            match self.registry.acquire(mobile).await {
                Ok(_) => {},
                Err(e) if e.is_permanent() => {
                    warn!(mobile, error = %e, "dropping permanently failed mobile");
                    self.remove_candidate(mobile).await;
                    failed.push(mobile.clone());
                },
                Err(e) => {
                    // Transient: keep the slot; the scheduler's acquire
                    // retries on its next tick.
                    warn!(mobile, error = %e, "acquire failed during rotation");
                },
            }
        }
        failed
    }

    async fn remove_candidate(&self, mobile: &str) {
        self.candidates.write().await.retain(|m| m != mobile);
        self.available.write().await.retain(|m| m != mobile);
    }

    async fn record_rotation(&self, selected: &[String]) {
        let mut history = self.history.write().await;
        history.push_back(RotationRecord {
            timestamp_ms: now_ms(),
            selected: selected.to_vec(),
        });
        while history.len() > self.cfg.max_history {
            history.pop_front();
        }
    }
}

/// Health sweeps feed straight into pool refresh.
#[async_trait]
impl PoolObserver for RotationEngine {
    async fn pool_refreshed(&self, health: HealthMap) {
        self.refresh_available(&health).await;
    }
}
