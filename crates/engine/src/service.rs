//! Composition root: wires the registry, health checker, rotation engine,
//! scheduler, and persistence into one operable service.

use std::{collections::HashMap, sync::Arc};

use {
    anyhow::Result,
    tokio::sync::RwLock,
    tracing::{info, warn},
};

use {
    crier_common::now_ms,
    crier_config::CrierConfig,
    crier_rotation::{RotationEngine, RotationStatus},
    crier_stores::{AccountStore, BannedFeed, ChannelStore, Notifier, TemplateStore},
    crier_transport::{client::HealthMap, ClientFactory, ClientRegistry, HealthChecker, PoolObserver},
};

use crate::{
    persist::{MobileStats, Snapshot, StatePersistence},
    scheduler::PromotionScheduler,
    session::SessionTracker,
    verify::VerificationQueue,
};

/// Operator-facing service snapshot.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub is_running: bool,
    pub healthy_mobiles: Vec<String>,
    pub promotion_stats: HashMap<String, MobileStats>,
}

pub struct PromoterService {
    cfg: CrierConfig,
    tracker: Arc<SessionTracker>,
    registry: Arc<ClientRegistry>,
    health: Arc<HealthChecker>,
    rotation: Arc<RotationEngine>,
    scheduler: Arc<PromotionScheduler>,
    persistence: Arc<StatePersistence>,
    accounts: Arc<dyn AccountStore>,
    templates: Arc<dyn TemplateStore>,
    is_running: RwLock<bool>,
}

impl PromoterService {
    /// Wire the full control plane. Nothing runs until [`Self::start`].
    pub fn build(
        cfg: CrierConfig,
        factory: Arc<dyn ClientFactory>,
        channels: Arc<dyn ChannelStore>,
        templates: Arc<dyn TemplateStore>,
        accounts: Arc<dyn AccountStore>,
    ) -> Arc<Self> {
        let notifier = Arc::new(Notifier::new(cfg.notifier.url_template.clone()));
        let banned_feed = Arc::new(BannedFeed::new(cfg.notifier.banned_list_url.clone()));

        let registry = Arc::new(ClientRegistry::new(
            factory,
            Arc::clone(&accounts),
            Arc::clone(&notifier),
            cfg.pool.clone(),
        ));
        let health = HealthChecker::new(Arc::clone(&registry), cfg.health.clone());
        let rotation = RotationEngine::new(Arc::clone(&registry), cfg.rotation.clone());

        let tracker = Arc::new(SessionTracker::new());
        let verify = Arc::new(VerificationQueue::new(
            cfg.promoter.message_check_delay_ms,
            cfg.promoter.max_queue_size,
        ));
        let scheduler = PromotionScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            verify,
            channels,
            notifier,
            banned_feed,
            cfg.promoter.clone(),
            cfg.health.clone(),
        );
        let persistence = StatePersistence::new(&cfg.persistence);

        Arc::new(Self {
            cfg,
            tracker,
            registry,
            health,
            rotation,
            scheduler,
            persistence,
            accounts,
            templates,
            is_running: RwLock::new(false),
        })
    }

    /// Ingest accounts, restore snapshots, and start every driver.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        self.health
            .set_observer(Arc::clone(&self.rotation) as Arc<dyn PoolObserver>)
            .await;

        let pool = match self.ingest_accounts().await {
            Ok(pool) => pool,
            Err(e) => {
                *self.is_running.write().await = false;
                return Err(e);
            },
        };
        info!(mobiles = pool.len(), "promoter starting");

        self.rotation.initialize(pool).await;
        self.rotation.start().await;
        self.health.start().await;
        self.scheduler.start().await;
        self.persistence
            .start_autosave(Arc::clone(&self.tracker))
            .await;

        Ok(())
    }

    /// Stop every driver, letting the in-flight tick finish, then flush
    /// state and drop every connection.
    pub async fn stop(&self) {
        {
            let mut running = self.is_running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }

        self.scheduler.stop().await;
        self.rotation.stop().await;
        self.health.stop().await;
        self.persistence.stop_autosave().await;
        self.persistence.flush(&self.tracker).await;
        self.registry.release_all().await;
        info!("promoter stopped");
    }

    pub async fn status(&self) -> ServiceStatus {
        let now = now_ms();
        let mut promotion_stats = HashMap::new();
        for mobile in self.tracker.mobiles() {
            if let Some(state) = self.tracker.snapshot(&mobile) {
                promotion_stats.insert(mobile, Snapshot::from_state(&state).mobile_stats);
            }
        }

        ServiceStatus {
            is_running: *self.is_running.read().await,
            healthy_mobiles: self.tracker.healthy_mobiles(now),
            promotion_stats,
        }
    }

    pub async fn rotation_status(&self) -> RotationStatus {
        self.rotation.status().await
    }

    /// Operator repair: immediate deep health sweep.
    pub async fn force_health_check(&self) -> HealthMap {
        self.health.force_check().await
    }

    /// Operator save: snapshot every session now.
    pub async fn save_all(&self) {
        self.persistence.save_all(&self.tracker).await;
    }

    /// Operator load: re-apply on-disk snapshots over live state.
    pub async fn load_all(&self) {
        for mobile in self.tracker.mobiles() {
            if let Some(snapshot) = self.persistence.load(&mobile).await {
                self.tracker
                    .with_state(&mobile, |s| snapshot.apply_to(s));
            }
        }
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn scheduler(&self) -> &Arc<PromotionScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &CrierConfig {
        &self.cfg
    }

    /// Build the session pool from the account store: one session per
    /// promote mobile, with its snapshot restored and the template
    /// catalog pinned.
    async fn ingest_accounts(&self) -> Result<Vec<String>> {
        let templates = self.templates.find_one().await.unwrap_or_else(|e| {
            warn!(error = %e, "template catalog unavailable; sessions start empty");
            HashMap::new()
        });

        let mut pool = Vec::new();
        for account in self.accounts.get_active_clients().await? {
            for mobile in &account.promote_mobiles {
                self.tracker.ensure(mobile);
                if let Some(snapshot) = self.persistence.load(mobile).await {
                    self.tracker.with_state(mobile, |s| snapshot.apply_to(s));
                }
                let catalog = templates.clone();
                self.tracker.with_state(mobile, |s| {
                    s.promote_msgs = catalog;
                    // The account record is authoritative for expiry.
                    s.set_days_left(account.days_left);
                });
                pool.push(mobile.clone());
            }
        }
        Ok(pool)
    }
}
