//! Periodic connection health sweeps.
//!
//! Checks never throw; they classify. A shallow sweep verifies
//! connectivity and attempts one reconnect; a deep sweep (forced, or when
//! the last one is stale) issues a `get_self` probe. Results feed the
//! rotation pool via [`PoolObserver`].

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio::{
        sync::{Mutex, RwLock},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {crier_common::now_ms, crier_config::HealthConfig};

use crate::{
    client::HealthMap,
    registry::{ActiveConnection, ClientRegistry},
};

/// Receives the health snapshot after every sweep. The rotation engine
/// implements this; injecting it here (instead of depending on the engine)
/// keeps the dependency one-directional.
#[async_trait]
pub trait PoolObserver: Send + Sync {
    async fn pool_refreshed(&self, health: HealthMap);
}

pub struct HealthChecker {
    registry: Arc<ClientRegistry>,
    cfg: HealthConfig,
    observer: RwLock<Option<Arc<dyn PoolObserver>>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(registry: Arc<ClientRegistry>, cfg: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cfg,
            observer: RwLock::new(None),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Inject the pool observer. Called once at wiring time.
    pub async fn set_observer(&self, observer: Arc<dyn PoolObserver>) {
        *self.observer.write().await = Some(observer);
    }

    /// Spawn the periodic sweep.
    pub async fn start(self: &Arc<Self>) {
        let checker = Arc::clone(self);
        let interval = Duration::from_millis(self.cfg.check_interval_ms);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {},
                    () = cancel.cancelled() => break,
                }
                checker.check_all(false).await;
            }
        });

        *self.handle.lock().await = Some(handle);
        info!(interval_ms = self.cfg.check_interval_ms, "health checker started");
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        info!("health checker stopped");
    }

    /// Operator-triggered repair: sweep now, deep-probing everything.
    pub async fn force_check(&self) -> HealthMap {
        self.check_all(true).await
    }

    /// Sweep every registered connection. Returns the health snapshot and
    /// hands it to the observer.
    pub async fn check_all(&self, force_deep: bool) -> HealthMap {
        let now = now_ms();
        let mut health = HealthMap::new();

        for conn in self.registry.connections().await {
            let healthy = self.check_one(&conn, now, force_deep).await;
            health.insert(conn.mobile.clone(), healthy);
        }

        debug!(
            healthy = health.values().filter(|h| **h).count(),
            total = health.len(),
            "health sweep complete"
        );

        let observer = { self.observer.read().await.clone() };
        if let Some(observer) = observer {
            observer.pool_refreshed(health.clone()).await;
        }

        health
    }

    async fn check_one(&self, conn: &Arc<ActiveConnection>, now: i64, force_deep: bool) -> bool {
        conn.mark_health_check(now);

        // An already-released handle still in our snapshot: evict.
        if !conn.is_active() {
            self.registry.release(&conn.mobile).await;
            return false;
        }

        if !conn.client.is_connected() {
            let timeout = self.registry.connect_timeout();
            match tokio::time::timeout(timeout, conn.client.connect()).await {
                Ok(Ok(())) => debug!(mobile = conn.mobile, "reconnected"),
                Ok(Err(e)) => {
                    warn!(mobile = conn.mobile, error = %e, "reconnect failed");
                    return false;
                },
                Err(_) => {
                    warn!(mobile = conn.mobile, "reconnect timed out");
                    return false;
                },
            }
        }

        if force_deep || conn.deep_probe_stale(now, self.cfg.deep_probe_interval_ms as i64) {
            return deep_probe(conn, self.cfg.probe_timeout_ms).await;
        }

        true
    }
}

/// Issue a `get_self` probe with a timeout, refreshing the probe stamp on
/// success. Shared with the scheduler's pre-send staleness check.
pub async fn deep_probe(conn: &ActiveConnection, timeout_ms: u64) -> bool {
    match tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        conn.client.get_self(),
    )
    .await
    {
        Ok(Ok(_)) => {
            conn.mark_deep_probe(now_ms());
            true
        },
        Ok(Err(e)) => {
            warn!(mobile = conn.mobile, error = %e, "identity probe failed");
            false
        },
        Err(_) => {
            warn!(mobile = conn.mobile, "identity probe timed out");
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::ClientError,
            sim::{SimFactory, SimNetwork},
        },
        crier_config::PoolConfig,
        crier_stores::{memory::MemoryAccountStore, AccountRecord, Notifier},
        std::collections::HashMap,
    };

    fn registry(network: &Arc<SimNetwork>, mobiles: &[&str]) -> Arc<ClientRegistry> {
        let accounts = Arc::new(MemoryAccountStore::new(vec![AccountRecord {
            client_id: "acct".into(),
            promote_mobiles: mobiles.iter().map(|m| m.to_string()).collect(),
            days_left: 3,
            expired: false,
        }]));
        Arc::new(ClientRegistry::new(
            Arc::new(SimFactory::new(Arc::clone(network))),
            accounts,
            Arc::new(Notifier::disabled()),
            PoolConfig::default(),
        ))
    }

    #[tokio::test]
    async fn disconnected_client_is_reconnected() {
        let network = SimNetwork::shared();
        let reg = registry(&network, &["+1"]);
        reg.acquire("+1").await.unwrap();
        network.force_disconnect("+1");

        let checker = HealthChecker::new(Arc::clone(&reg), HealthConfig::default());
        let health = checker.check_all(false).await;

        assert_eq!(health.get("+1"), Some(&true));
        assert_eq!(network.connect_count("+1"), 2);
    }

    #[tokio::test]
    async fn reconnect_failure_is_unhealthy_not_fatal() {
        let network = SimNetwork::shared();
        let reg = registry(&network, &["+1"]);
        reg.acquire("+1").await.unwrap();
        network.force_disconnect("+1");
        network.script_connect_failure("+1", ClientError::Transport("ERR_NETWORK".into()));

        let checker = HealthChecker::new(Arc::clone(&reg), HealthConfig::default());
        let health = checker.check_all(false).await;
        assert_eq!(health.get("+1"), Some(&false));
    }

    #[tokio::test]
    async fn deep_probe_failure_is_unhealthy() {
        let network = SimNetwork::shared();
        let reg = registry(&network, &["+1"]);
        reg.acquire("+1").await.unwrap();
        network.script_self_failure("+1", ClientError::Transport("TIMEOUT".into()));

        let checker = HealthChecker::new(Arc::clone(&reg), HealthConfig::default());
        let health = checker.force_check().await;
        assert_eq!(health.get("+1"), Some(&false));
    }

    #[tokio::test]
    async fn fresh_connection_skips_deep_probe() {
        let network = SimNetwork::shared();
        let reg = registry(&network, &["+1"]);
        reg.acquire("+1").await.unwrap();
        // A failing get_self must not matter while the probe stamp is fresh.
        network.script_self_failure("+1", ClientError::Transport("TIMEOUT".into()));

        let checker = HealthChecker::new(Arc::clone(&reg), HealthConfig::default());
        let health = checker.check_all(false).await;
        assert_eq!(health.get("+1"), Some(&true));
    }

    struct CaptureObserver {
        seen: Mutex<Vec<HashMap<String, bool>>>,
    }

    #[async_trait]
    impl PoolObserver for CaptureObserver {
        async fn pool_refreshed(&self, health: HealthMap) {
            self.seen.lock().await.push(health);
        }
    }

    #[tokio::test]
    async fn observer_receives_snapshot() {
        let network = SimNetwork::shared();
        let reg = registry(&network, &["+1"]);
        reg.acquire("+1").await.unwrap();

        let observer = Arc::new(CaptureObserver {
            seen: Mutex::new(Vec::new()),
        });
        let checker = HealthChecker::new(Arc::clone(&reg), HealthConfig::default());
        checker.set_observer(Arc::clone(&observer) as Arc<dyn PoolObserver>).await;

        checker.check_all(false).await;
        let seen = observer.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("+1"), Some(&true));
    }
}
