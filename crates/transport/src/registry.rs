//! Live connection registry: one handle per mobile, capped, single-flight.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use {
    futures::future::join_all,
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, info, warn},
};

use {
    crier_common::now_ms,
    crier_config::PoolConfig,
    crier_stores::{AccountStore, Notifier, NotifyEvent},
};

use crate::{
    client::{ClientFactory, HealthMap, RemoteClient},
    error::ClientError,
};

/// A registered live session handle plus its bookkeeping.
pub struct ActiveConnection {
    pub mobile: String,
    pub client: Arc<dyn RemoteClient>,
    pub created_at_ms: i64,
    last_health_check_ms: AtomicI64,
    last_deep_probe_ms: AtomicI64,
    is_active: AtomicBool,
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("mobile", &self.mobile)
            .field("created_at_ms", &self.created_at_ms)
            .field("last_health_check_ms", &self.last_health_check_ms)
            .field("last_deep_probe_ms", &self.last_deep_probe_ms)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl ActiveConnection {
    fn new(mobile: &str, client: Arc<dyn RemoteClient>, now: i64) -> Self {
        Self {
            mobile: mobile.to_string(),
            client,
            created_at_ms: now,
            last_health_check_ms: AtomicI64::new(now),
            // A fresh connection counts as deeply probed: creation just
            // exercised the full auth path.
            last_deep_probe_ms: AtomicI64::new(now),
            is_active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.is_active.store(active, Ordering::Relaxed);
    }

    pub fn mark_health_check(&self, now: i64) {
        self.last_health_check_ms.store(now, Ordering::Relaxed);
    }

    pub fn last_health_check_ms(&self) -> i64 {
        self.last_health_check_ms.load(Ordering::Relaxed)
    }

    pub fn mark_deep_probe(&self, now: i64) {
        self.last_deep_probe_ms.store(now, Ordering::Relaxed);
    }

    /// `true` when the last `get_self` probe is older than `interval_ms`.
    pub fn deep_probe_stale(&self, now: i64, interval_ms: i64) -> bool {
        now - self.last_deep_probe_ms.load(Ordering::Relaxed) >= interval_ms
    }
}

/// Owns every live [`RemoteClient`], keyed by mobile.
///
/// `acquire` is guarded by a per-mobile single-flight gate so concurrent
/// callers for the same mobile share one in-flight creation. Total
/// connections are capped; excess acquires fail with
/// [`ClientError::LimitReached`].
pub struct ClientRegistry {
    factory: Arc<dyn ClientFactory>,
    accounts: Arc<dyn AccountStore>,
    notifier: Arc<Notifier>,
    cfg: PoolConfig,
    connections: RwLock<HashMap<String, Arc<ActiveConnection>>>,
    creation_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClientRegistry {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        accounts: Arc<dyn AccountStore>,
        notifier: Arc<Notifier>,
        cfg: PoolConfig,
    ) -> Self {
        Self {
            factory,
            accounts,
            notifier,
            cfg,
            connections: RwLock::new(HashMap::new()),
            creation_gates: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.connection_timeout_ms)
    }

    /// Snapshot of every registered connection.
    pub async fn connections(&self) -> Vec<Arc<ActiveConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Return the existing healthy connection for `mobile`, or create one.
    pub async fn acquire(&self, mobile: &str) -> Result<Arc<ActiveConnection>, ClientError> {
        if let Some(conn) = self.lookup_live(mobile).await {
            return Ok(conn);
        }

        let gate = self.creation_gate(mobile).await;
        let _guard = gate.lock().await;

        // Re-check under the gate: a concurrent acquire may have finished.
        if let Some(conn) = self.lookup_live(mobile).await {
            return Ok(conn);
        }

        // A registered-but-disconnected handle gets one reconnect attempt
        // before we give up on it.
        let stale = { self.connections.read().await.get(mobile).cloned() };
        if let Some(conn) = stale {
            if conn.is_active() {
                match tokio::time::timeout(self.connect_timeout(), conn.client.connect()).await {
                    Ok(Ok(())) => return Ok(conn),
                    Ok(Err(e)) => {
                        self.evict(mobile, &conn).await;
                        self.handle_permanent(mobile, &e).await;
                        return Err(e);
                    },
                    Err(_) => {
                        self.evict(mobile, &conn).await;
                        return Err(ClientError::Timeout(self.connect_timeout()));
                    },
                }
            }
            self.evict(mobile, &conn).await;
        }

        self.create_connection(mobile).await
    }

    /// Non-creating lookup. `None` if absent or disconnected.
    pub async fn get(&self, mobile: &str) -> Option<Arc<dyn RemoteClient>> {
        self.lookup_live(mobile).await.map(|c| Arc::clone(&c.client))
    }

    /// The full connection record, regardless of connectedness.
    pub async fn connection(&self, mobile: &str) -> Option<Arc<ActiveConnection>> {
        self.connections.read().await.get(mobile).cloned()
    }

    /// Disconnect and evict `mobile`. Idempotent.
    pub async fn release(&self, mobile: &str) {
        let conn = { self.connections.read().await.get(mobile).cloned() };
        let Some(conn) = conn else {
            return;
        };

        conn.set_active(false);
        let timeout = Duration::from_millis(self.cfg.disconnect_timeout_ms);
        match tokio::time::timeout(timeout, conn.client.disconnect()).await {
            Ok(Ok(())) => debug!(mobile, "disconnected"),
            Ok(Err(e)) => warn!(mobile, error = %e, "disconnect failed; evicting anyway"),
            Err(_) => warn!(mobile, "disconnect timed out; evicting anyway"),
        }

        self.evict(mobile, &conn).await;
    }

    /// Evict every registered connection, disconnecting in parallel.
    pub async fn release_all(&self) {
        let mobiles: Vec<String> = {
            let connections = self.connections.read().await;
            connections.keys().cloned().collect()
        };

        join_all(mobiles.iter().map(|m| self.release(m))).await;
        info!(count = mobiles.len(), "released all connections");
    }

    /// Connectivity snapshot per registered mobile.
    pub async fn health_map(&self) -> HealthMap {
        let connections = self.connections.read().await;
        connections
            .iter()
            .map(|(m, c)| (m.clone(), c.is_active() && c.client.is_connected()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn mobiles(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    // ── Internal ────────────────────────────────────────────────────────

    async fn lookup_live(&self, mobile: &str) -> Option<Arc<ActiveConnection>> {
        let connections = self.connections.read().await;
        connections
            .get(mobile)
            .filter(|c| c.is_active() && c.client.is_connected())
            .cloned()
    }

    async fn creation_gate(&self, mobile: &str) -> Arc<Mutex<()>> {
        let mut gates = self.creation_gates.lock().await;
        Arc::clone(gates.entry(mobile.to_string()).or_default())
    }

    /// Remove `mobile` from the map, but only if it still points at `conn`
    /// (a concurrent acquire may have installed a fresh handle).
    async fn evict(&self, mobile: &str, conn: &Arc<ActiveConnection>) {
        let mut connections = self.connections.write().await;
        if let Some(current) = connections.get(mobile) {
            if Arc::ptr_eq(current, conn) {
                connections.remove(mobile);
            }
        }
    }

    async fn create_connection(&self, mobile: &str) -> Result<Arc<ActiveConnection>, ClientError> {
        {
            let connections = self.connections.read().await;
            if connections.len() >= self.cfg.max_concurrent_connections {
                return Err(ClientError::LimitReached(self.cfg.max_concurrent_connections));
            }
        }

        match self.accounts.find_by_mobile(mobile).await {
            Ok(Some(account)) if !account.expired => {},
            Ok(_) => return Err(ClientError::AccountNotFound(mobile.to_string())),
            Err(e) => {
                warn!(mobile, error = %e, "account lookup failed");
                return Err(ClientError::AccountNotFound(mobile.to_string()));
            },
        }

        let client = match tokio::time::timeout(self.connect_timeout(), self.factory.create(mobile))
            .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                self.handle_permanent(mobile, &e).await;
                return Err(e);
            },
            Err(_) => return Err(ClientError::Timeout(self.connect_timeout())),
        };

        if !client.is_connected() {
            match tokio::time::timeout(self.connect_timeout(), client.connect()).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    self.handle_permanent(mobile, &e).await;
                    return Err(e);
                },
                Err(_) => return Err(ClientError::Timeout(self.connect_timeout())),
            }
        }

        let conn = Arc::new(ActiveConnection::new(mobile, client, now_ms()));
        {
            let mut connections = self.connections.write().await;
            connections.insert(mobile.to_string(), Arc::clone(&conn));
        }

        info!(mobile, "registered new client connection");
        Ok(conn)
    }

    /// Permanent failures expire the owning account so rotation stops
    /// selecting this mobile until the record changes.
    async fn handle_permanent(&self, mobile: &str, error: &ClientError) {
        let ClientError::Permanent(failure) = error else {
            return;
        };

        warn!(mobile, code = failure.as_code(), "permanent account failure");
        if let Err(e) = self.accounts.mark_expired(mobile).await {
            warn!(mobile, error = %e, "failed to mark account expired");
        }
        self.notifier
            .notify(&NotifyEvent::AccountExpired {
                mobile: mobile.to_string(),
                reason: failure.as_code().to_string(),
            })
            .await;
    }
}
