//! Simulated loopback transport for tests and dry runs.
//!
//! [`SimNetwork`] is the shared world: which mobiles are connected, which
//! channels hold which messages, and what the next send should return.
//! Outcomes are injectable per mobile and every call is recorded, so
//! scenario tests can drive the full control plane without a wire.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    client::{ChatEntity, ClientFactory, Dialog, MessageRef, RemoteClient, SelfInfo, SendOutcome,
             SendTarget},
    error::ClientError,
};

/// A successful send captured by the simulator.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub mobile: String,
    pub channel_id: String,
    pub target: String,
    pub text: String,
    pub message_id: i64,
}

#[derive(Default)]
struct NetworkState {
    connected: HashMap<String, bool>,
    connect_counts: HashMap<String, u32>,
    disconnect_counts: HashMap<String, u32>,
    connect_failures: HashMap<String, ClientError>,
    self_failures: HashMap<String, ClientError>,
    dialogs: HashMap<String, Vec<Dialog>>,
    entities: HashMap<String, ChatEntity>,
    send_scripts: HashMap<String, VecDeque<SendOutcome>>,
    send_attempts: HashMap<String, u32>,
    sent: Vec<SentRecord>,
    /// Surviving message ids per channel, ascending.
    channel_messages: HashMap<String, Vec<i64>>,
    next_message_id: i64,
    /// Ordered log of connect/disconnect events, e.g. `"connect:+1"`.
    events: Vec<String>,
}

/// Shared state behind every [`SimClient`] of one test world.
#[derive(Default)]
pub struct SimNetwork {
    state: Mutex<NetworkState>,
}

impl SimNetwork {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Scripting ───────────────────────────────────────────────────────

    /// Make every connect attempt for `mobile` fail with `error` until
    /// [`Self::clear_connect_failure`] is called.
    pub fn script_connect_failure(&self, mobile: &str, error: ClientError) {
        self.lock().connect_failures.insert(mobile.into(), error);
    }

    pub fn clear_connect_failure(&self, mobile: &str) {
        self.lock().connect_failures.remove(mobile);
    }

    /// Make `get_self` fail for `mobile` until cleared.
    pub fn script_self_failure(&self, mobile: &str, error: ClientError) {
        self.lock().self_failures.insert(mobile.into(), error);
    }

    pub fn clear_self_failure(&self, mobile: &str) {
        self.lock().self_failures.remove(mobile);
    }

    /// Queue the outcome of the next send from `mobile`. Unscripted sends
    /// succeed with a fresh message id.
    pub fn script_send(&self, mobile: &str, outcome: SendOutcome) {
        self.lock()
            .send_scripts
            .entry(mobile.into())
            .or_default()
            .push_back(outcome);
    }

    /// Register an entity, resolvable by id and (for sends) by username.
    pub fn add_entity(&self, entity: ChatEntity) {
        if let Some(ref id) = entity.id {
            self.lock().entities.insert(id.clone(), entity);
        }
    }

    /// Add a dialog entry to `mobile`'s listing, registering its entity.
    pub fn add_dialog(&self, mobile: &str, entity: ChatEntity) {
        self.add_entity(entity.clone());
        self.lock()
            .dialogs
            .entry(mobile.into())
            .or_default()
            .push(Dialog { entity });
    }

    /// Drop a message from a channel, as if moderation deleted it.
    pub fn delete_message(&self, channel_id: &str, message_id: i64) {
        if let Some(ids) = self.lock().channel_messages.get_mut(channel_id) {
            ids.retain(|&id| id != message_id);
        }
    }

    pub fn force_disconnect(&self, mobile: &str) {
        self.lock().connected.insert(mobile.into(), false);
    }

    // ── Inspection ──────────────────────────────────────────────────────

    pub fn connect_count(&self, mobile: &str) -> u32 {
        *self.lock().connect_counts.get(mobile).unwrap_or(&0)
    }

    pub fn disconnect_count(&self, mobile: &str) -> u32 {
        *self.lock().disconnect_counts.get(mobile).unwrap_or(&0)
    }

    pub fn send_attempts(&self, mobile: &str) -> u32 {
        *self.lock().send_attempts.get(mobile).unwrap_or(&0)
    }

    pub fn sent_messages(&self) -> Vec<SentRecord> {
        self.lock().sent.clone()
    }

    /// Connect/disconnect events in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn message_exists(&self, channel_id: &str, message_id: i64) -> bool {
        self.lock()
            .channel_messages
            .get(channel_id)
            .is_some_and(|ids| ids.contains(&message_id))
    }

    // ── Client-facing operations ────────────────────────────────────────

    fn connect(&self, mobile: &str) -> Result<(), ClientError> {
        let mut state = self.lock();
        if let Some(err) = state.connect_failures.get(mobile) {
            return Err(err.clone());
        }
        state.connected.insert(mobile.into(), true);
        *state.connect_counts.entry(mobile.into()).or_default() += 1;
        state.events.push(format!("connect:{mobile}"));
        Ok(())
    }

    fn disconnect(&self, mobile: &str) {
        let mut state = self.lock();
        state.connected.insert(mobile.into(), false);
        *state.disconnect_counts.entry(mobile.into()).or_default() += 1;
        state.events.push(format!("disconnect:{mobile}"));
    }

    fn is_connected(&self, mobile: &str) -> bool {
        *self.lock().connected.get(mobile).unwrap_or(&false)
    }

    fn get_self(&self, mobile: &str) -> Result<SelfInfo, ClientError> {
        let state = self.lock();
        if let Some(err) = state.self_failures.get(mobile) {
            return Err(err.clone());
        }
        Ok(SelfInfo {
            username: Some(format!("sim{}", mobile.trim_start_matches('+'))),
            first_name: "Sim".into(),
        })
    }

    fn get_dialogs(&self, mobile: &str, limit: usize) -> Vec<Dialog> {
        let state = self.lock();
        state
            .dialogs
            .get(mobile)
            .map(|d| d.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn get_entity(&self, channel_id: &str) -> Result<ChatEntity, ClientError> {
        self.lock()
            .entities
            .get(channel_id)
            .cloned()
            .ok_or_else(|| ClientError::Transport("CHANNEL_INVALID".into()))
    }

    fn get_messages(&self, channel_id: &str, min_id: i64) -> Vec<MessageRef> {
        let state = self.lock();
        let mut ids: Vec<i64> = state
            .channel_messages
            .get(channel_id)
            .map(|ids| ids.iter().copied().filter(|&id| id > min_id).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids.into_iter().map(|id| MessageRef { id }).collect()
    }

    fn send_message(&self, mobile: &str, target: &SendTarget, text: &str) -> SendOutcome {
        let mut state = self.lock();
        *state.send_attempts.entry(mobile.into()).or_default() += 1;

        if !state.connected.get(mobile).copied().unwrap_or(false) {
            return SendOutcome::Transient {
                cause: "ERR_NETWORK".into(),
            };
        }

        if let Some(scripted) = state
            .send_scripts
            .get_mut(mobile)
            .and_then(|q| q.pop_front())
        {
            if let SendOutcome::Sent { message_id } = scripted {
                let channel_id = resolve_channel(&state, target);
                record_sent(&mut state, mobile, target, &channel_id, text, message_id);
            }
            return scripted;
        }

        state.next_message_id += 1;
        let message_id = state.next_message_id;
        let channel_id = resolve_channel(&state, target);
        record_sent(&mut state, mobile, target, &channel_id, text, message_id);
        SendOutcome::Sent { message_id }
    }
}

fn resolve_channel(state: &NetworkState, target: &SendTarget) -> String {
    match target {
        SendTarget::ChannelId(id) => id.clone(),
        SendTarget::Username(username) => state
            .entities
            .values()
            .find(|e| e.username.as_deref() == Some(username))
            .and_then(|e| e.id.clone())
            .unwrap_or_else(|| format!("@{username}")),
    }
}

fn record_sent(
    state: &mut NetworkState,
    mobile: &str,
    target: &SendTarget,
    channel_id: &str,
    text: &str,
    message_id: i64,
) {
    state
        .channel_messages
        .entry(channel_id.to_string())
        .or_default()
        .push(message_id);
    state.sent.push(SentRecord {
        mobile: mobile.to_string(),
        channel_id: channel_id.to_string(),
        target: target.to_string(),
        text: text.to_string(),
        message_id,
    });
}

/// One simulated session.
pub struct SimClient {
    mobile: String,
    network: Arc<SimNetwork>,
}

#[async_trait]
impl RemoteClient for SimClient {
    async fn connect(&self) -> Result<(), ClientError> {
        self.network.connect(&self.mobile)
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.network.disconnect(&self.mobile);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.network.is_connected(&self.mobile)
    }

    async fn get_self(&self) -> Result<SelfInfo, ClientError> {
        self.network.get_self(&self.mobile)
    }

    async fn get_dialogs(&self, limit: usize) -> Result<Vec<Dialog>, ClientError> {
        Ok(self.network.get_dialogs(&self.mobile, limit))
    }

    async fn get_entity(&self, channel_id: &str) -> Result<ChatEntity, ClientError> {
        self.network.get_entity(channel_id)
    }

    async fn get_messages(
        &self,
        channel_id: &str,
        min_id: i64,
    ) -> Result<Vec<MessageRef>, ClientError> {
        Ok(self.network.get_messages(channel_id, min_id))
    }

    async fn send_message(&self, target: &SendTarget, text: &str) -> SendOutcome {
        self.network.send_message(&self.mobile, target, text)
    }
}

/// Factory handing out [`SimClient`]s bound to one shared network.
pub struct SimFactory {
    network: Arc<SimNetwork>,
}

impl SimFactory {
    pub fn new(network: Arc<SimNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl ClientFactory for SimFactory {
    async fn create(&self, mobile: &str) -> Result<Arc<dyn RemoteClient>, ClientError> {
        {
            let state = self.network.lock();
            if let Some(err) = state.connect_failures.get(mobile) {
                return Err(err.clone());
            }
        }
        Ok(Arc::new(SimClient {
            mobile: mobile.to_string(),
            network: Arc::clone(&self.network),
        }))
    }
}
