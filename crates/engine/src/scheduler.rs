//! The global promotion tick.
//!
//! Every tick drains due verifications, then walks the healthy sessions
//! in small concurrent batches, each making at most one send. No error
//! kind crosses the tick boundary: every failure is classified, recorded,
//! and the driver keeps running.

use std::{sync::Arc, time::Duration};

use {
    rand::{rngs::StdRng, Rng, SeedableRng},
    tokio::{sync::Mutex, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    crier_common::now_ms,
    crier_config::{HealthConfig, PromoterConfig},
    crier_stores::{BannedFeed, ChannelRecord, ChannelStore, Notifier, NotifyEvent},
    crier_transport::{
        health::deep_probe, ActiveConnection, ChatEntity, ClientRegistry, SendOutcome, SendTarget,
    },
};

use crate::{
    compose, dialogs,
    session::SessionTracker,
    verify::{PendingVerification, VerificationQueue},
};

pub struct PromotionScheduler {
    registry: Arc<ClientRegistry>,
    tracker: Arc<SessionTracker>,
    verify: Arc<VerificationQueue>,
    channels: Arc<dyn ChannelStore>,
    notifier: Arc<Notifier>,
    banned_feed: Arc<BannedFeed>,
    cfg: PromoterConfig,
    health_cfg: HealthConfig,
    rng: std::sync::Mutex<StdRng>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PromotionScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ClientRegistry>,
        tracker: Arc<SessionTracker>,
        verify: Arc<VerificationQueue>,
        channels: Arc<dyn ChannelStore>,
        notifier: Arc<Notifier>,
        banned_feed: Arc<BannedFeed>,
        cfg: PromoterConfig,
        health_cfg: HealthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tracker,
            verify,
            channels,
            notifier,
            banned_feed,
            cfg,
            health_cfg,
            rng: std::sync::Mutex::new(StdRng::from_os_rng()),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Reseed the shared PRNG; tests use this for reproducible picks.
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock().unwrap_or_else(|e| e.into_inner()) = StdRng::seed_from_u64(seed);
    }

    /// Spawn the tick loop.
    pub async fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let interval = Duration::from_millis(self.cfg.tick_interval_ms);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {},
                    () = cancel.cancelled() => break,
                }
                scheduler.tick().await;
            }
        });

        *self.handle.lock().await = Some(handle);
        info!(interval_ms = self.cfg.tick_interval_ms, "promotion scheduler started");
    }

    /// Stop the loop; the in-flight tick is allowed to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("promotion scheduler stopped");
    }

    /// One global tick: drain verifications, then batch the healthy
    /// sessions through one send each.
    pub async fn tick(&self) {
        let now = now_ms();

        self.verify
            .drain(
                now,
                &self.registry,
                self.channels.as_ref(),
                &self.notifier,
                &self.tracker,
            )
            .await;

        self.tracker.cleanup(now, self.cfg.max_results_size);

        let healthy = self.tracker.healthy_mobiles(now);
        if healthy.is_empty() {
            return;
        }
        debug!(count = healthy.len(), "promotion tick");

        for batch in healthy.chunks(self.cfg.batch_size.max(1)) {
            futures::future::join_all(batch.iter().map(|mobile| self.promote_one(mobile))).await;
        }
    }

    /// One session's send attempt, staggered to decorrelate API access.
    async fn promote_one(&self, mobile: &str) {
        let stagger = self.random_stagger();
        if stagger > 0 {
            tokio::time::sleep(Duration::from_millis(stagger)).await;
        }

        let now = now_ms();

        let conn = match self.registry.acquire(mobile).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(mobile, error = %e, "skipping: no client");
                return;
            },
        };

        if conn.deep_probe_stale(now, self.health_cfg.deep_probe_interval_ms as i64)
            && !deep_probe(&conn, self.health_cfg.probe_timeout_ms).await
        {
            debug!(mobile, "skipping: identity probe failed");
            return;
        }

        if !self.ensure_channels(mobile, &conn).await {
            return;
        }

        let Some(channel_id) = self
            .tracker
            .with_state(mobile, |s| s.current_channel().map(str::to_string))
            .flatten()
        else {
            return;
        };

        let banned = self
            .tracker
            .with_state(mobile, |s| s.banned_channels(now))
            .unwrap_or_default();
        if banned.contains(&channel_id) {
            debug!(mobile, channel = %channel_id, "skipping banned-for-mobile channel");
            self.advance(mobile);
            return;
        }

        let Some(record) = self.resolve_channel(&channel_id, &conn).await else {
            self.advance(mobile);
            return;
        };
        if record.banned {
            self.advance(mobile);
            return;
        }

        // Re-entrancy: one send in flight per mobile. The permit clears
        // the flag on every exit path below.
        let Some(_permit) = self.tracker.begin_send(mobile) else {
            return;
        };

        // Cooldown re-check inside the send path.
        let sleeping = self
            .tracker
            .with_state(mobile, |s| s.sleep_time >= now)
            .unwrap_or(false);
        if sleeping {
            self.advance(mobile);
            return;
        }

        let Some((variant, message)) = self.compose_for(mobile, &record) else {
            warn!(mobile, channel = %channel_id, "no template available");
            return;
        };

        let outcome = self.send_with_bypass(mobile, &conn, &record, &message).await;
        self.apply_outcome(mobile, &channel_id, &variant, outcome, now);
        self.advance(mobile);
    }

    // ── Send-step helpers ───────────────────────────────────────────────

    /// Refill the session's visit list from its dialogs when empty.
    /// Returns `false` when the session still has nothing to visit.
    async fn ensure_channels(&self, mobile: &str, conn: &Arc<ActiveConnection>) -> bool {
        let needs_refill = self
            .tracker
            .with_state(mobile, |s| s.channels.is_empty())
            .unwrap_or(true);
        if !needs_refill {
            return true;
        }

        let (days_left, results) = self
            .tracker
            .with_state(mobile, |s| (s.days_left, s.promotion_results.clone()))
            .unwrap_or((-1, Default::default()));

        match dialogs::fetch_dialogs(
            conn.client.as_ref(),
            mobile,
            days_left,
            &results,
            &self.banned_feed,
        )
        .await
        {
            Ok(ids) if ids.is_empty() => {
                debug!(mobile, "no eligible channels in dialogs");
                false
            },
            Ok(ids) => {
                info!(mobile, count = ids.len(), "channel list refilled");
                self.tracker.with_state(mobile, |s| s.set_channels(ids));
                true
            },
            Err(e) => {
                warn!(mobile, error = %e, "dialog fetch failed");
                false
            },
        }
    }

    /// Cache-through channel metadata: store first, transport on miss.
    async fn resolve_channel(
        &self,
        channel_id: &str,
        conn: &Arc<ActiveConnection>,
    ) -> Option<ChannelRecord> {
        match self.channels.find_one(channel_id).await {
            Ok(Some(record)) => return Some(record),
            Ok(None) => {},
            Err(e) => {
                warn!(channel = channel_id, error = %e, "channel lookup failed");
                return None;
            },
        }

        let entity = match conn.client.get_entity(channel_id).await {
            Ok(entity) => entity,
            Err(e) => {
                warn!(channel = channel_id, error = %e, "entity resolution failed");
                return None;
            },
        };

        let record = record_from_entity(channel_id, entity);
        if let Err(e) = self.channels.upsert(record.clone()).await {
            warn!(channel = channel_id, error = %e, "channel write-back failed");
        }
        Some(record)
    }

    /// Pick a variant and build the outgoing text.
    fn compose_for(&self, mobile: &str, record: &ChannelRecord) -> Option<(String, String)> {
        let variants: Vec<String> = if record.available_msgs.is_empty() {
            vec!["0".to_string()]
        } else {
            record.available_msgs.clone()
        };

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let variant = compose::pick_variant(&variants, &mut rng);

        let template = self
            .tracker
            .with_state(mobile, |s| {
                s.promote_msgs
                    .get(&variant)
                    .or_else(|| s.promote_msgs.get("0"))
                    .cloned()
            })
            .flatten()?;

        let message = compose::compose_message(&template, record.word_restriction, &mut rng);
        Some((variant, message))
    }

    /// Send to the channel id; on `CHANNEL_PRIVATE` with a known username,
    /// retry once through the username.
    async fn send_with_bypass(
        &self,
        mobile: &str,
        conn: &Arc<ActiveConnection>,
        record: &ChannelRecord,
        message: &str,
    ) -> SendOutcome {
        let target = SendTarget::ChannelId(record.channel_id.clone());
        let outcome = conn.client.send_message(&target, message).await;

        if outcome != SendOutcome::ChannelPrivate {
            return outcome;
        }
        let Some(ref username) = record.username else {
            return outcome;
        };

        debug!(mobile, channel = %record.channel_id, "private channel; retrying via username");
        let retry = conn
            .client
            .send_message(&SendTarget::Username(username.clone()), message)
            .await;
        if matches!(retry, SendOutcome::Sent { .. }) {
            self.notifier
                .notify(&NotifyEvent::PrivateChannelBypass {
                    channel_id: record.channel_id.clone(),
                    mobile: mobile.to_string(),
                })
                .await;
        }
        retry
    }

    /// Book the outcome into session state; successes feed verification.
    fn apply_outcome(
        &self,
        mobile: &str,
        channel_id: &str,
        variant: &str,
        outcome: SendOutcome,
        now: i64,
    ) {
        match outcome {
            SendOutcome::Sent { message_id } => {
                self.tracker.update_last_message_time(mobile, now);
                self.tracker.inc_success(mobile);
                self.tracker.inc_message_count(mobile);
                self.tracker.set_failure_reason(mobile, None);
                self.tracker.record_outcome(mobile, channel_id, true, None, now);
                self.verify.push(
                    mobile,
                    PendingVerification {
                        channel_id: channel_id.to_string(),
                        message_id,
                        variant: variant.to_string(),
                        timestamp_ms: now,
                    },
                );
                info!(mobile, channel = channel_id, id = message_id, "promotion sent");
            },
            SendOutcome::FloodWait { seconds } => {
                let until = now + i64::from(seconds) * 1000;
                self.tracker.set_sleep(mobile, until);
                self.record_failure(mobile, channel_id, "FLOOD_WAIT", now);
                warn!(mobile, seconds, "flood wait; session sleeping");
            },
            other => {
                let code = other
                    .error_code()
                    .unwrap_or_else(|| "UNKNOWN_ERROR".to_string());
                self.record_failure(mobile, channel_id, &code, now);
                debug!(mobile, channel = channel_id, code, "send failed");
            },
        }
    }

    fn record_failure(&self, mobile: &str, channel_id: &str, code: &str, now: i64) {
        self.tracker
            .record_outcome(mobile, channel_id, false, Some(code.to_string()), now);
        self.tracker.inc_failed(mobile);
        self.tracker.set_failure_reason(mobile, Some(code.to_string()));
    }

    fn advance(&self, mobile: &str) {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        self.tracker.advance_channel(mobile, &mut rng);
    }

    fn random_stagger(&self) -> u64 {
        if self.cfg.start_stagger_ms == 0 {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.random_range(0..=self.cfg.start_stagger_ms)
    }
}

fn record_from_entity(channel_id: &str, entity: ChatEntity) -> ChannelRecord {
    ChannelRecord {
        channel_id: channel_id.to_string(),
        title: entity.title,
        username: entity.username,
        participants_count: entity.participants_count,
        broadcast: entity.broadcast,
        restricted: entity.restricted,
        can_send_msgs: !entity.send_messages_banned,
        word_restriction: 0,
        available_msgs: vec!["0".to_string()],
        banned: false,
        last_message_time: 0,
    }
}
