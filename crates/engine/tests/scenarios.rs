//! End-to-end control-plane scenarios on the simulated transport.

use std::{collections::HashMap, sync::Arc};

use {
    crier_common::now_ms,
    crier_config::{CrierConfig, HealthConfig, PoolConfig, PromoterConfig},
    crier_engine::{
        PendingVerification, PromoterService, PromotionScheduler, SessionTracker,
        VerificationQueue,
    },
    crier_stores::{
        memory::{MemoryAccountStore, MemoryChannelStore, MemoryTemplateStore},
        AccountRecord, BannedFeed, ChannelRecord, ChannelStore, Notifier,
    },
    crier_transport::{
        sim::{SimFactory, SimNetwork},
        ChatEntity, ClientRegistry,
    },
};

const MIN_MS: i64 = 60 * 1000;

struct World {
    network: Arc<SimNetwork>,
    registry: Arc<ClientRegistry>,
    tracker: Arc<SessionTracker>,
    verify: Arc<VerificationQueue>,
    channels: Arc<MemoryChannelStore>,
    scheduler: Arc<PromotionScheduler>,
    notifier: Arc<Notifier>,
}

impl World {
    fn new(mobiles: &[&str]) -> Self {
        let network = SimNetwork::shared();
        let accounts = Arc::new(MemoryAccountStore::new(vec![AccountRecord {
            client_id: "acct".into(),
            promote_mobiles: mobiles.iter().map(|m| m.to_string()).collect(),
            days_left: 3,
            expired: false,
        }]));
        let notifier = Arc::new(Notifier::disabled());
        let registry = Arc::new(ClientRegistry::new(
            Arc::new(SimFactory::new(Arc::clone(&network))),
            accounts,
            Arc::clone(&notifier),
            PoolConfig::default(),
        ));
        let tracker = Arc::new(SessionTracker::new());
        let channels = Arc::new(MemoryChannelStore::new());

        let promoter_cfg = PromoterConfig {
            start_stagger_ms: 0,
            ..PromoterConfig::default()
        };
        let verify = Arc::new(VerificationQueue::new(
            promoter_cfg.message_check_delay_ms,
            promoter_cfg.max_queue_size,
        ));
        let scheduler = PromotionScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&verify),
            Arc::clone(&channels) as Arc<dyn crier_stores::ChannelStore>,
            Arc::clone(&notifier),
            Arc::new(BannedFeed::new(None)),
            promoter_cfg,
            HealthConfig::default(),
        );
        scheduler.reseed(7);

        Self {
            network,
            registry,
            tracker,
            verify,
            channels,
            scheduler,
            notifier,
        }
    }

    /// Make `mobile`'s session eligible for an immediate send.
    fn prime_session(&self, mobile: &str, channels: Vec<String>, template: &str) {
        let now = now_ms();
        self.tracker.ensure(mobile);
        self.tracker.with_state(mobile, |s| {
            s.days_left = 3;
            s.last_message_time = now - 10 * MIN_MS;
            s.set_channels(channels);
            s.promote_msgs = HashMap::from([("0".to_string(), template.to_string())]);
        });
    }

    /// A stored channel that always gets the raw template (restricted).
    async fn add_channel(&self, id: &str, variants: &[&str]) {
        let mut record = ChannelRecord::discovered(id, format!("chat-{id}"));
        record.participants_count = 1_000;
        record.word_restriction = 1;
        record.available_msgs = variants.iter().map(|v| v.to_string()).collect();
        self.channels
            .upsert(record)
            .await
            .expect("upsert channel");
    }

    async fn drain_verifications(&self, now: i64) {
        self.verify
            .drain(
                now,
                &self.registry,
                self.channels.as_ref(),
                &self.notifier,
                &self.tracker,
            )
            .await;
    }
}

// ── Scenario: happy send ────────────────────────────────────────────────────

#[tokio::test]
async fn happy_send() {
    let world = World::new(&["+1"]);
    world.add_channel("c1", &["0"]).await;
    world.prime_session("+1", vec!["c1".into()], "hi");

    world.scheduler.tick().await;

    let sent = world.network.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel_id, "c1");
    assert_eq!(sent[0].text, "hi");

    let state = world.tracker.snapshot("+1").unwrap();
    assert_eq!(state.success_count, 1);
    assert_eq!(state.message_count, 1);
    assert_eq!(state.failed_count, 0);
    assert_eq!(state.channel_index, 0);
    assert!(state.promotion_results["c1"].success);
    assert_eq!(state.promotion_results["c1"].count, 1);
    assert_eq!(world.verify.len("+1"), 1);
    assert!(!state.is_promoting);
}

// ── Scenario: flood wait ────────────────────────────────────────────────────

#[tokio::test]
async fn flood_wait_sets_cooldown() {
    let world = World::new(&["+1"]);
    world.add_channel("c1", &["0"]).await;
    world.prime_session("+1", vec!["c1".into()], "hi");
    world
        .network
        .script_send("+1", crier_transport::SendOutcome::FloodWait { seconds: 60 });

    let before = now_ms();
    world.scheduler.tick().await;

    let state = world.tracker.snapshot("+1").unwrap();
    assert_eq!(state.failed_count, 1);
    assert_eq!(state.success_count, 0);
    assert!(state.sleep_time >= before + 60_000);
    assert!(state.sleep_time <= now_ms() + 61_000);
    assert_eq!(state.failure_reason.as_deref(), Some("FLOOD_WAIT"));
    assert!(!state.is_healthy(now_ms()));
    assert_eq!(world.verify.len("+1"), 0);

    // The cooldown gates the next tick entirely.
    world.scheduler.tick().await;
    assert_eq!(world.network.send_attempts("+1"), 1);
}

// ── Scenario: verified deletion of a non-canary variant ─────────────────────

#[tokio::test]
async fn verified_deletion_retires_variant() {
    let world = World::new(&["+1"]);
    world.add_channel("c1", &["0", "3"]).await;
    world.registry.acquire("+1").await.unwrap();

    let now = now_ms();
    world.verify.push(
        "+1",
        PendingVerification {
            channel_id: "c1".into(),
            message_id: 500,
            variant: "3".into(),
            timestamp_ms: now - 11_000,
        },
    );
    // No message 500 exists in the sim: the probe sees a deletion.
    world.drain_verifications(now).await;

    let record = world.channels.find_one("c1").await.unwrap().unwrap();
    assert_eq!(record.available_msgs, vec!["0"]);
    assert!(!record.banned);
    assert_eq!(world.verify.len("+1"), 0);
}

// ── Scenario: canary deletion bans the channel ──────────────────────────────

#[tokio::test]
async fn canary_deletion_bans_channel() {
    let world = World::new(&["+1"]);
    world.add_channel("c2", &[]).await;
    world.registry.acquire("+1").await.unwrap();

    let now = now_ms();
    world.verify.push(
        "+1",
        PendingVerification {
            channel_id: "c2".into(),
            message_id: 500,
            variant: "0".into(),
            timestamp_ms: now - 11_000,
        },
    );
    world.drain_verifications(now).await;

    let record = world.channels.find_one("c2").await.unwrap().unwrap();
    assert!(record.banned);
}

// ── Scenario: survival refreshes the channel ────────────────────────────────

#[tokio::test]
async fn surviving_message_refreshes_channel() {
    let world = World::new(&["+1"]);
    world.add_channel("c1", &["0"]).await;
    world.prime_session("+1", vec!["c1".into()], "hi");

    world.scheduler.tick().await;
    let message_id = world.network.sent_messages()[0].message_id;
    assert!(world.network.message_exists("c1", message_id));

    // Probe fires once the entry has aged past the check delay.
    world.drain_verifications(now_ms() + 11_000).await;

    let record = world.channels.find_one("c1").await.unwrap().unwrap();
    assert!(record.last_message_time > 0);
    assert!(!record.banned);
    assert_eq!(record.available_msgs, vec!["0"]);
    assert_eq!(world.verify.len("+1"), 0);
}

// ── Scenario: banned-for-mobile channel is skipped ──────────────────────────

#[tokio::test]
async fn banned_channel_skipped_then_next_sends() {
    let world = World::new(&["+1"]);
    world.add_channel("c1", &["0"]).await;
    world.add_channel("c2", &["0"]).await;
    world.prime_session("+1", vec!["c1".into(), "c2".into()], "hi");

    let now = now_ms();
    world.tracker.with_state("+1", |s| {
        s.record_outcome(
            "c1",
            false,
            Some("USER_BANNED_IN_CHANNEL".into()),
            now - 24 * 60 * MIN_MS,
        );
    });

    // First tick: c1 detected banned-for-mobile, cursor advances, no send.
    world.scheduler.tick().await;
    assert_eq!(world.network.send_attempts("+1"), 0);
    let state = world.tracker.snapshot("+1").unwrap();
    assert_eq!(state.channel_index, 1);

    // Second tick: c2 sends.
    world.scheduler.tick().await;
    let sent = world.network.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].channel_id, "c2");
}

// ── Scenario: private channel recovered via username ────────────────────────

#[tokio::test]
async fn channel_private_retries_via_username() {
    let world = World::new(&["+1"]);
    let mut record = ChannelRecord::discovered("c1", "chat-c1");
    record.username = Some("promo_chat".into());
    record.word_restriction = 1;
    world.channels.upsert(record).await.unwrap();
    world.network.add_entity(ChatEntity {
        id: Some("c1".into()),
        title: "chat-c1".into(),
        username: Some("promo_chat".into()),
        megagroup: true,
        participants_count: 1_000,
        ..ChatEntity::default()
    });
    world.prime_session("+1", vec!["c1".into()], "hi");
    world
        .network
        .script_send("+1", crier_transport::SendOutcome::ChannelPrivate);

    world.scheduler.tick().await;

    // First attempt consumed the scripted rejection; the username retry
    // succeeded.
    assert_eq!(world.network.send_attempts("+1"), 2);
    let sent = world.network.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target, "@promo_chat");
    assert_eq!(sent[0].channel_id, "c1");

    let state = world.tracker.snapshot("+1").unwrap();
    assert_eq!(state.success_count, 1);
}

// ── Scenario: terminal channel error recorded ───────────────────────────────

#[tokio::test]
async fn user_banned_records_failure() {
    let world = World::new(&["+1"]);
    world.add_channel("c1", &["0"]).await;
    world.prime_session("+1", vec!["c1".into()], "hi");
    world
        .network
        .script_send("+1", crier_transport::SendOutcome::UserBanned);

    world.scheduler.tick().await;

    let state = world.tracker.snapshot("+1").unwrap();
    assert_eq!(state.failed_count, 1);
    let outcome = &state.promotion_results["c1"];
    assert!(!outcome.success);
    assert_eq!(outcome.error_message.as_deref(), Some("USER_BANNED_IN_CHANNEL"));
    // That channel is now banned-for-mobile.
    assert_eq!(state.banned_channels(now_ms()), vec!["c1".to_string()]);
}

// ── Scenario: rotation delta orders releases before acquires ────────────────

#[tokio::test]
async fn rotation_releases_precede_acquires() {
    use {crier_config::RotationConfig, crier_rotation::RotationEngine};

    let mobiles: Vec<String> = (1..=8).map(|i| format!("+1{i:03}")).collect();
    let refs: Vec<&str> = mobiles.iter().map(String::as_str).collect();
    let world = World::new(&refs);
    let engine = RotationEngine::with_seed(
        Arc::clone(&world.registry),
        RotationConfig::default(),
        11,
    );
    engine.initialize(mobiles).await;

    let before = world.network.events().len();
    engine.rotate().await;
    let events = world.network.events()[before..].to_vec();

    let last_disconnect = events
        .iter()
        .rposition(|e| e.starts_with("disconnect:"));
    let first_connect = events.iter().position(|e| e.starts_with("connect:"));
    if let (Some(d), Some(c)) = (last_disconnect, first_connect) {
        assert!(d < c, "disconnects must precede connects: {events:?}");
    }
}

// ── Scenario: discovery feeds the scheduler ─────────────────────────────────

#[tokio::test]
async fn empty_session_refills_from_dialogs_and_sends() {
    let world = World::new(&["+1"]);
    for i in 0..3 {
        world.network.add_dialog(
            "+1",
            ChatEntity {
                id: Some(format!("10{i}")),
                title: format!("group-{i}"),
                megagroup: true,
                participants_count: 1_000 + i,
                ..ChatEntity::default()
            },
        );
    }
    world.prime_session("+1", vec![], "promo");

    world.scheduler.tick().await;

    let state = world.tracker.snapshot("+1").unwrap();
    assert_eq!(state.channels.len(), 3);
    // The visited channel was cached through to the store.
    let sent = world.network.sent_messages();
    assert_eq!(sent.len(), 1);
    let cached = world
        .channels
        .find_one(&sent[0].channel_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.available_msgs, vec!["0"]);
}

// ── Service lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn service_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let network = SimNetwork::shared();
    network.add_dialog(
        "+1",
        ChatEntity {
            id: Some("100".into()),
            title: "group".into(),
            megagroup: true,
            participants_count: 1_000,
            ..ChatEntity::default()
        },
    );

    let mut cfg = CrierConfig::default();
    cfg.promoter.tick_interval_ms = 20;
    cfg.promoter.start_stagger_ms = 0;
    cfg.persistence.dir = dir.path().to_string_lossy().into_owned();

    let service = PromoterService::build(
        cfg,
        Arc::new(SimFactory::new(Arc::clone(&network))),
        Arc::new(MemoryChannelStore::new()),
        Arc::new(MemoryTemplateStore::fallback_only("promo")),
        Arc::new(MemoryAccountStore::new(vec![AccountRecord {
            client_id: "acct".into(),
            promote_mobiles: vec!["+1".into()],
            days_left: 3,
            expired: false,
        }])),
    );

    service.start().await.unwrap();
    assert!(service.status().await.is_running);

    // Wait for the tick loop to produce a send.
    let mut sent = 0;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sent = world_sent(&network);
        if sent > 0 {
            break;
        }
    }
    assert!(sent > 0, "scheduler never sent");

    service.stop().await;
    assert!(!service.status().await.is_running);

    // Shutdown flushed the session snapshot.
    let stats = dir.path().join("mobileStats-+1.json");
    assert!(stats.exists());
    let raw = std::fs::read_to_string(stats).unwrap();
    assert!(raw.contains("\"successCount\""));
}

fn world_sent(network: &SimNetwork) -> usize {
    network.sent_messages().len()
}
