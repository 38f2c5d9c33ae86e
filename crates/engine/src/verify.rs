//! Post-send verification: did the message survive moderation?
//!
//! Every successful send enqueues a [`PendingVerification`]; once it ages
//! past the check delay, the channel history is probed. A missing message
//! mutates channel metadata: the deleted variant is retired, and losing
//! the canary variant `"0"` with nothing left bans the channel outright.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use tracing::{debug, info, warn};

use {
    crier_stores::{ChannelPatch, ChannelStore, Notifier, NotifyEvent},
    crier_transport::ClientRegistry,
};

use crate::session::SessionTracker;

/// A sent message awaiting its survival probe.
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub channel_id: String,
    pub message_id: i64,
    pub variant: String,
    pub timestamp_ms: i64,
}

/// Per-mobile FIFO of recently sent messages.
pub struct VerificationQueue {
    queues: Mutex<HashMap<String, VecDeque<PendingVerification>>>,
    /// Age before an entry becomes due.
    check_delay_ms: i64,
    /// Per-mobile cap; overflow drops the oldest 10%.
    max_len: usize,
}

impl VerificationQueue {
    pub fn new(check_delay_ms: u64, max_len: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            check_delay_ms: check_delay_ms as i64,
            max_len,
        }
    }

    pub fn push(&self, mobile: &str, item: PendingVerification) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(mobile.to_string()).or_default();
        queue.push_back(item);

        if queue.len() > self.max_len {
            let drop_count = self.max_len / 10;
            queue.drain(..drop_count);
            warn!(mobile, dropped = drop_count, "verification queue overflow");
        }
    }

    pub fn len(&self, mobile: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.get(mobile).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.values().all(VecDeque::is_empty)
    }

    /// Remove and return every entry old enough to probe, FIFO per mobile.
    fn take_due(&self, now: i64) -> Vec<(String, PendingVerification)> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        for (mobile, queue) in queues.iter_mut() {
            while queue
                .front()
                .is_some_and(|item| now - item.timestamp_ms >= self.check_delay_ms)
            {
                if let Some(item) = queue.pop_front() {
                    due.push((mobile.clone(), item));
                }
            }
        }
        due
    }

    /// Probe every due entry. Entries are consumed whether the probe
    /// succeeds, the message is gone, or the transport errors; failures
    /// are logged, never retried.
    pub async fn drain(
        &self,
        now: i64,
        registry: &ClientRegistry,
        channels: &dyn ChannelStore,
        notifier: &Notifier,
        tracker: &SessionTracker,
    ) {
        for (mobile, item) in self.take_due(now) {
            self.probe(&mobile, item, now, registry, channels, notifier, tracker)
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn probe(
        &self,
        mobile: &str,
        item: PendingVerification,
        now: i64,
        registry: &ClientRegistry,
        channels: &dyn ChannelStore,
        notifier: &Notifier,
        tracker: &SessionTracker,
    ) {
        let Some(client) = registry.get(mobile).await else {
            warn!(mobile, channel = item.channel_id, "no client for verification probe");
            return;
        };

        let messages = match client
            .get_messages(&item.channel_id, item.message_id - 2)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(mobile, channel = item.channel_id, error = %e, "verification probe failed");
                return;
            },
        };

        tracker.update_last_checked_time(mobile, now);

        let survived = messages.first().is_some_and(|m| m.id == item.message_id);
        if survived {
            debug!(mobile, channel = item.channel_id, id = item.message_id, "message survived");
            if let Err(e) = channels
                .update(&item.channel_id, ChannelPatch::last_message_time(now))
                .await
            {
                warn!(channel = item.channel_id, error = %e, "channel refresh failed");
            }
            return;
        }

        self.handle_deletion(&item, channels, notifier).await;
    }

    /// A verified deletion. Losing the canary variant `"0"` with no
    /// variants left bans the channel; any other deletion just retires
    /// that variant.
    async fn handle_deletion(
        &self,
        item: &PendingVerification,
        channels: &dyn ChannelStore,
        notifier: &Notifier,
    ) {
        let record = match channels.find_one(&item.channel_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(channel = item.channel_id, "deleted message in unknown channel");
                return;
            },
            Err(e) => {
                warn!(channel = item.channel_id, error = %e, "channel lookup failed");
                return;
            },
        };

        if item.variant == "0" && record.available_msgs.is_empty() {
            info!(channel = item.channel_id, "canary variant deleted; banning channel");
            if let Err(e) = channels
                .update(&item.channel_id, ChannelPatch::banned(true))
                .await
            {
                warn!(channel = item.channel_id, error = %e, "channel ban failed");
            }
            notifier
                .notify(&NotifyEvent::ChannelBanned {
                    channel_id: item.channel_id.clone(),
                })
                .await;
        } else {
            info!(
                channel = item.channel_id,
                variant = item.variant,
                "message deleted; retiring variant"
            );
            if let Err(e) = channels
                .remove_from_available_msgs(&item.channel_id, &item.variant)
                .await
            {
                warn!(channel = item.channel_id, error = %e, "variant removal failed");
            }
            notifier
                .notify(&NotifyEvent::VariantRemoved {
                    channel_id: item.channel_id.clone(),
                    variant: item.variant.clone(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(channel: &str, id: i64, ts: i64) -> PendingVerification {
        PendingVerification {
            channel_id: channel.into(),
            message_id: id,
            variant: "0".into(),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn due_respects_delay_and_fifo() {
        let queue = VerificationQueue::new(10_000, 1_000);
        queue.push("+1", item("c1", 1, 0));
        queue.push("+1", item("c1", 2, 5_000));
        queue.push("+1", item("c1", 3, 20_000));

        let due = queue.take_due(15_000);
        let ids: Vec<i64> = due.iter().map(|(_, i)| i.message_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(queue.len("+1"), 1);
    }

    #[test]
    fn due_stops_at_first_young_entry() {
        let queue = VerificationQueue::new(10_000, 1_000);
        // Young entry ahead of an old one: FIFO order is preserved, so
        // nothing behind it is taken.
        queue.push("+1", item("c1", 1, 10_000));
        queue.push("+1", item("c1", 2, 0));

        let due = queue.take_due(15_000);
        assert!(due.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_tenth() {
        let queue = VerificationQueue::new(10_000, 1_000);
        for i in 0..1_001 {
            queue.push("+1", item("c1", i, i));
        }
        // 1_001st push overflowed: exactly 100 oldest dropped.
        assert_eq!(queue.len("+1"), 901);

        let due = queue.take_due(i64::MAX);
        assert_eq!(due.first().unwrap().1.message_id, 100);
    }

    #[test]
    fn queues_are_per_mobile() {
        let queue = VerificationQueue::new(10_000, 1_000);
        queue.push("+1", item("c1", 1, 0));
        queue.push("+2", item("c2", 2, 0));
        assert_eq!(queue.len("+1"), 1);
        assert_eq!(queue.len("+2"), 1);
        assert!(!queue.is_empty());
    }
}
