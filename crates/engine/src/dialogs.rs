//! Channel discovery: turn a session's dialog list into its visit order.

use std::collections::{HashMap, HashSet};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use {
    crier_common::{mobile_seed, normalize_channel_id},
    crier_stores::BannedFeed,
    crier_transport::{ClientError, RemoteClient},
};

use crate::session::PromotionOutcome;

/// Dialogs requested from the transport per refill.
pub const DIALOG_FETCH_LIMIT: usize = 500;

/// Channels smaller than this are not worth a send slot.
pub const MIN_PARTICIPANTS: i64 = 500;

/// Visit-list cap per session.
pub const MAX_CHANNELS: usize = 250;

/// Fetch and filter the session's dialogs into a channel visit list.
///
/// Keeps sendable non-broadcast groups above the participant threshold,
/// deduplicated. Past-due sessions (`days_left < 0`) consult the shared
/// ban feed instead of their (wiped) outcome history; everyone else skips
/// channels they have already failed in. The result is sorted by audience
/// size, capped, then shuffled with a mobile-derived seed so each session
/// walks a different but reproducible order.
pub async fn fetch_dialogs(
    client: &dyn RemoteClient,
    mobile: &str,
    days_left: i64,
    results: &HashMap<String, PromotionOutcome>,
    banned_feed: &BannedFeed,
) -> Result<Vec<String>, ClientError> {
    let dialogs = client.get_dialogs(DIALOG_FETCH_LIMIT).await?;
    if dialogs.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen = HashSet::new();
    let mut candidates: Vec<(String, i64)> = Vec::new();
    for dialog in dialogs {
        let entity = dialog.entity;
        let Some(ref raw_id) = entity.id else {
            continue;
        };
        if entity.broadcast || entity.send_messages_banned || entity.restricted {
            continue;
        }
        if entity.participants_count <= MIN_PARTICIPANTS {
            continue;
        }
        let id = normalize_channel_id(raw_id);
        if !seen.insert(id.clone()) {
            continue;
        }
        candidates.push((id, entity.participants_count));
    }

    if days_left < 0 {
        if let Some(banned) = banned_feed.fetch().await {
            let banned: HashSet<String> =
                banned.iter().map(|id| normalize_channel_id(id)).collect();
            candidates.retain(|(id, _)| !banned.contains(id));
        }
    } else {
        candidates.retain(|(id, _)| results.get(id).is_none_or(|r| r.success));
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    candidates.truncate(MAX_CHANNELS);

    let mut ids: Vec<String> = candidates.into_iter().map(|(id, _)| id).collect();
    let mut rng = StdRng::seed_from_u64(u64::from(mobile_seed(mobile)));
    ids.shuffle(&mut rng);
    Ok(ids)
}
