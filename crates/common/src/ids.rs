//! Identifier helpers: channel-id normalisation and per-mobile seeds.

/// Strip the MTProto supergroup marker from a channel id.
///
/// Telegram prefixes supergroup/channel peer ids with `-100`; stores and
/// session state key channels by the bare id, so the marker is removed at
/// ingest. Ids without the marker pass through unchanged.
pub fn normalize_channel_id(raw: &str) -> String {
    raw.strip_prefix("-100").unwrap_or(raw).to_string()
}

/// 32-bit string hash of a mobile number, used to seed that mobile's
/// channel-shuffle PRNG so each session visits channels in a different
/// but reproducible order.
///
/// The classic `h = (h << 5) - h + ch` hash, wrapping at i32.
pub fn mobile_seed(mobile: &str) -> u32 {
    let mut h: i32 = 0;
    for ch in mobile.chars() {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(ch as i32);
    }
    h.unsigned_abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_supergroup_marker() {
        assert_eq!(normalize_channel_id("-1001234567890"), "1234567890");
    }

    #[test]
    fn bare_id_unchanged() {
        assert_eq!(normalize_channel_id("1234567890"), "1234567890");
    }

    #[test]
    fn plain_negative_id_unchanged() {
        // Only the -100 marker is stripped, not any leading minus.
        assert_eq!(normalize_channel_id("-999"), "-999");
    }

    #[test]
    fn seed_is_deterministic() {
        assert_eq!(mobile_seed("+15551234567"), mobile_seed("+15551234567"));
    }

    #[test]
    fn seed_differs_per_mobile() {
        assert_ne!(mobile_seed("+15551234567"), mobile_seed("+15557654321"));
    }

    #[test]
    fn empty_mobile_seeds_zero() {
        assert_eq!(mobile_seed(""), 0);
    }
}
