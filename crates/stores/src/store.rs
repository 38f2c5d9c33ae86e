use std::collections::HashMap;

use {anyhow::Result, async_trait::async_trait};

use crate::records::{AccountRecord, ChannelPatch, ChannelRecord};

/// Persistent storage for channel metadata. Consumed and mutated by the core:
/// the verification queue removes message variants and flags bans here.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn find_one(&self, channel_id: &str) -> Result<Option<ChannelRecord>>;

    /// Insert or replace a full record (cache-through on discovery).
    async fn upsert(&self, record: ChannelRecord) -> Result<()>;

    /// Apply a partial update. No-op if the channel is unknown.
    async fn update(&self, channel_id: &str, patch: ChannelPatch) -> Result<()>;

    /// Remove one template variant from the channel's allowed set.
    async fn remove_from_available_msgs(&self, channel_id: &str, variant: &str) -> Result<()>;

    /// Page through non-banned channels, excluding the given ids.
    async fn active_channels(
        &self,
        limit: usize,
        skip: usize,
        exclude_ids: &[String],
    ) -> Result<Vec<ChannelRecord>>;
}

/// Read-only catalog of promotional message templates, keyed by variant index.
/// Variant `"0"` is the guaranteed fallback.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn find_one(&self) -> Result<HashMap<String, String>>;
}

/// Account records owning the promote mobiles.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// All non-expired accounts with their promote mobiles.
    async fn get_active_clients(&self) -> Result<Vec<AccountRecord>>;

    /// Find the account owning a mobile, if any.
    async fn find_by_mobile(&self, mobile: &str) -> Result<Option<AccountRecord>>;

    /// Mark the account owning `mobile` as expired. Permanently-failed
    /// sessions land here and leave rotation until the record changes.
    async fn mark_expired(&self, mobile: &str) -> Result<()>;
}
