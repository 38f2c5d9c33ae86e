//! In-memory stores for tests and dry runs.

use std::{collections::HashMap, sync::Mutex};

use {anyhow::Result, async_trait::async_trait};

use crate::{
    records::{AccountRecord, ChannelPatch, ChannelRecord},
    store::{AccountStore, ChannelStore, TemplateStore},
};

/// `HashMap`-backed channel store. No persistence.
#[derive(Default)]
pub struct MemoryChannelStore {
    channels: Mutex<HashMap<String, ChannelRecord>>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(records: impl IntoIterator<Item = ChannelRecord>) -> Self {
        let store = Self::new();
        {
            let mut channels = store.channels.lock().unwrap_or_else(|e| e.into_inner());
            for rec in records {
                channels.insert(rec.channel_id.clone(), rec);
            }
        }
        store
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn find_one(&self, channel_id: &str) -> Result<Option<ChannelRecord>> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        Ok(channels.get(channel_id).cloned())
    }

    async fn upsert(&self, record: ChannelRecord) -> Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.insert(record.channel_id.clone(), record);
        Ok(())
    }

    async fn update(&self, channel_id: &str, patch: ChannelPatch) -> Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rec) = channels.get_mut(channel_id) {
            patch.apply(rec);
        }
        Ok(())
    }

    async fn remove_from_available_msgs(&self, channel_id: &str, variant: &str) -> Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rec) = channels.get_mut(channel_id) {
            rec.available_msgs.retain(|v| v != variant);
        }
        Ok(())
    }

    async fn active_channels(
        &self,
        limit: usize,
        skip: usize,
        exclude_ids: &[String],
    ) -> Result<Vec<ChannelRecord>> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut active: Vec<ChannelRecord> = channels
            .values()
            .filter(|c| !c.banned && !exclude_ids.contains(&c.channel_id))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.participants_count.cmp(&a.participants_count));
        Ok(active.into_iter().skip(skip).take(limit).collect())
    }
}

/// Fixed template catalog.
pub struct MemoryTemplateStore {
    templates: HashMap<String, String>,
}

impl MemoryTemplateStore {
    pub fn new(templates: HashMap<String, String>) -> Self {
        Self { templates }
    }

    /// A catalog holding only the `"0"` fallback variant.
    pub fn fallback_only(text: impl Into<String>) -> Self {
        Self::new(HashMap::from([("0".to_string(), text.into())]))
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn find_one(&self) -> Result<HashMap<String, String>> {
        Ok(self.templates.clone())
    }
}

/// `HashMap`-backed account store.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<Vec<AccountRecord>>,
}

impl MemoryAccountStore {
    pub fn new(accounts: Vec<AccountRecord>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
        }
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get_active_clients(&self) -> Result<Vec<AccountRecord>> {
        let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(accounts.iter().filter(|a| !a.expired).cloned().collect())
    }

    async fn find_by_mobile(&self, mobile: &str) -> Result<Option<AccountRecord>> {
        let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(accounts
            .iter()
            .find(|a| a.promote_mobiles.iter().any(|m| m == mobile))
            .cloned())
    }

    async fn mark_expired(&self, mobile: &str) -> Result<()> {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        for account in accounts.iter_mut() {
            if account.promote_mobiles.iter().any(|m| m == mobile) {
                account.expired = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, participants: i64) -> ChannelRecord {
        let mut rec = ChannelRecord::discovered(id, format!("chat-{id}"));
        rec.participants_count = participants;
        rec
    }

    #[tokio::test]
    async fn upsert_and_find() {
        let store = MemoryChannelStore::new();
        store.upsert(channel("1", 600)).await.unwrap();
        let found = store.find_one("1").await.unwrap().unwrap();
        assert_eq!(found.title, "chat-1");
        assert!(store.find_one("2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_variant() {
        let mut rec = channel("1", 600);
        rec.available_msgs = vec!["0".into(), "3".into()];
        let store = MemoryChannelStore::with_channels([rec]);

        store.remove_from_available_msgs("1", "3").await.unwrap();
        let found = store.find_one("1").await.unwrap().unwrap();
        assert_eq!(found.available_msgs, vec!["0"]);
    }

    #[tokio::test]
    async fn active_channels_sorted_and_filtered() {
        let mut banned = channel("3", 9_000);
        banned.banned = true;
        let store =
            MemoryChannelStore::with_channels([channel("1", 600), channel("2", 5_000), banned]);

        let active = store.active_channels(10, 0, &[]).await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].channel_id, "2");

        let excluded = store
            .active_channels(10, 0, &["2".to_string()])
            .await
            .unwrap();
        assert_eq!(excluded.len(), 1);
    }

    #[tokio::test]
    async fn mark_expired_hides_account() {
        let store = MemoryAccountStore::new(vec![AccountRecord {
            client_id: "acct".into(),
            promote_mobiles: vec!["+1555".into()],
            days_left: 3,
            expired: false,
        }]);

        assert_eq!(store.get_active_clients().await.unwrap().len(), 1);
        store.mark_expired("+1555").await.unwrap();
        assert!(store.get_active_clients().await.unwrap().is_empty());
        // Still findable; just expired.
        assert!(store.find_by_mobile("+1555").await.unwrap().unwrap().expired);
    }
}
