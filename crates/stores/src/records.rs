use serde::{Deserialize, Serialize};

/// A catalogued target channel.
///
/// `available_msgs` is the set of template variant indices the core is still
/// allowed to send into this channel; variant `"0"` is the universal
/// fallback. When the set empties after a verified deletion of variant
/// `"0"`, the channel is marked `banned`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub title: String,
    pub username: Option<String>,
    pub participants_count: i64,
    pub broadcast: bool,
    pub restricted: bool,
    pub can_send_msgs: bool,
    /// 0 means no word restriction; composed greetings are only sent into
    /// unrestricted channels.
    pub word_restriction: u32,
    pub available_msgs: Vec<String>,
    pub banned: bool,
    pub last_message_time: i64,
}

impl ChannelRecord {
    /// A minimal usable record for a channel discovered from dialogs.
    pub fn discovered(channel_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            title: title.into(),
            username: None,
            participants_count: 0,
            broadcast: false,
            restricted: false,
            can_send_msgs: true,
            word_restriction: 0,
            available_msgs: vec!["0".to_string()],
            banned: false,
            last_message_time: 0,
        }
    }
}

/// Partial update applied to a stored channel. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct ChannelPatch {
    pub title: Option<String>,
    pub username: Option<Option<String>>,
    pub participants_count: Option<i64>,
    pub banned: Option<bool>,
    pub last_message_time: Option<i64>,
    pub available_msgs: Option<Vec<String>>,
}

impl ChannelPatch {
    pub fn banned(value: bool) -> Self {
        Self {
            banned: Some(value),
            ..Self::default()
        }
    }

    pub fn last_message_time(value: i64) -> Self {
        Self {
            last_message_time: Some(value),
            ..Self::default()
        }
    }

    /// Apply this patch to a record in place.
    pub fn apply(&self, record: &mut ChannelRecord) {
        if let Some(ref title) = self.title {
            record.title = title.clone();
        }
        if let Some(ref username) = self.username {
            record.username = username.clone();
        }
        if let Some(count) = self.participants_count {
            record.participants_count = count;
        }
        if let Some(banned) = self.banned {
            record.banned = banned;
        }
        if let Some(t) = self.last_message_time {
            record.last_message_time = t;
        }
        if let Some(ref msgs) = self.available_msgs {
            record.available_msgs = msgs.clone();
        }
    }
}

/// An operator account, owner of one or more promote mobiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub client_id: String,
    /// Phone-number keys of the sessions this account promotes from.
    pub promote_mobiles: Vec<String>,
    /// Days remaining before account expiry; negative means already past
    /// due, which wipes that session's outcome history on ingest.
    pub days_left: i64,
    pub expired: bool,
}
