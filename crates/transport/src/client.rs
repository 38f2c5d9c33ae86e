//! The opaque remote-session interface the core drives.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::error::ClientError;

/// Identity of the logged-in session, returned by the deep health probe.
#[derive(Debug, Clone)]
pub struct SelfInfo {
    pub username: Option<String>,
    pub first_name: String,
}

/// One entry from a dialog listing.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub entity: ChatEntity,
}

/// Chat/channel entity as the transport reports it.
#[derive(Debug, Clone, Default)]
pub struct ChatEntity {
    /// Peer id; dialogs without one are skipped during discovery.
    pub id: Option<String>,
    pub title: String,
    pub username: Option<String>,
    /// Broadcast channel (as opposed to a group).
    pub broadcast: bool,
    pub megagroup: bool,
    pub participants_count: i64,
    /// `defaultBannedRights.sendMessages`: posting is disabled for members.
    pub send_messages_banned: bool,
    pub restricted: bool,
}

/// A message reference returned from a history fetch.
#[derive(Debug, Clone, Copy)]
pub struct MessageRef {
    pub id: i64,
}

/// Where a send is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// `@username` resolution.
    Username(String),
    /// Bare channel id.
    ChannelId(String),
}

impl std::fmt::Display for SendTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Username(u) => write!(f, "@{u}"),
            Self::ChannelId(id) => f.write_str(id),
        }
    }
}

/// Typed result of a send attempt. The scheduler dispatches on this sum;
/// only [`SendOutcome::Sent`] reaches the verification queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { message_id: i64 },
    /// Rate limited; the session must sleep for this many seconds.
    FloodWait { seconds: u32 },
    /// The channel rejected the peer resolution; may recover via username.
    ChannelPrivate,
    /// This session is banned in this channel (terminal per mobile+channel).
    UserBanned,
    /// Posting forbidden in this channel (terminal per mobile+channel).
    ChatWriteForbidden,
    /// Network-ish failure; retry at a later tick.
    Transient { cause: String },
    /// Anything else the transport reported, by code.
    Terminal { code: String },
}

impl SendOutcome {
    /// The error code recorded into the per-channel outcome history.
    /// `None` for a successful send.
    #[must_use]
    pub fn error_code(&self) -> Option<String> {
        match self {
            Self::Sent { .. } => None,
            Self::FloodWait { .. } => Some("FLOOD_WAIT".into()),
            Self::ChannelPrivate => Some("CHANNEL_PRIVATE".into()),
            Self::UserBanned => Some("USER_BANNED_IN_CHANNEL".into()),
            Self::ChatWriteForbidden => Some("CHAT_WRITE_FORBIDDEN".into()),
            Self::Transient { cause } => Some(cause.clone()),
            Self::Terminal { code } => Some(code.clone()),
        }
    }
}

/// A connected Telegram user session. Implementations live outside the
/// core (MTProto) or in [`crate::sim`] (tests, dry runs).
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn connect(&self) -> Result<(), ClientError>;
    async fn disconnect(&self) -> Result<(), ClientError>;
    fn is_connected(&self) -> bool;

    /// Identity probe; doubles as the deep health check.
    async fn get_self(&self) -> Result<SelfInfo, ClientError>;

    /// List up to `limit` of the session's dialogs.
    async fn get_dialogs(&self, limit: usize) -> Result<Vec<Dialog>, ClientError>;

    /// Resolve a single entity by channel id.
    async fn get_entity(&self, channel_id: &str) -> Result<ChatEntity, ClientError>;

    /// Fetch messages in a channel with id greater than `min_id`,
    /// oldest first.
    async fn get_messages(
        &self,
        channel_id: &str,
        min_id: i64,
    ) -> Result<Vec<MessageRef>, ClientError>;

    /// Attempt one send. Infallible at the signature level: every failure
    /// mode is a [`SendOutcome`] variant.
    async fn send_message(&self, target: &SendTarget, text: &str) -> SendOutcome;
}

/// Creates transport clients for mobiles. The registry holds exactly one
/// factory; swapping it swaps the whole transport.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, mobile: &str) -> Result<Arc<dyn RemoteClient>, ClientError>;
}

/// Convenience alias used by health reporting.
pub type HealthMap = HashMap<String, bool>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_error_codes() {
        assert_eq!(SendOutcome::Sent { message_id: 1 }.error_code(), None);
        assert_eq!(
            SendOutcome::FloodWait { seconds: 60 }.error_code().unwrap(),
            "FLOOD_WAIT"
        );
        assert_eq!(
            SendOutcome::UserBanned.error_code().unwrap(),
            "USER_BANNED_IN_CHANNEL"
        );
        assert_eq!(
            SendOutcome::Terminal { code: "X".into() }.error_code().unwrap(),
            "X"
        );
    }

    #[test]
    fn target_display() {
        assert_eq!(SendTarget::Username("promo".into()).to_string(), "@promo");
        assert_eq!(SendTarget::ChannelId("123".into()).to_string(), "123");
    }
}
