//! Fire-and-forget alert webhook and the shared banned-channels feed.

use std::time::Duration;

use tracing::{debug, warn};

/// Events the core reports to the operator's webhook.
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    /// The canary variant was deleted and no variants remain.
    ChannelBanned { channel_id: String },
    /// A verified deletion removed one variant; the channel is retained.
    VariantRemoved { channel_id: String, variant: String },
    /// A private-channel send was retried (and recovered) via username.
    PrivateChannelBypass { channel_id: String, mobile: String },
    /// A session hit a permanent account error and left the pool.
    AccountExpired { mobile: String, reason: String },
}

impl NotifyEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::ChannelBanned { .. } => "channel_banned",
            Self::VariantRemoved { .. } => "variant_removed",
            Self::PrivateChannelBypass { .. } => "private_bypass",
            Self::AccountExpired { .. } => "account_expired",
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::ChannelBanned { channel_id } => channel_id.clone(),
            Self::VariantRemoved {
                channel_id,
                variant,
            } => format!("{channel_id}:{variant}"),
            Self::PrivateChannelBypass { channel_id, mobile } => {
                format!("{channel_id}:{mobile}")
            },
            Self::AccountExpired { mobile, reason } => format!("{mobile}:{reason}"),
        }
    }
}

/// Outbound alert webhook. Disabled when no URL template is configured;
/// delivery failures are logged and otherwise ignored.
pub struct Notifier {
    url_template: Option<String>,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(url_template: Option<String>) -> Self {
        Self {
            url_template,
            http: http_client(),
        }
    }

    /// A notifier that never sends anything.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.url_template.is_some()
    }

    /// Fire the webhook for an event. Never fails.
    pub async fn notify(&self, event: &NotifyEvent) {
        let Some(ref template) = self.url_template else {
            return;
        };

        let url = template
            .replace("{event}", event.name())
            .replace("{detail}", &event.detail());

        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(event = event.name(), "notified");
            },
            Ok(resp) => {
                warn!(event = event.name(), status = %resp.status(), "notify rejected");
            },
            Err(e) => {
                warn!(event = event.name(), error = %e, "notify failed");
            },
        }
    }
}

/// Remote list of channels known (fleet-wide) to ban promoters. Consulted
/// during dialog discovery for past-due sessions; the list is only trusted
/// when it is substantial.
pub struct BannedFeed {
    url: Option<String>,
    http: reqwest::Client,
}

/// Entry count below which the remote ban list is considered stale/partial
/// and ignored.
pub const MIN_TRUSTED_FEED_LEN: usize = 150;

impl BannedFeed {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            http: http_client(),
        }
    }

    /// Fetch the banned-channel ids. Returns `None` when unconfigured,
    /// unreachable, or too small to trust.
    pub async fn fetch(&self) -> Option<Vec<String>> {
        let url = self.url.as_deref()?;
        let ids: Vec<String> = match self.http.get(url).send().await {
            Ok(resp) => match resp.json().await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "banned feed returned malformed JSON");
                    return None;
                },
            },
            Err(e) => {
                warn!(error = %e, "banned feed unreachable");
                return None;
            },
        };

        if ids.len() > MIN_TRUSTED_FEED_LEN {
            Some(ids)
        } else {
            debug!(len = ids.len(), "banned feed too small, ignoring");
            None
        }
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_and_details() {
        let e = NotifyEvent::VariantRemoved {
            channel_id: "123".into(),
            variant: "3".into(),
        };
        assert_eq!(e.name(), "variant_removed");
        assert_eq!(e.detail(), "123:3");

        let e = NotifyEvent::ChannelBanned {
            channel_id: "99".into(),
        };
        assert_eq!(e.name(), "channel_banned");
        assert_eq!(e.detail(), "99");
    }

    #[tokio::test]
    async fn disabled_notifier_is_silent() {
        // Must return without attempting any I/O.
        Notifier::disabled()
            .notify(&NotifyEvent::ChannelBanned {
                channel_id: "1".into(),
            })
            .await;
    }

    #[tokio::test]
    async fn unconfigured_feed_yields_none() {
        assert!(BannedFeed::new(None).fetch().await.is_none());
    }
}
