use std::time::Duration;

use thiserror::Error;

/// Reasons a session can never come back without operator intervention.
/// Any of these marks the owning account expired and removes the mobile
/// from rotation until the account record changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentFailure {
    UserDeactivated,
    AuthKeyUnregistered,
    SessionRevoked,
    PhoneBanned,
}

impl PermanentFailure {
    /// The upstream error code this failure was classified from.
    #[must_use]
    pub fn as_code(self) -> &'static str {
        match self {
            Self::UserDeactivated => "USER_DEACTIVATED_BAN",
            Self::AuthKeyUnregistered => "AUTH_KEY_UNREGISTERED",
            Self::SessionRevoked => "SESSION_REVOKED",
            Self::PhoneBanned => "PHONE_NUMBER_BANNED",
        }
    }

    /// Classify an upstream RPC error code. Returns `None` for anything
    /// that is not account-permanent.
    pub fn classify(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "USER_DEACTIVATED" | "USER_DEACTIVATED_BAN" => Some(Self::UserDeactivated),
            "AUTH_KEY_UNREGISTERED" => Some(Self::AuthKeyUnregistered),
            "SESSION_REVOKED" => Some(Self::SessionRevoked),
            "PHONE_NUMBER_BANNED" => Some(Self::PhoneBanned),
            _ => None,
        }
    }
}

impl std::fmt::Display for PermanentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Failures surfaced by client creation, connection, and fetch calls.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connection limit reached ({0})")]
    LimitReached(usize),

    #[error("no active account for mobile {0}")]
    AccountNotFound(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("account permanently unusable: {0}")]
    Permanent(PermanentFailure),
}

impl ClientError {
    /// `true` when retrying can never help.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Build from an upstream RPC error string, classifying permanence.
    pub fn from_rpc(code: impl Into<String>) -> Self {
        let code = code.into();
        match PermanentFailure::classify(&code) {
            Some(p) => Self::Permanent(p),
            None => Self::Transport(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_codes() {
        assert!(ClientError::from_rpc("SESSION_REVOKED").is_permanent());
        assert!(ClientError::from_rpc("user_deactivated_ban").is_permanent());
        assert!(ClientError::from_rpc("PHONE_NUMBER_BANNED").is_permanent());
        assert!(!ClientError::from_rpc("ERR_NETWORK").is_permanent());
    }

    #[test]
    fn permanent_roundtrips_to_code() {
        let e = PermanentFailure::classify("AUTH_KEY_UNREGISTERED").unwrap();
        assert_eq!(e.as_code(), "AUTH_KEY_UNREGISTERED");
    }
}
