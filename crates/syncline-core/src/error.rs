use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable protocol error codes the engine reacts to by name.
pub mod codes {
    /// Server-side rate limiting; carries a retry-after hint.
    pub const LIMIT_EXCEEDED: &str = "M_LIMIT_EXCEEDED";
    /// Access token is no longer valid.
    pub const UNKNOWN_TOKEN: &str = "M_UNKNOWN_TOKEN";
    /// No access token was supplied.
    pub const MISSING_TOKEN: &str = "M_MISSING_TOKEN";
    /// Catch-all code for protocol failures without a better one.
    pub const UNKNOWN: &str = "M_UNKNOWN";
}

/// Error taxonomy shared by every fallible operation in the SDK core.
///
/// Callers branch on the variant, never on message text. `Protocol` carries
/// the server's stable code so retry and session-invalidation policy can key
/// off it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Locally cached data is missing or malformed.
    #[error("local data error: {0}")]
    LocalData(String),
    /// Transient transport failure; the request may be retried as-is.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with a protocol-level rejection.
    #[error("protocol error {code}: {message}")]
    Protocol {
        /// Stable machine-readable error code.
        code: String,
        /// Human-readable message from the server.
        message: String,
        /// Optional retry hint in milliseconds.
        retry_after_ms: Option<u64>,
    },
    /// Certificate or other transport-security failure.
    #[error("security error: {0}")]
    Security(String),
    /// Internal bug or invariant break.
    #[error("unexpected error: {0}")]
    Unexpected(String),
    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Construct a protocol error without a retry hint.
    pub fn protocol(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint; only meaningful on `Protocol` errors.
    pub fn with_retry_after(self, retry_after: Duration) -> Self {
        match self {
            Self::Protocol { code, message, .. } => Self::Protocol {
                code,
                message,
                retry_after_ms: Some(retry_after.as_millis() as u64),
            },
            other => other,
        }
    }

    /// Retry hint reported by the server, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Protocol {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// True when the server throttled the request.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Protocol { code, .. } if code == codes::LIMIT_EXCEEDED)
    }

    /// True when the session credentials are unusable and retrying is
    /// pointless until the account is reconfigured.
    pub fn is_configuration_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol { code, .. }
                if code == codes::UNKNOWN_TOKEN || code == codes::MISSING_TOKEN
        )
    }

    /// True for transport-security failures that must reach the user.
    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

/// Map an HTTP status to the error variant a transport should report.
pub fn classify_http_status(status: u16, message: impl Into<String>) -> SyncError {
    let message = message.into();
    match status {
        401 => SyncError::protocol(codes::UNKNOWN_TOKEN, message),
        429 => SyncError::protocol(codes::LIMIT_EXCEEDED, message),
        400..=499 => SyncError::protocol(codes::UNKNOWN, message),
        500..=599 => SyncError::Network(message),
        _ => SyncError::Unexpected(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_rate_limit_code() {
        let err = SyncError::protocol(codes::LIMIT_EXCEEDED, "slow down")
            .with_retry_after(Duration::from_secs(5));
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn flags_token_errors_as_configuration_fatal() {
        assert!(SyncError::protocol(codes::UNKNOWN_TOKEN, "bad token").is_configuration_fatal());
        assert!(SyncError::protocol(codes::MISSING_TOKEN, "no token").is_configuration_fatal());
        assert!(!SyncError::protocol(codes::LIMIT_EXCEEDED, "busy").is_configuration_fatal());
    }

    #[test]
    fn classifies_http_statuses() {
        assert!(classify_http_status(401, "").is_configuration_fatal());
        assert!(classify_http_status(429, "").is_rate_limited());
        assert!(matches!(
            classify_http_status(503, ""),
            SyncError::Network(_)
        ));
        assert!(matches!(
            classify_http_status(404, ""),
            SyncError::Protocol { code, .. } if code == codes::UNKNOWN
        ));
    }

    #[test]
    fn retry_after_is_ignored_on_other_variants() {
        let err = SyncError::Network("down".into()).with_retry_after(Duration::from_secs(1));
        assert_eq!(err.retry_after(), None);
    }
}
