//! Error classes reported by the remote messaging platform.
//!
//! Every failure the platform can produce is folded into one of these
//! variants at the client boundary, so callers decide between waiting,
//! retrying, halting or skipping without looking at wire details.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The platform asked us to wait before calling again.
    #[error("throttled by provider for {seconds}s")]
    Throttled { seconds: u64 },

    /// Connection reset, timeout or a 5xx from the gateway.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The account cannot read the conversation, or it no longer exists.
    #[error("access denied: {0}")]
    Access(String),

    /// The session credential is no longer accepted.
    #[error("session expired: {0}")]
    AuthExpired(String),

    /// Sign-in needs the account's second-factor password.
    #[error("second-factor password required")]
    PasswordRequired,

    /// The one-time code (or password) was rejected.
    #[error("invalid or expired code: {0}")]
    InvalidCode(String),

    /// Reactions are hidden for this message.
    #[error("reactions unavailable: {0}")]
    PrivacyRestricted(String),

    /// An out-of-band login token has not been scanned yet.
    #[error("login token not yet accepted")]
    Pending,

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Anything else the gateway rejected.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ApiError {
    /// Errors a caller may retry after a short pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    /// Errors that end an ingestion run instead of a single item.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, ApiError::Access(_) | ApiError::AuthExpired(_))
    }

    /// Map a platform error code (e.g. `FLOOD_WAIT_30`) to an error class.
    ///
    /// Returns `None` for codes that carry no specific meaning; the caller
    /// then falls back to the HTTP status.
    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        if let Some(rest) = code
            .strip_prefix("FLOOD_WAIT_")
            .or_else(|| code.strip_prefix("SLOWMODE_WAIT_"))
            .or_else(|| code.strip_prefix("FLOOD_PREMIUM_WAIT_"))
        {
            let seconds = rest.parse::<u64>().unwrap_or(1);
            return Some(ApiError::Throttled { seconds });
        }
        let err = match code {
            "AUTH_KEY_UNREGISTERED" | "SESSION_REVOKED" | "SESSION_EXPIRED"
            | "AUTH_KEY_INVALID" | "USER_DEACTIVATED" => ApiError::AuthExpired(code.to_string()),
            "CHANNEL_PRIVATE" | "CHANNEL_INVALID" | "CHAT_ADMIN_REQUIRED"
            | "USERNAME_NOT_OCCUPIED" | "USERNAME_INVALID" | "PEER_ID_INVALID"
            | "CHAT_FORBIDDEN" | "CHANNEL_BANNED" => ApiError::Access(code.to_string()),
            "REACTIONS_PRIVATE" | "MSG_ID_INVALID" | "BROADCAST_REQUIRED" => {
                ApiError::PrivacyRestricted(code.to_string())
            }
            "SESSION_PASSWORD_NEEDED" => ApiError::PasswordRequired,
            "PHONE_CODE_INVALID" | "PHONE_CODE_EXPIRED" | "PASSWORD_HASH_INVALID"
            | "PHONE_CODE_EMPTY" => ApiError::InvalidCode(code.to_string()),
            "AUTH_TOKEN_PENDING" => ApiError::Pending,
            _ => return None,
        };
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_wait_code() {
        assert_eq!(
            ApiError::from_code("FLOOD_WAIT_42"),
            Some(ApiError::Throttled { seconds: 42 })
        );
        assert_eq!(
            ApiError::from_code("SLOWMODE_WAIT_7"),
            Some(ApiError::Throttled { seconds: 7 })
        );
    }

    #[test]
    fn test_fatal_classes() {
        assert!(ApiError::from_code("CHANNEL_PRIVATE").unwrap().is_fatal_to_run());
        assert!(ApiError::from_code("SESSION_REVOKED").unwrap().is_fatal_to_run());
        assert!(!ApiError::Transient("reset".into()).is_fatal_to_run());
        assert_eq!(ApiError::from_code("SOMETHING_ELSE"), None);
    }
}
