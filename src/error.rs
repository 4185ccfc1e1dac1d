//! Unified error handling for otpd.
//!
//! The client agent's external boundary is the only place errors become
//! client-visible: every failure maps to a numerically-coded
//! `CLIENT_GO_GET_LOST` disconnect. Internal boundaries log and drop.

use otp_proto::{msgtypes, ProtocolError};
use thiserror::Error;

/// Errors raised while handling a client session's traffic.
///
/// Each variant carries enough context for the disconnect reason string;
/// [`SessionError::disconnect_code`] supplies the numeric code.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("received truncated datagram")]
    Truncated(#[from] ProtocolError),

    #[error("message type {0} requires authentication")]
    AnonymousViolation(u16),

    #[error("invalid server version: {got}, expected: {expected}")]
    BadVersion { got: String, expected: String },

    #[error("invalid schema hash: {got}, expected: {expected}")]
    BadHash { got: u32, expected: u32 },

    #[error("invalid play token type: {0}")]
    BadTokenType(i32),

    #[error("unknown message type: {0}")]
    UnknownMessage(u16),

    /// Remote side asked for the disconnect (shard closed, kick).
    #[error("{reason}")]
    Directed { code: u16, reason: String },
}

impl SessionError {
    /// The numeric code carried by `CLIENT_GO_GET_LOST`.
    #[inline]
    pub fn disconnect_code(&self) -> u16 {
        match self {
            Self::Truncated(_) => msgtypes::CLIENT_DISCONNECT_TRUNCATED_DATAGRAM,
            Self::AnonymousViolation(_) => msgtypes::CLIENT_DISCONNECT_ANONYMOUS_VIOLATION,
            Self::BadVersion { .. } => msgtypes::CLIENT_DISCONNECT_BAD_VERSION,
            Self::BadHash { .. } => msgtypes::CLIENT_DISCONNECT_BAD_DCHASH,
            Self::BadTokenType(_) => msgtypes::CLIENT_DISCONNECT_INVALID_PLAY_TOKEN_TYPE,
            Self::UnknownMessage(_) => msgtypes::CLIENT_DISCONNECT_INVALID_MSGTYPE,
            Self::Directed { code, .. } => *code,
        }
    }

    /// Static code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Truncated(_) => "truncated_datagram",
            Self::AnonymousViolation(_) => "anonymous_violation",
            Self::BadVersion { .. } => "bad_version",
            Self::BadHash { .. } => "bad_dchash",
            Self::BadTokenType(_) => "bad_token_type",
            Self::UnknownMessage(_) => "invalid_msgtype",
            Self::Directed { .. } => "directed",
        }
    }
}

/// Result type for session message handlers.
pub type SessionResult = Result<(), SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_codes() {
        assert_eq!(
            SessionError::AnonymousViolation(99).disconnect_code(),
            msgtypes::CLIENT_DISCONNECT_ANONYMOUS_VIOLATION
        );
        assert_eq!(
            SessionError::UnknownMessage(1).disconnect_code(),
            msgtypes::CLIENT_DISCONNECT_INVALID_MSGTYPE
        );
        let directed = SessionError::Directed {
            code: msgtypes::CLIENT_DISCONNECT_SHARD_CLOSED,
            reason: "shard gone".into(),
        };
        assert_eq!(directed.disconnect_code(), 153);
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            SessionError::BadVersion { got: "a".into(), expected: "b".into() }.error_code(),
            "bad_version"
        );
        assert_eq!(SessionError::BadTokenType(9).error_code(), "bad_token_type");
    }
}
