//! Protocol-level errors.

use thiserror::Error;

/// Errors raised while framing or unpacking datagrams.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A typed read ran past the end of the datagram.
    #[error("truncated datagram: needed {needed} more byte(s), {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    /// A frame declared a length beyond the codec's limit.
    #[error("frame too large: {actual} bytes exceeds limit of {limit}")]
    FrameTooLarge { actual: usize, limit: usize },

    /// A length-prefixed string was not valid UTF-8.
    #[error("malformed string field: {0}")]
    BadString(#[from] std::string::FromUtf8Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Static code string for log/metric labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::BadString(_) => "bad_string",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
