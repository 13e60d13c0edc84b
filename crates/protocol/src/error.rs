//! Protocol error types

use thiserror::Error;

/// Errors decoding AOA wire values or parsing protocol-level settings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Channel mode string did not name a non-empty set of channels
    #[error("invalid channel mode '{0}', expected 'accessory', 'audio' or 'accessory+audio'")]
    InvalidMode(String),

    /// Device answered the version query with fewer bytes than required
    #[error("short protocol version response: expected {expected} bytes, got {actual}")]
    ShortVersion { expected: usize, actual: usize },

    /// Identification string cannot be sent as a C string
    #[error("identification string for {slot} contains an interior NUL byte")]
    InteriorNul { slot: &'static str },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
