//! Accessory protocol version management

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Protocol version reported by the device in answer to `ACCESSORY_GET_PROTOCOL`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

/// The only protocol version this host negotiates (AOA 2.0, audio capable)
pub const SUPPORTED_VERSION: ProtocolVersion = ProtocolVersion(2);

/// Size of the version response in bytes
pub const VERSION_RESPONSE_LEN: usize = 2;

impl ProtocolVersion {
    /// Decode the little-endian version word returned by the device
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < VERSION_RESPONSE_LEN {
            return Err(ProtocolError::ShortVersion {
                expected: VERSION_RESPONSE_LEN,
                actual: buf.len(),
            });
        }
        Ok(ProtocolVersion(LittleEndian::read_u16(buf)))
    }

    pub fn is_supported(&self) -> bool {
        *self == SUPPORTED_VERSION
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
