//! Common error types
//!
//! Setup failures (`Error`), descriptor topology failures (`TopologyError`)
//! and steady-state loop failures (`SessionError`).

use protocol::{
    Channel, ChannelMode, Direction, ProtocolError, ProtocolVersion, StringSlot, SUPPORTED_VERSION,
    TransferStatus, UsbError,
};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Step of the accessory handshake, used to report where negotiation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    VersionCheck,
    Identify(StringSlot),
    EnableAudio,
    Start,
    Reacquire,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStep::VersionCheck => f.write_str("version check"),
            HandshakeStep::Identify(slot) => write!(f, "identify ({})", slot),
            HandshakeStep::EnableAudio => f.write_str("enable audio"),
            HandshakeStep::Start => f.write_str("start"),
            HandshakeStep::Reacquire => f.write_str("reacquire"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "timed out after {waited:?} waiting for device {vendor_id:04x}:[{}]",
        format_product_ids(.product_ids)
    )]
    DiscoveryTimeout {
        vendor_id: u16,
        product_ids: Vec<u16>,
        waited: Duration,
    },

    #[error("USB device enumeration failed: {0}")]
    Enumeration(#[source] UsbError),

    #[error("failed to open device {vendor_id:04x}:{product_id:04x}: {source}")]
    Open {
        vendor_id: u16,
        product_id: u16,
        source: UsbError,
    },

    #[error("accessory negotiation failed during {step}: {source}")]
    Negotiation { step: HandshakeStep, source: UsbError },

    #[error("device did not re-enumerate in accessory mode within {waited:?}")]
    ReacquireTimeout { waited: Duration },

    #[error("unsupported accessory protocol version {version} (expected {})", SUPPORTED_VERSION)]
    UnsupportedVersion { version: ProtocolVersion },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unsupported device topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("failed to read configuration descriptor: {0}")]
    Descriptor(#[source] UsbError),

    #[error("failed to claim interface {interface}: {source}")]
    Claim { interface: u8, source: UsbError },

    #[error("failed to select alternate setting {setting} on interface {interface}: {source}")]
    AlternateSetting {
        interface: u8,
        setting: u8,
        source: UsbError,
    },

    #[error("failed to submit isochronous transfer: {0}")]
    Submit(#[source] UsbError),

    #[error("invalid channel mode '{0}'")]
    InvalidMode(ChannelMode),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the whole open sequence later may succeed
    ///
    /// Only discovery timeouts qualify: they usually mean the device is not
    /// plugged in yet.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DiscoveryTimeout { .. })
    }
}

fn format_product_ids(ids: &[u16]) -> String {
    ids.iter()
        .map(|id| format!("{:04x}", id))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Descriptor tree does not match the single-interface assumptions of the protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("no bulk {direction:?} endpoint on the accessory interface")]
    MissingEndpoint { direction: Direction },

    #[error(
        "more than one bulk {direction:?} endpoint on the accessory interface ({first:#04x} and {second:#04x})"
    )]
    DuplicateEndpoint {
        direction: Direction,
        first: u8,
        second: u8,
    },

    #[error(
        "accessory endpoints split across interface {sink_interface} (sink) and {source_interface} (source)"
    )]
    SplitInterfaces {
        sink_interface: u8,
        source_interface: u8,
    },

    #[error("no isochronous IN endpoint on any audio streaming interface")]
    NoAudioEndpoint,

    #[error("audio streaming alternate setting {0} has no isochronous IN endpoint")]
    UnknownAlternateSetting(u8),
}

/// Failure of a running bridge or capture loop
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{channel}: USB transfer failed: {error}")]
    Usb { channel: Channel, error: UsbError },

    #[error("{channel}: stream I/O failed: {source}")]
    Stream {
        channel: Channel,
        source: std::io::Error,
    },

    #[error("{channel}: stream closed by peer")]
    StreamClosed { channel: Channel },

    #[error("{channel}: transfer ended with status {status}")]
    Transfer {
        channel: Channel,
        status: TransferStatus,
    },
}

impl SessionError {
    /// Loop the failure originated from
    pub fn channel(&self) -> Channel {
        match self {
            SessionError::Usb { channel, .. }
            | SessionError::Stream { channel, .. }
            | SessionError::StreamClosed { channel }
            | SessionError::Transfer { channel, .. } => *channel,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable() {
        let err = Error::DiscoveryTimeout {
            vendor_id: 0x18d1,
            product_ids: vec![0x4ee2, 0x4ee7],
            waited: Duration::from_millis(100),
        };
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("18d1:[4ee2, 4ee7]"));
    }

    #[test]
    fn test_negotiation_error_names_step() {
        let err = Error::Negotiation {
            step: HandshakeStep::Identify(StringSlot::Uri),
            source: UsbError::Pipe,
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("identify (uri)"));
        assert!(msg.contains("LIBUSB_ERROR_PIPE"));
    }

    #[test]
    fn test_reacquire_timeout_is_fatal() {
        let err = Error::ReacquireTimeout {
            waited: Duration::from_secs(5),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("accessory mode"));
    }

    #[test]
    fn test_version_error_reports_value() {
        let err = Error::UnsupportedVersion {
            version: ProtocolVersion(1),
        };
        assert!(err.to_string().contains("version 1 (expected 2)"));
    }

    #[test]
    fn test_session_error_channel() {
        let err = SessionError::StreamClosed {
            channel: Channel::AccessoryDownstream,
        };
        assert_eq!(err.channel(), Channel::AccessoryDownstream);
        assert_eq!(err.to_string(), "accessory downstream: stream closed by peer");
    }
}
