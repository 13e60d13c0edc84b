//! USB and session type definitions
//!
//! This module defines the channel selection, the owned descriptor-tree
//! snapshot walked by the endpoint resolver, resolved endpoint records,
//! and the error/status values reported by the USB access layer.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use thiserror::Error;

/// Set of channels requested for a session
///
/// Combinable with `|`. Decides which handshake steps run and which
/// bridging loops are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelMode {
    accessory: bool,
    audio: bool,
}

impl ChannelMode {
    /// Bulk accessory channel only
    pub const ACCESSORY: ChannelMode = ChannelMode {
        accessory: true,
        audio: false,
    };

    /// Isochronous audio channel only
    pub const AUDIO: ChannelMode = ChannelMode {
        accessory: false,
        audio: true,
    };

    /// Both channels
    pub const ALL: ChannelMode = ChannelMode {
        accessory: true,
        audio: true,
    };

    /// No channel; rejected when opening a session
    pub const NONE: ChannelMode = ChannelMode {
        accessory: false,
        audio: false,
    };

    pub fn accessory(&self) -> bool {
        self.accessory
    }

    pub fn audio(&self) -> bool {
        self.audio
    }

    pub fn is_empty(&self) -> bool {
        !self.accessory && !self.audio
    }
}

impl BitOr for ChannelMode {
    type Output = ChannelMode;

    fn bitor(self, rhs: ChannelMode) -> ChannelMode {
        ChannelMode {
            accessory: self.accessory || rhs.accessory,
            audio: self.audio || rhs.audio,
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.accessory, self.audio) {
            (true, true) => f.write_str("accessory+audio"),
            (true, false) => f.write_str("accessory"),
            (false, true) => f.write_str("audio"),
            (false, false) => f.write_str("none"),
        }
    }
}

impl FromStr for ChannelMode {
    type Err = ProtocolError;

    /// Parse `accessory`, `audio`, or a `+`/`,` separated combination
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mode = ChannelMode::NONE;
        for part in s.split(['+', ',']) {
            match part.trim().to_ascii_lowercase().as_str() {
                "accessory" => mode = mode | ChannelMode::ACCESSORY,
                "audio" => mode = mode | ChannelMode::AUDIO,
                _ => return Err(ProtocolError::InvalidMode(s.to_string())),
            }
        }
        if mode.is_empty() {
            return Err(ProtocolError::InvalidMode(s.to_string()));
        }
        Ok(mode)
    }
}

impl TryFrom<String> for ChannelMode {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelMode> for String {
    fn from(mode: ChannelMode) -> String {
        mode.to_string()
    }
}

/// A single running bridge loop, used to attribute steady-state failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Bulk IN endpoint -> local accessory stream
    AccessoryUpstream,
    /// Local accessory stream -> bulk OUT endpoint
    AccessoryDownstream,
    /// Isochronous IN endpoint -> local audio stream
    Audio,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::AccessoryUpstream => f.write_str("accessory upstream"),
            Channel::AccessoryDownstream => f.write_str("accessory downstream"),
            Channel::Audio => f.write_str("audio capture"),
        }
    }
}

/// Endpoint direction, taken from bit 7 of the endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Owned snapshot of a device's active configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigTree {
    pub interfaces: Vec<InterfaceTree>,
}

/// One interface with all of its alternate settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceTree {
    pub number: u8,
    pub alt_settings: Vec<AltSetting>,
}

/// One alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSetting {
    pub setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// Raw endpoint descriptor fields needed for resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub transfer_kind: TransferKind,
    /// wMaxPacketSize as found in the descriptor (bits 11-12 carry the
    /// high-bandwidth multiplier)
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    /// Bytes per service interval, including additional transactions
    pub fn packet_size(&self) -> usize {
        let base = (self.max_packet_size & 0x07ff) as usize;
        let mult = ((self.max_packet_size >> 11) & 0x3) as usize;
        base * (1 + mult)
    }
}

/// Interface class/subclass pair used to select interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSelector {
    pub class: u8,
    pub subclass: u8,
}

impl InterfaceSelector {
    /// Vendor-specific accessory interface
    pub const ACCESSORY: InterfaceSelector = InterfaceSelector {
        class: 0xff,
        subclass: 0xff,
    };

    /// USB audio class, audio streaming subclass
    pub const AUDIO_STREAMING: InterfaceSelector = InterfaceSelector {
        class: 0x01,
        subclass: 0x02,
    };

    pub fn matches(&self, alt: &AltSetting) -> bool {
        alt.class == self.class && alt.subclass == self.subclass
    }
}

/// Endpoint found while walking the descriptor tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub address: u8,
    pub direction: Direction,
    pub transfer_kind: TransferKind,
    pub interface: u8,
    pub alternate_setting: u8,
    pub packet_size: usize,
}

/// Bulk endpoint pair of the accessory interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessoryEndpoints {
    pub interface: u8,
    /// Bulk IN endpoint (device to host)
    pub source: u8,
    /// Bulk OUT endpoint (host to device)
    pub sink: u8,
}

/// Isochronous IN endpoint of the audio streaming interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioEndpoint {
    pub interface: u8,
    pub alternate_setting: u8,
    pub address: u8,
    pub packet_size: usize,
}

/// Completion status of an asynchronous transfer or one of its packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Completed => "LIBUSB_TRANSFER_COMPLETED",
            TransferStatus::Error => "LIBUSB_TRANSFER_ERROR",
            TransferStatus::TimedOut => "LIBUSB_TRANSFER_TIMED_OUT",
            TransferStatus::Cancelled => "LIBUSB_TRANSFER_CANCELLED",
            TransferStatus::Stall => "LIBUSB_TRANSFER_STALL",
            TransferStatus::NoDevice => "LIBUSB_TRANSFER_NO_DEVICE",
            TransferStatus::Overflow => "LIBUSB_TRANSFER_OVERFLOW",
        };
        f.write_str(name)
    }
}

/// USB error types
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    /// Transfer timed out
    #[error("operation timed out ({})", self.name())]
    Timeout,
    /// Endpoint stalled (protocol error)
    #[error("pipe error ({})", self.name())]
    Pipe,
    /// Device was disconnected
    #[error("no such device ({})", self.name())]
    NoDevice,
    /// Device or endpoint not found
    #[error("entity not found ({})", self.name())]
    NotFound,
    /// Device is busy
    #[error("resource busy ({})", self.name())]
    Busy,
    /// Buffer overflow
    #[error("overflow ({})", self.name())]
    Overflow,
    /// I/O error
    #[error("input/output error ({})", self.name())]
    Io,
    /// Invalid parameter
    #[error("invalid parameter ({})", self.name())]
    InvalidParam,
    /// Access denied (permissions)
    #[error("access denied ({})", self.name())]
    Access,
    /// System call interrupted
    #[error("system call interrupted ({})", self.name())]
    Interrupted,
    /// Operation not supported on this platform
    #[error("operation not supported ({})", self.name())]
    NotSupported,
    /// Other error with message
    #[error("{message}")]
    Other { message: String },
}

impl UsbError {
    /// libusb name of the error
    pub fn name(&self) -> &'static str {
        match self {
            UsbError::Timeout => "LIBUSB_ERROR_TIMEOUT",
            UsbError::Pipe => "LIBUSB_ERROR_PIPE",
            UsbError::NoDevice => "LIBUSB_ERROR_NO_DEVICE",
            UsbError::NotFound => "LIBUSB_ERROR_NOT_FOUND",
            UsbError::Busy => "LIBUSB_ERROR_BUSY",
            UsbError::Overflow => "LIBUSB_ERROR_OVERFLOW",
            UsbError::Io => "LIBUSB_ERROR_IO",
            UsbError::InvalidParam => "LIBUSB_ERROR_INVALID_PARAM",
            UsbError::Access => "LIBUSB_ERROR_ACCESS",
            UsbError::Interrupted => "LIBUSB_ERROR_INTERRUPTED",
            UsbError::NotSupported => "LIBUSB_ERROR_NOT_SUPPORTED",
            UsbError::Other { .. } => "LIBUSB_ERROR_OTHER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_mode_parse() {
        assert_eq!("accessory".parse::<ChannelMode>().unwrap(), ChannelMode::ACCESSORY);
        assert_eq!("audio".parse::<ChannelMode>().unwrap(), ChannelMode::AUDIO);
        assert_eq!("accessory+audio".parse::<ChannelMode>().unwrap(), ChannelMode::ALL);
        assert_eq!("Audio, Accessory".parse::<ChannelMode>().unwrap(), ChannelMode::ALL);
        assert!("".parse::<ChannelMode>().is_err());
        assert!("video".parse::<ChannelMode>().is_err());
        assert!("accessory+".parse::<ChannelMode>().is_err());
    }

    #[test]
    fn test_channel_mode_combine() {
        let mode = ChannelMode::ACCESSORY | ChannelMode::AUDIO;
        assert_eq!(mode, ChannelMode::ALL);
        assert!(mode.accessory() && mode.audio());
        assert!(!ChannelMode::AUDIO.accessory());
        assert_eq!(mode.to_string(), "accessory+audio");
    }

    #[test]
    fn test_channel_mode_serde() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            mode: ChannelMode,
        }

        let parsed: Wrapper = toml::from_str("mode = \"audio\"").unwrap();
        assert_eq!(parsed.mode, ChannelMode::AUDIO);
        assert!(toml::from_str::<Wrapper>("mode = \"none\"").is_err());
    }

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x02), Direction::Out);
    }

    #[test]
    fn test_high_bandwidth_packet_size() {
        let plain = EndpointInfo {
            address: 0x83,
            transfer_kind: TransferKind::Isochronous,
            max_packet_size: 192,
        };
        assert_eq!(plain.packet_size(), 192);

        // 2 additional transactions of 1024 bytes
        let high = EndpointInfo {
            max_packet_size: 0x1400,
            ..plain
        };
        assert_eq!(high.packet_size(), 3 * 1024);
    }

    #[test]
    fn test_usb_error_names() {
        assert_eq!(UsbError::Pipe.name(), "LIBUSB_ERROR_PIPE");
        assert!(UsbError::Timeout.to_string().contains("LIBUSB_ERROR_TIMEOUT"));
        assert_eq!(
            UsbError::Other {
                message: "boom".to_string()
            }
            .to_string(),
            "boom"
        );
    }
}
