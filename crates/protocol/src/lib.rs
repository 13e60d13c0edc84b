//! Protocol library for aoa-bridge
//!
//! This crate defines the Android Open Accessory wire contract (request codes,
//! identification string slots, accessory-mode product ids, version decoding)
//! and the plain data types shared by the host: channel selection, the owned
//! descriptor-tree snapshot, resolved endpoints and USB error values.
//!
//! # Example
//!
//! ```
//! use protocol::{ChannelMode, ProtocolVersion, SUPPORTED_VERSION};
//!
//! let mode: ChannelMode = "accessory+audio".parse().unwrap();
//! assert!(mode.accessory() && mode.audio());
//!
//! let version = ProtocolVersion::decode(&[2, 0]).unwrap();
//! assert_eq!(version, SUPPORTED_VERSION);
//! ```

pub mod aoa;
pub mod error;
pub mod types;
pub mod version;

pub use aoa::{AccessoryIdentity, StringSlot};
pub use error::{ProtocolError, Result};
pub use types::{
    AccessoryEndpoints, AltSetting, AudioEndpoint, Channel, ChannelMode, ConfigTree, Direction,
    EndpointInfo, InterfaceSelector, InterfaceTree, ResolvedEndpoint, TransferKind,
    TransferStatus, UsbError,
};
pub use version::{ProtocolVersion, SUPPORTED_VERSION};
