//! aoa-bridge host library
//!
//! Finds an Android device on the USB bus, switches it into Android Open
//! Accessory mode and bridges its accessory bulk pair and its isochronous
//! audio endpoint to local Unix streams.
//!
//! # Example
//!
//! ```no_run
//! use host::session::{AccessoryDevice, SessionSettings};
//! use host::usb::RusbBackend;
//! use protocol::ChannelMode;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(RusbBackend::new()?);
//! let device = AccessoryDevice::open(backend, SessionSettings::default(), ChannelMode::ALL)?;
//! let mut session = device.initialize()?;
//! let _accessory = session.take_accessory_stream();
//! let event = session.wait();
//! println!("session ended: {:?}", event);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod session;
pub mod usb;

pub use config::HostConfig;
pub use session::{AccessoryDevice, Session, SessionEvent, SessionSettings};
