//! Common utilities for aoa-bridge
//!
//! This crate provides shared functionality for the host: the error taxonomy,
//! logging setup, the USB access-layer traits, the loop-exit channel and
//! shutdown signal used by bridge threads, an injectable clock, and test
//! utilities with a scripted mock USB bus.

pub mod channel;
pub mod clock;
pub mod error;
pub mod logging;
pub mod shutdown;
pub mod test_utils;
pub mod usb_types;

pub use channel::{ExitReceiver, ExitSender, LoopExit, create_exit_channel};
pub use clock::{Clock, SystemClock};
pub use error::{Error, HandshakeStep, Result, SessionError, TopologyError};
pub use logging::setup_logging;
pub use shutdown::Shutdown;
pub use usb_types::{
    DeviceCandidate, IsoAction, IsoCompletion, IsoHandler, IsoPacket, IsoRequest, UsbBackend,
    UsbHandle,
};
