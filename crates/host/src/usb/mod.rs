//! USB subsystem
//!
//! Device discovery, the accessory handshake, endpoint resolution and the
//! threads that move bytes between USB endpoints and local streams.
//!
//! All blocking USB work runs on dedicated OS threads; the async runtime only
//! sees the resulting Unix streams and the session's terminal event.

pub mod backend;
pub mod bridge;
pub mod capture;
pub mod enumerator;
mod iso_transfer;
pub mod negotiator;
pub mod resolver;

pub use backend::{RusbBackend, RusbHandle};
pub use bridge::BridgeSettings;
pub use capture::CaptureLoop;
pub use enumerator::Enumerator;
pub use negotiator::Negotiator;
