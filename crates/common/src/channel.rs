//! Loop-exit channel between bridge threads and the owning session
//!
//! Every bridge or capture loop reports exactly one `LoopExit` when it stops.
//! The session reads the first one as its terminal event.

use crate::error::SessionError;
use async_channel::{Receiver, Sender, bounded};
use protocol::Channel;
use tracing::debug;

/// Outcome of one loop, `Ok(())` when it stopped because of a shutdown request
#[derive(Debug)]
pub struct LoopExit {
    pub channel: Channel,
    pub result: Result<(), SessionError>,
}

/// Handle for loop threads (blocking side)
#[derive(Clone)]
pub struct ExitSender {
    tx: Sender<LoopExit>,
}

impl ExitSender {
    /// Report that a loop has stopped
    ///
    /// Never blocks. A session that is already gone is not an error.
    pub fn report(&self, channel: Channel, result: Result<(), SessionError>) {
        if let Err(e) = self.tx.try_send(LoopExit { channel, result }) {
            debug!("{} exit not delivered: {}", channel, e);
        }
    }
}

/// Handle for the session (blocking or async)
pub struct ExitReceiver {
    rx: Receiver<LoopExit>,
}

impl ExitReceiver {
    /// Wait for the next loop exit (blocking)
    ///
    /// Returns None once every sender is gone and the queue is drained.
    pub fn recv_blocking(&self) -> Option<LoopExit> {
        self.rx.recv_blocking().ok()
    }

    /// Wait for the next loop exit
    pub async fn recv(&self) -> Option<LoopExit> {
        self.rx.recv().await.ok()
    }

    /// Take a loop exit if one is already queued
    pub fn try_recv(&self) -> Option<LoopExit> {
        self.rx.try_recv().ok()
    }
}

/// Create the exit channel for one session
///
/// Returns (ExitSender for loop threads, ExitReceiver for the session)
pub fn create_exit_channel() -> (ExitSender, ExitReceiver) {
    let (tx, rx) = bounded(16);
    (ExitSender { tx }, ExitReceiver { rx })
}
