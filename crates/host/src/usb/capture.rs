//! Isochronous audio capture
//!
//! One isochronous IN transfer is kept in flight on the audio endpoint. Each
//! completion is flattened into a single vectored write to the internal audio
//! stream and the transfer is resubmitted. Audio is best effort: when the
//! consumer cannot keep up the remainder of the batch is dropped.

use common::{
    Error, ExitSender, IsoAction, IsoCompletion, IsoHandler, IsoRequest, SessionError, Shutdown,
    UsbBackend, UsbHandle,
};
use protocol::{AudioEndpoint, Channel, TransferStatus, UsbError};
use std::io::{self, IoSlice, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timeout of one `handle_events` call on the event thread
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the event thread keeps dispatching after shutdown before giving up
pub const RETIRE_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Counters shared between the capture loop and its owner
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub bytes: AtomicU64,
    pub batches: AtomicU64,
    pub overruns: AtomicU64,
    retired: AtomicBool,
}

impl CaptureStats {
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Whether the transfer has been retired and will not complete again
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Completion handler for the audio transfer
pub struct CaptureLoop<W> {
    stream: W,
    shutdown: Shutdown,
    exits: ExitSender,
    stats: Arc<CaptureStats>,
    failure: Option<SessionError>,
}

impl<W: Write + Send> CaptureLoop<W> {
    pub fn new(stream: W, shutdown: Shutdown, exits: ExitSender, stats: Arc<CaptureStats>) -> Self {
        Self {
            stream,
            shutdown,
            exits,
            stats,
            failure: None,
        }
    }

    fn forward(&mut self, completion: &IsoCompletion<'_>) -> Result<(), SessionError> {
        let slices: Vec<IoSlice<'_>> = completion
            .packets
            .iter()
            .filter(|packet| !packet.data.is_empty())
            .map(|packet| IoSlice::new(packet.data))
            .collect();
        let total: usize = slices.iter().map(|slice| slice.len()).sum();
        if total == 0 {
            return Ok(());
        }

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        match self.stream.write_vectored(&slices) {
            Ok(written) => {
                self.stats.bytes.fetch_add(written as u64, Ordering::Relaxed);
                if written < total {
                    self.overrun(total - written);
                } else {
                    debug!("Wrote {} bytes of audio", written);
                }
                Ok(())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                self.overrun(total);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(SessionError::StreamClosed {
                channel: Channel::Audio,
            }),
            Err(source) => Err(SessionError::Stream {
                channel: Channel::Audio,
                source,
            }),
        }
    }

    fn overrun(&self, dropped: usize) {
        let count = self.stats.overruns.fetch_add(1, Ordering::Relaxed) + 1;
        if warn_on_overrun(count) {
            warn!("Audio overrun: dropped {} bytes ({} overruns)", dropped, count);
        } else {
            debug!("Audio overrun: dropped {} bytes ({} overruns)", dropped, count);
        }
    }
}

/// Whether the `count`th overrun is logged at warn level (1st, 2nd, 4th, 8th, ...)
fn warn_on_overrun(count: u64) -> bool {
    count.is_power_of_two()
}

impl<W: Write + Send> IsoHandler for CaptureLoop<W> {
    fn on_complete(&mut self, completion: &IsoCompletion<'_>) -> IsoAction {
        if self.shutdown.is_triggered() {
            return IsoAction::Stop;
        }

        if completion.status != TransferStatus::Completed {
            self.failure = Some(SessionError::Transfer {
                channel: Channel::Audio,
                status: completion.status,
            });
            return IsoAction::Stop;
        }

        match self.forward(completion) {
            Ok(()) => IsoAction::Resubmit,
            Err(e) => {
                self.failure = Some(e);
                IsoAction::Stop
            }
        }
    }

    fn on_retired(&mut self, result: Result<(), UsbError>) {
        let result = match (self.failure.take(), result) {
            (Some(failure), _) => Err(failure),
            (None, Err(error)) => Err(SessionError::Usb {
                channel: Channel::Audio,
                error,
            }),
            (None, Ok(())) => Ok(()),
        };
        self.stats.retired.store(true, Ordering::Release);
        self.exits.report(Channel::Audio, result);
    }
}

/// Running audio capture
pub struct AudioCapture {
    /// End handed to the consumer
    pub stream: UnixStream,
    pub stats: Arc<CaptureStats>,
    pub event_thread: JoinHandle<()>,
}

/// Create the audio socket pair, submit the first transfer and start the event thread
pub fn spawn_audio_capture<B: UsbBackend>(
    backend: Arc<B>,
    handle: &B::Handle,
    endpoint: AudioEndpoint,
    packets: usize,
    shutdown: Shutdown,
    exits: ExitSender,
) -> Result<AudioCapture, Error> {
    let (internal, external) = UnixStream::pair()?;
    internal.set_nonblocking(true)?;

    let stats = Arc::new(CaptureStats::default());
    let capture = CaptureLoop::new(internal, shutdown.clone(), exits, Arc::clone(&stats));
    let request = IsoRequest {
        endpoint: endpoint.address,
        packets,
        packet_size: endpoint.packet_size,
        timeout: Duration::ZERO,
    };

    handle
        .submit_isochronous(request, Box::new(capture))
        .map_err(Error::Submit)?;
    info!(
        "Capturing audio from endpoint {:#04x} ({} packets of {} bytes)",
        endpoint.address, packets, endpoint.packet_size
    );

    let event_stats = Arc::clone(&stats);
    let event_shutdown = shutdown.clone();
    let event_thread = std::thread::Builder::new()
        .name("aoa-usb-events".to_string())
        .spawn(move || {
            debug!("USB event thread started");
            run_events(&*backend, &event_stats, &event_shutdown);
            debug!("USB event thread stopped");
        });

    match event_thread {
        Ok(event_thread) => Ok(AudioCapture {
            stream: external,
            stats,
            event_thread,
        }),
        Err(e) => {
            shutdown.trigger();
            Err(Error::Io(e))
        }
    }
}

/// Dispatch USB events until the capture transfer retires
fn run_events<B: UsbBackend + ?Sized>(backend: &B, stats: &CaptureStats, shutdown: &Shutdown) {
    let mut shutdown_since: Option<Instant> = None;

    while !stats.is_retired() {
        if shutdown.is_triggered() {
            let since = *shutdown_since.get_or_insert_with(Instant::now);
            if since.elapsed() > RETIRE_GRACE_PERIOD {
                warn!("Audio transfer did not retire within {:?}", RETIRE_GRACE_PERIOD);
                return;
            }
        }

        match backend.handle_events(EVENT_POLL_INTERVAL) {
            Ok(()) => {}
            Err(UsbError::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL_INTERVAL);
            }
        }
    }
}
