//! Bulk transfer bridge for the accessory channel
//!
//! Two threads move bytes between the accessory bulk pair and the internal
//! end of a Unix socket pair:
//! - `aoa-usb-in`: bulk IN (source) -> internal stream
//! - `aoa-usb-out`: internal stream -> bulk OUT (sink)
//!
//! Every blocking call uses the poll interval as a timeout so the threads
//! notice a shutdown request within one tick.

use common::{Error, ExitSender, SessionError, Shutdown, UsbHandle};
use protocol::{AccessoryEndpoints, Channel, UsbError};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// Buffer and timeout sizing for the bridge threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    pub buffer_size: usize,
    pub poll_interval: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Copy bytes from the bulk IN endpoint to `stream` until shutdown or failure
pub fn upstream<H, W>(
    handle: &H,
    source: u8,
    stream: &mut W,
    settings: BridgeSettings,
    shutdown: &Shutdown,
) -> Result<(), SessionError>
where
    H: UsbHandle + ?Sized,
    W: Write,
{
    let channel = Channel::AccessoryUpstream;
    let mut buffer = vec![0u8; settings.buffer_size];

    while !shutdown.is_triggered() {
        let transferred = match handle.read_bulk(source, &mut buffer, settings.poll_interval) {
            Ok(n) => n,
            Err(UsbError::Timeout) => continue,
            Err(error) => return Err(SessionError::Usb { channel, error }),
        };
        if transferred == 0 {
            continue;
        }

        debug!("Transferring {} bytes from usb to local", transferred);
        write_all(stream, &buffer[..transferred], channel, shutdown)?;
    }

    Ok(())
}

/// Copy bytes from `stream` to the bulk OUT endpoint until shutdown or failure
///
/// End of stream means the consumer went away and ends the loop with
/// `SessionError::StreamClosed`.
pub fn downstream<H, R>(
    handle: &H,
    sink: u8,
    stream: &mut R,
    settings: BridgeSettings,
    shutdown: &Shutdown,
) -> Result<(), SessionError>
where
    H: UsbHandle + ?Sized,
    R: Read,
{
    let channel = Channel::AccessoryDownstream;
    let mut buffer = vec![0u8; settings.buffer_size];

    while !shutdown.is_triggered() {
        let len = match stream.read(&mut buffer) {
            Ok(0) => return Err(SessionError::StreamClosed { channel }),
            Ok(n) => n,
            Err(e) if is_tick(&e) => continue,
            Err(source) => return Err(SessionError::Stream { channel, source }),
        };

        debug!("Transferring {} bytes from local to usb", len);
        let mut offset = 0;
        while offset < len {
            if shutdown.is_triggered() {
                return Ok(());
            }
            match handle.write_bulk(sink, &buffer[offset..len], settings.poll_interval) {
                Ok(transferred) => offset += transferred,
                Err(UsbError::Timeout) => continue,
                Err(error) => return Err(SessionError::Usb { channel, error }),
            }
        }
    }

    Ok(())
}

/// Write everything to the local stream, retrying on poll ticks
fn write_all<W: Write>(
    stream: &mut W,
    mut data: &[u8],
    channel: Channel,
    shutdown: &Shutdown,
) -> Result<(), SessionError> {
    while !data.is_empty() {
        if shutdown.is_triggered() {
            return Ok(());
        }
        match stream.write(data) {
            Ok(0) => return Err(SessionError::StreamClosed { channel }),
            Ok(n) => data = &data[n..],
            Err(e) if is_tick(&e) => continue,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                return Err(SessionError::StreamClosed { channel });
            }
            Err(source) => return Err(SessionError::Stream { channel, source }),
        }
    }
    Ok(())
}

/// Errors a poll timeout produces on a local stream
fn is_tick(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Spawn a named loop thread that reports its outcome on `exits`
pub(crate) fn spawn_loop<F>(
    name: &str,
    channel: Channel,
    exits: ExitSender,
    body: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<(), SessionError> + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            info!("{} loop started", channel);
            let result = body();
            match &result {
                Ok(()) => info!("{} loop stopped", channel),
                Err(e) => error!("{}", e),
            }
            exits.report(channel, result);
        })
}

/// Running accessory bridge
pub struct AccessoryBridge {
    /// End handed to the consumer
    pub stream: UnixStream,
    pub workers: Vec<JoinHandle<()>>,
}

/// Create the socket pair and start both bridge threads
///
/// If the second thread cannot be spawned, the first one is stopped through
/// `shutdown` and joined before the error is returned.
pub fn spawn_accessory_bridge<H: UsbHandle>(
    handle: Arc<H>,
    endpoints: AccessoryEndpoints,
    settings: BridgeSettings,
    shutdown: Shutdown,
    exits: ExitSender,
) -> Result<AccessoryBridge, Error> {
    let (internal, external) = UnixStream::pair()?;
    internal.set_read_timeout(Some(settings.poll_interval))?;
    internal.set_write_timeout(Some(settings.poll_interval))?;
    let mut reader = internal.try_clone()?;
    let mut writer = internal;

    info!(
        "Bridging accessory interface {} (source {:#04x}, sink {:#04x})",
        endpoints.interface, endpoints.source, endpoints.sink
    );

    let upstream_handle = Arc::clone(&handle);
    let upstream_shutdown = shutdown.clone();
    let upstream_thread = spawn_loop(
        "aoa-usb-in",
        Channel::AccessoryUpstream,
        exits.clone(),
        move || {
            upstream(
                &*upstream_handle,
                endpoints.source,
                &mut writer,
                settings,
                &upstream_shutdown,
            )
        },
    )?;

    let downstream_shutdown = shutdown.clone();
    let downstream_thread = spawn_loop(
        "aoa-usb-out",
        Channel::AccessoryDownstream,
        exits,
        move || {
            downstream(
                &*handle,
                endpoints.sink,
                &mut reader,
                settings,
                &downstream_shutdown,
            )
        },
    );

    match downstream_thread {
        Ok(downstream_thread) => Ok(AccessoryBridge {
            stream: external,
            workers: vec![upstream_thread, downstream_thread],
        }),
        Err(e) => {
            shutdown.trigger();
            let _ = upstream_thread.join();
            Err(Error::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, MockBackend, MockHandle, create_accessory_mode_device,
        create_mock_bulk_data, wait_until,
    };
    use common::{UsbBackend, create_exit_channel};

    const ENDPOINTS: AccessoryEndpoints = AccessoryEndpoints {
        interface: 0,
        source: 0x81,
        sink: 0x01,
    };

    fn settings() -> BridgeSettings {
        BridgeSettings {
            buffer_size: 64,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn open() -> (MockBackend, MockHandle) {
        let backend = MockBackend::new(vec![create_accessory_mode_device(0x2d01)]);
        let devices = backend.devices().unwrap();
        let handle = backend.open(&devices[0]).unwrap();
        (backend, handle)
    }

    #[test]
    fn test_upstream_stops_on_shutdown() {
        let (_backend, handle) = open();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut sink = Vec::new();
        assert!(upstream(&handle, 0x81, &mut sink, settings(), &shutdown).is_ok());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_upstream_usb_error_is_reported() {
        let (backend, handle) = open();
        backend.push_bulk_in(b"hello");
        backend.fail_bulk_in(UsbError::NoDevice);

        let mut sink = Vec::new();
        let result = upstream(&handle, 0x81, &mut sink, settings(), &Shutdown::new());

        assert_eq!(sink, b"hello");
        match result {
            Err(SessionError::Usb { channel, error }) => {
                assert_eq!(channel, Channel::AccessoryUpstream);
                assert_eq!(error, UsbError::NoDevice);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_downstream_loops_on_partial_writes() {
        let (backend, handle) = open();
        backend.limit_bulk_out(7);
        let data = create_mock_bulk_data(100);

        let mut source = io::Cursor::new(data.clone());
        let result = downstream(&handle, 0x01, &mut source, settings(), &Shutdown::new());

        assert!(matches!(result, Err(SessionError::StreamClosed { .. })));
        assert_eq!(backend.bulk_out(), data);
        assert_eq!(backend.bulk_endpoints(), vec![0x01]);
    }

    #[test]
    fn test_downstream_usb_error_is_reported() {
        let (backend, handle) = open();
        backend.fail_bulk_out(UsbError::Pipe);

        let mut source = io::Cursor::new(vec![1u8, 2, 3]);
        let result = downstream(&handle, 0x01, &mut source, settings(), &Shutdown::new());
        assert!(matches!(
            result,
            Err(SessionError::Usb {
                channel: Channel::AccessoryDownstream,
                error: UsbError::Pipe
            })
        ));
    }

    #[test]
    fn test_bridge_reports_closed_stream() {
        let (_backend, handle) = open();
        let (exits, receiver) = create_exit_channel();
        let shutdown = Shutdown::new();

        let bridge = spawn_accessory_bridge(
            Arc::new(handle),
            ENDPOINTS,
            settings(),
            shutdown.clone(),
            exits,
        )
        .unwrap();
        drop(bridge.stream);

        let exit = receiver.recv_blocking().unwrap();
        assert_eq!(exit.channel, Channel::AccessoryDownstream);
        assert!(matches!(exit.result, Err(SessionError::StreamClosed { .. })));

        shutdown.trigger();
        for worker in bridge.workers {
            worker.join().unwrap();
        }
        let exit = receiver.recv_blocking().unwrap();
        assert_eq!(exit.channel, Channel::AccessoryUpstream);
        assert!(exit.result.is_ok());
    }

    #[test]
    fn test_bridge_threads_stop_within_a_tick() {
        let (backend, handle) = open();
        let (exits, receiver) = create_exit_channel();
        let shutdown = Shutdown::new();

        let bridge = spawn_accessory_bridge(
            Arc::new(handle),
            ENDPOINTS,
            settings(),
            shutdown.clone(),
            exits,
        )
        .unwrap();

        let mut stream = bridge.stream;
        stream.write_all(b"ping").unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || backend.bulk_out() == b"ping"));

        shutdown.trigger();
        for worker in bridge.workers {
            worker.join().unwrap();
        }
        assert!(receiver.recv_blocking().unwrap().result.is_ok());
        assert!(receiver.recv_blocking().unwrap().result.is_ok());
    }
}
