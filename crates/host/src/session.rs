//! Accessory session lifecycle
//!
//! `AccessoryDevice::open` finds the phone in its normal configuration.
//! `AccessoryDevice::initialize` negotiates accessory mode, reopens the
//! re-enumerated device, resolves and claims its interfaces and starts the
//! bridge threads, returning the running `Session`.
//!
//! Dropping the session stops every loop, joins the threads, releases the
//! claimed interfaces and closes the device handle.

use crate::usb::bridge::{BridgeSettings, spawn_accessory_bridge};
use crate::usb::capture::{CaptureStats, spawn_audio_capture};
use crate::usb::enumerator::Enumerator;
use crate::usb::negotiator::Negotiator;
use crate::usb::resolver::{
    accessory_endpoints, audio_endpoint, claim_audio_interface, claim_interface, resolve,
};
use common::{
    Clock, Error, ExitReceiver, ExitSender, LoopExit, Result, SessionError, Shutdown, SystemClock,
    UsbBackend, UsbHandle, create_exit_channel,
};
use protocol::aoa::{GOOGLE_VENDOR_ID, PID_ANGLER, PID_HAMMERHEAD};
use protocol::{
    AccessoryEndpoints, AccessoryIdentity, AudioEndpoint, Channel, ChannelMode, InterfaceSelector,
};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Everything needed to find, negotiate and bridge a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Vendor id of the phone before the mode switch
    pub vendor_id: u16,
    /// Accepted product ids before the mode switch
    pub product_ids: Vec<u16>,
    pub discovery_timeout: Duration,
    /// Wait for the device to come back in accessory mode
    pub reacquire_timeout: Duration,
    pub poll_interval: Duration,
    pub control_timeout: Duration,
    pub identity: AccessoryIdentity,
    pub bridge: BridgeSettings,
    pub packets_per_transfer: usize,
    /// Audio streaming alternate setting, chosen automatically when None
    pub alternate_setting: Option<u8>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            vendor_id: GOOGLE_VENDOR_ID,
            product_ids: vec![PID_HAMMERHEAD, PID_ANGLER],
            discovery_timeout: Duration::from_millis(100),
            reacquire_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            control_timeout: Duration::from_secs(1),
            identity: AccessoryIdentity::default(),
            bridge: BridgeSettings::default(),
            packets_per_transfer: 128,
            alternate_setting: None,
        }
    }
}

/// Terminal event of a session
#[derive(Debug)]
pub enum SessionEvent {
    /// Loops stopped because shutdown was requested
    Shutdown,
    /// A loop failed; the others were asked to stop
    Failed {
        channel: Channel,
        error: SessionError,
    },
}

impl From<Option<LoopExit>> for SessionEvent {
    fn from(exit: Option<LoopExit>) -> Self {
        match exit {
            Some(LoopExit {
                channel,
                result: Err(error),
            }) => SessionEvent::Failed { channel, error },
            Some(LoopExit { result: Ok(()), .. }) | None => SessionEvent::Shutdown,
        }
    }
}

/// Device found in its normal configuration, not yet negotiated
pub struct AccessoryDevice<B: UsbBackend> {
    enumerator: Enumerator<B>,
    handle: B::Handle,
    mode: ChannelMode,
    settings: SessionSettings,
}

impl<B: UsbBackend> AccessoryDevice<B> {
    /// Locate and open the phone
    pub fn open(backend: Arc<B>, settings: SessionSettings, mode: ChannelMode) -> Result<Self> {
        Self::open_with_clock(backend, Arc::new(SystemClock), settings, mode)
    }

    /// Same as `open`, with an explicit clock for discovery deadlines
    pub fn open_with_clock(
        backend: Arc<B>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
        mode: ChannelMode,
    ) -> Result<Self> {
        if mode.is_empty() {
            return Err(Error::InvalidMode(mode));
        }
        settings.identity.validate()?;

        let enumerator = Enumerator::new(backend, clock, settings.poll_interval);
        let handle = enumerator.locate(
            settings.vendor_id,
            &settings.product_ids,
            settings.discovery_timeout,
        )?;

        Ok(Self {
            enumerator,
            handle,
            mode,
            settings,
        })
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    /// Switch the device to accessory mode and start bridging
    pub fn initialize(self) -> Result<Session<B>> {
        let Self {
            enumerator,
            handle,
            mode,
            settings,
        } = self;

        let negotiator = Negotiator::new(&settings.identity, mode, settings.control_timeout);
        let mut handle = negotiator.switch(handle, &enumerator, settings.reacquire_timeout)?;

        let config = handle.active_configuration().map_err(Error::Descriptor)?;
        let accessory = if mode.accessory() {
            let endpoints = resolve(&config, InterfaceSelector::ACCESSORY);
            Some(accessory_endpoints(&endpoints)?)
        } else {
            None
        };
        let audio = if mode.audio() {
            let endpoints = resolve(&config, InterfaceSelector::AUDIO_STREAMING);
            Some(audio_endpoint(&endpoints, settings.alternate_setting)?)
        } else {
            None
        };

        let mut claimed = Vec::new();
        if let Err(e) = claim_all(&mut handle, accessory, audio, &mut claimed) {
            release_all(&mut handle, &claimed);
            return Err(e);
        }

        let (exit_sender, exit_receiver) = create_exit_channel();
        let handle = Arc::new(handle);
        let mut session = Session {
            backend: Arc::clone(enumerator.backend()),
            handle: Some(Arc::clone(&handle)),
            mode,
            accessory,
            audio,
            claimed,
            accessory_stream: None,
            audio_stream: None,
            audio_stats: None,
            workers: Vec::new(),
            shutdown: Shutdown::new(),
            exits: exit_receiver,
        };

        // The session must hold the only handle reference when it is dropped
        let started = session.start(&handle, &settings, exit_sender);
        drop(handle);
        started?;

        info!("Session started ({})", mode);
        Ok(session)
    }
}

fn claim_all<H: UsbHandle>(
    handle: &mut H,
    accessory: Option<AccessoryEndpoints>,
    audio: Option<AudioEndpoint>,
    claimed: &mut Vec<u8>,
) -> Result<()> {
    if let Some(endpoints) = accessory {
        claim_interface(handle, endpoints.interface)?;
        claimed.push(endpoints.interface);
    }
    if let Some(endpoint) = audio {
        claim_audio_interface(handle, &endpoint)?;
        claimed.push(endpoint.interface);
    }
    Ok(())
}

fn release_all<H: UsbHandle>(handle: &mut H, claimed: &[u8]) {
    for interface in claimed.iter().rev() {
        if let Err(e) = handle.release_interface(*interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
    }
}

/// Running accessory and/or audio bridge on an accessory-mode device
pub struct Session<B: UsbBackend> {
    backend: Arc<B>,
    handle: Option<Arc<B::Handle>>,
    mode: ChannelMode,
    accessory: Option<AccessoryEndpoints>,
    audio: Option<AudioEndpoint>,
    claimed: Vec<u8>,
    accessory_stream: Option<UnixStream>,
    audio_stream: Option<UnixStream>,
    audio_stats: Option<Arc<CaptureStats>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Shutdown,
    exits: ExitReceiver,
}

impl<B: UsbBackend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("accessory", &self.accessory)
            .field("audio", &self.audio)
            .field("claimed", &self.claimed)
            .finish_non_exhaustive()
    }
}

impl<B: UsbBackend> Session<B> {
    /// Start the bridge threads and the audio capture
    ///
    /// Workers started before a failure are stopped when the session drops.
    fn start(
        &mut self,
        handle: &Arc<B::Handle>,
        settings: &SessionSettings,
        exits: ExitSender,
    ) -> Result<()> {
        if let Some(endpoints) = self.accessory {
            let bridge = spawn_accessory_bridge(
                Arc::clone(handle),
                endpoints,
                settings.bridge,
                self.shutdown.clone(),
                exits.clone(),
            )?;
            self.accessory_stream = Some(bridge.stream);
            self.workers.extend(bridge.workers);
        }
        if let Some(endpoint) = self.audio {
            let capture = spawn_audio_capture(
                Arc::clone(&self.backend),
                &**handle,
                endpoint,
                settings.packets_per_transfer,
                self.shutdown.clone(),
                exits,
            )?;
            self.audio_stream = Some(capture.stream);
            self.audio_stats = Some(capture.stats);
            self.workers.push(capture.event_thread);
        }
        Ok(())
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn accessory_endpoints(&self) -> Option<AccessoryEndpoints> {
        self.accessory
    }

    pub fn audio_endpoint(&self) -> Option<AudioEndpoint> {
        self.audio
    }

    /// Consumer end of the accessory byte pipe, available once
    pub fn take_accessory_stream(&mut self) -> Option<UnixStream> {
        self.accessory_stream.take()
    }

    /// Consumer end of the audio stream, available once
    pub fn take_audio_stream(&mut self) -> Option<UnixStream> {
        self.audio_stream.take()
    }

    /// Number of audio batches the consumer was too slow for
    pub fn audio_overruns(&self) -> u64 {
        self.audio_stats.as_ref().map_or(0, |stats| stats.overruns())
    }

    /// Ask every loop to stop
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Block until the first loop stops, then stop the others
    pub fn wait(&self) -> SessionEvent {
        let event = SessionEvent::from(self.exits.recv_blocking());
        self.shutdown.trigger();
        event
    }

    /// Wait until the first loop stops, then stop the others
    pub async fn closed(&self) -> SessionEvent {
        let event = SessionEvent::from(self.exits.recv().await);
        self.shutdown.trigger();
        event
    }
}

impl<B: UsbBackend> Drop for Session<B> {
    fn drop(&mut self) {
        self.shutdown.trigger();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Session worker thread panicked");
            }
        }

        let Some(handle) = self.handle.take() else {
            return;
        };
        let handle = match Arc::try_unwrap(handle) {
            Ok(handle) => handle,
            Err(_) => {
                warn!("Device handle still in use, interfaces left claimed");
                return;
            }
        };

        let retired = self
            .audio_stats
            .as_ref()
            .is_none_or(|stats| stats.is_retired());
        if !retired {
            // closing the handle under an in-flight transfer is undefined in libusb
            error!("Audio transfer still in flight, leaking device handle");
            std::mem::forget(handle);
            return;
        }

        let mut handle = handle;
        release_all(&mut handle, &self.claimed);
        drop(handle);
        info!("Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{ManualClock, MockBackend, create_mock_phone};

    #[test]
    fn test_empty_mode_is_rejected() {
        let backend = Arc::new(MockBackend::new(vec![create_mock_phone(0x2d01)]));
        let result = AccessoryDevice::open_with_clock(
            backend.clone(),
            Arc::new(ManualClock::new()),
            SessionSettings::default(),
            ChannelMode::NONE,
        );
        assert!(matches!(result, Err(Error::InvalidMode(_))));
        assert!(backend.opened().is_empty());
    }

    #[test]
    fn test_session_event_from_exit() {
        let event = SessionEvent::from(Some(LoopExit {
            channel: Channel::AccessoryDownstream,
            result: Err(SessionError::StreamClosed {
                channel: Channel::AccessoryDownstream,
            }),
        }));
        assert!(matches!(
            event,
            SessionEvent::Failed {
                channel: Channel::AccessoryDownstream,
                ..
            }
        ));

        assert!(matches!(SessionEvent::from(None), SessionEvent::Shutdown));
        assert!(matches!(
            SessionEvent::from(Some(LoopExit {
                channel: Channel::Audio,
                result: Ok(()),
            })),
            SessionEvent::Shutdown
        ));
    }
}
