//! Android Open Accessory handshake
//!
//! Switches a phone in its normal USB configuration into accessory mode:
//! version check, identification strings, optional audio, start, and then
//! reacquiring the device once it re-enumerates under the accessory ids.

use crate::usb::enumerator::Enumerator;
use common::{Error, HandshakeStep, Result, UsbBackend, UsbHandle};
use protocol::aoa::{
    ACCESSORY_GET_PROTOCOL, ACCESSORY_PRODUCT_IDS, ACCESSORY_SEND_STRING, ACCESSORY_SET_AUDIO_MODE,
    ACCESSORY_START, ACCESSORY_VENDOR_ID, AUDIO_MODE_PCM_16_STEREO, REQUEST_TYPE_VENDOR_IN,
    REQUEST_TYPE_VENDOR_OUT,
};
use protocol::version::VERSION_RESPONSE_LEN;
use protocol::{AccessoryIdentity, ChannelMode, ProtocolVersion, StringSlot, UsbError};
use std::time::Duration;
use tracing::{debug, info};

/// Runs the handshake on one device handle
pub struct Negotiator<'a> {
    identity: &'a AccessoryIdentity,
    mode: ChannelMode,
    control_timeout: Duration,
}

impl<'a> Negotiator<'a> {
    pub fn new(
        identity: &'a AccessoryIdentity,
        mode: ChannelMode,
        control_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            mode,
            control_timeout,
        }
    }

    /// Identification strings in the order they are sent
    ///
    /// Manufacturer and model make the phone look for a matching app, so they
    /// are only sent when the accessory channel is wanted.
    pub fn string_slots(&self) -> Vec<StringSlot> {
        let mut slots = StringSlot::ALWAYS.to_vec();
        if self.mode.accessory() {
            slots.extend_from_slice(&StringSlot::ACCESSORY_ONLY);
        }
        slots
    }

    /// Read and check the accessory protocol version
    pub fn check_version<H: UsbHandle>(&self, handle: &H) -> Result<ProtocolVersion> {
        let mut buf = [0u8; VERSION_RESPONSE_LEN];
        let len = handle
            .read_control(
                REQUEST_TYPE_VENDOR_IN,
                ACCESSORY_GET_PROTOCOL,
                0,
                0,
                &mut buf,
                self.control_timeout,
            )
            .map_err(|source| Error::Negotiation {
                step: HandshakeStep::VersionCheck,
                source,
            })?;

        let version = ProtocolVersion::decode(&buf[..len])?;
        if !version.is_supported() {
            return Err(Error::UnsupportedVersion { version });
        }
        debug!("Device speaks accessory protocol version {}", version);
        Ok(version)
    }

    /// Send the identification strings
    pub fn send_identity<H: UsbHandle>(&self, handle: &H) -> Result<()> {
        for slot in self.string_slots() {
            let payload = self.identity.payload(slot)?;
            handle
                .write_control(
                    REQUEST_TYPE_VENDOR_OUT,
                    ACCESSORY_SEND_STRING,
                    0,
                    slot.index(),
                    &payload,
                    self.control_timeout,
                )
                .map_err(|source| Error::Negotiation {
                    step: HandshakeStep::Identify(slot),
                    source,
                })?;
            debug!("Sent {} string {:?}", slot, self.identity.get(slot));
        }
        Ok(())
    }

    /// Ask the device to route its audio to the USB audio interface
    pub fn enable_audio<H: UsbHandle>(&self, handle: &H) -> Result<()> {
        self.vendor_out(handle, ACCESSORY_SET_AUDIO_MODE, AUDIO_MODE_PCM_16_STEREO)
            .map_err(|source| Error::Negotiation {
                step: HandshakeStep::EnableAudio,
                source,
            })
    }

    /// Ask the device to re-enumerate in accessory mode
    pub fn start<H: UsbHandle>(&self, handle: &H) -> Result<()> {
        self.vendor_out(handle, ACCESSORY_START, 0)
            .map_err(|source| Error::Negotiation {
                step: HandshakeStep::Start,
                source,
            })
    }

    /// Version check, identification, audio and start, in that order
    pub fn negotiate<H: UsbHandle>(&self, handle: &H) -> Result<()> {
        self.check_version(handle)?;
        self.send_identity(handle)?;
        if self.mode.audio() {
            self.enable_audio(handle)?;
        }
        self.start(handle)?;
        info!("Accessory mode requested ({})", self.mode);
        Ok(())
    }

    /// Run the handshake, close the handle and open the re-enumerated device
    pub fn switch<B: UsbBackend>(
        &self,
        handle: B::Handle,
        enumerator: &Enumerator<B>,
        reacquire_timeout: Duration,
    ) -> Result<B::Handle> {
        self.negotiate(&handle)?;
        drop(handle);

        match enumerator.locate(ACCESSORY_VENDOR_ID, &ACCESSORY_PRODUCT_IDS, reacquire_timeout) {
            Ok(handle) => {
                info!("Reacquired device in accessory mode");
                Ok(handle)
            }
            Err(Error::DiscoveryTimeout { waited, .. }) => Err(Error::ReacquireTimeout { waited }),
            Err(e) => Err(e),
        }
    }

    fn vendor_out<H: UsbHandle>(
        &self,
        handle: &H,
        request: u8,
        value: u16,
    ) -> std::result::Result<(), UsbError> {
        handle
            .write_control(
                REQUEST_TYPE_VENDOR_OUT,
                request,
                value,
                0,
                &[],
                self.control_timeout,
            )
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockBackend, MockDevice, create_mock_phone};
    use common::UsbBackend;
    use protocol::aoa::{GOOGLE_VENDOR_ID, PID_ANGLER};
    use protocol::{ProtocolError, UsbError};

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn open(backend: &MockBackend) -> common::test_utils::MockHandle {
        let devices = backend.devices().unwrap();
        backend.open(&devices[0]).unwrap()
    }

    fn requests(backend: &MockBackend) -> Vec<u8> {
        backend.control_log().iter().map(|r| r.request).collect()
    }

    #[test]
    fn test_accessory_mode_sends_all_strings_in_order() {
        let identity = AccessoryIdentity::default();
        let backend = MockBackend::new(vec![create_mock_phone(0x2d01)]);
        let handle = open(&backend);

        Negotiator::new(&identity, ChannelMode::ACCESSORY, TIMEOUT)
            .negotiate(&handle)
            .unwrap();

        let indices: Vec<u16> = backend.sent_strings().iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![2, 3, 4, 5, 0, 1]);
        assert_eq!(requests(&backend), vec![51, 52, 52, 52, 52, 52, 52, 53]);
    }

    #[test]
    fn test_audio_only_omits_manufacturer_and_model() {
        let identity = AccessoryIdentity::default();
        let backend = MockBackend::new(vec![create_mock_phone(0x2d02)]);
        let handle = open(&backend);

        Negotiator::new(&identity, ChannelMode::AUDIO, TIMEOUT)
            .negotiate(&handle)
            .unwrap();

        let strings = backend.sent_strings();
        let indices: Vec<u16> = strings.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![2, 3, 4, 5]);
        assert_eq!(strings[0].1, identity.description);
        assert_eq!(requests(&backend), vec![51, 52, 52, 52, 52, 58, 53]);

        let audio = backend
            .control_log()
            .into_iter()
            .find(|r| r.request == ACCESSORY_SET_AUDIO_MODE)
            .unwrap();
        assert_eq!(audio.value, AUDIO_MODE_PCM_16_STEREO);
        assert_eq!(audio.request_type, REQUEST_TYPE_VENDOR_OUT);
    }

    #[test]
    fn test_strings_are_nul_terminated() {
        let identity = AccessoryIdentity::default();
        let backend = MockBackend::new(vec![create_mock_phone(0x2d01)]);
        let handle = open(&backend);

        Negotiator::new(&identity, ChannelMode::ACCESSORY, TIMEOUT)
            .send_identity(&handle)
            .unwrap();

        for record in backend.control_log() {
            assert_eq!(record.data.last(), Some(&0));
            assert_eq!(record.data.iter().filter(|b| **b == 0).count(), 1);
        }
    }

    #[test]
    fn test_unsupported_version_sends_no_strings() {
        let identity = AccessoryIdentity::default();
        let phone = MockDevice::new(GOOGLE_VENDOR_ID, PID_ANGLER).with_version(1);
        let backend = MockBackend::new(vec![phone]);
        let handle = open(&backend);

        let result = Negotiator::new(&identity, ChannelMode::ALL, TIMEOUT).negotiate(&handle);

        match result {
            Err(Error::UnsupportedVersion { version }) => assert_eq!(version, ProtocolVersion(1)),
            other => panic!("expected version error, got {:?}", other),
        }
        assert!(backend.sent_strings().is_empty());
        assert_eq!(requests(&backend), vec![ACCESSORY_GET_PROTOCOL]);
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let identity = AccessoryIdentity::default();
        let phone = MockDevice::new(GOOGLE_VENDOR_ID, PID_ANGLER).with_version(3);
        let backend = MockBackend::new(vec![phone]);
        let handle = open(&backend);

        let result = Negotiator::new(&identity, ChannelMode::AUDIO, TIMEOUT).check_version(&handle);
        assert!(matches!(result, Err(Error::UnsupportedVersion { .. })));
    }

    #[test]
    fn test_version_request_failure_names_step() {
        let identity = AccessoryIdentity::default();
        let phone = MockDevice::new(GOOGLE_VENDOR_ID, PID_ANGLER).without_version();
        let backend = MockBackend::new(vec![phone]);
        let handle = open(&backend);

        let result = Negotiator::new(&identity, ChannelMode::AUDIO, TIMEOUT).negotiate(&handle);
        assert!(matches!(
            result,
            Err(Error::Negotiation {
                step: HandshakeStep::VersionCheck,
                source: UsbError::Pipe
            })
        ));
    }

    #[test]
    fn test_string_failure_stops_handshake() {
        let identity = AccessoryIdentity::default();
        let backend = MockBackend::new(vec![
            MockDevice::new(GOOGLE_VENDOR_ID, PID_ANGLER).failing_request(ACCESSORY_SEND_STRING),
        ]);
        let handle = open(&backend);

        let result = Negotiator::new(&identity, ChannelMode::ALL, TIMEOUT).negotiate(&handle);
        assert!(matches!(
            result,
            Err(Error::Negotiation {
                step: HandshakeStep::Identify(StringSlot::Description),
                ..
            })
        ));
        assert!(!requests(&backend).contains(&ACCESSORY_START));
    }

    #[test]
    fn test_interior_nul_is_rejected_before_sending() {
        let identity = AccessoryIdentity {
            uri: "https://example.com/\0x".to_string(),
            ..AccessoryIdentity::default()
        };
        let backend = MockBackend::new(vec![create_mock_phone(0x2d01)]);
        let handle = open(&backend);

        let result = Negotiator::new(&identity, ChannelMode::AUDIO, TIMEOUT).send_identity(&handle);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::InteriorNul { .. }))
        ));
        // description and version went out before the uri was rejected
        assert_eq!(backend.sent_strings().len(), 2);
    }
}
