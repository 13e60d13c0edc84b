//! Test utilities for aoa-bridge
//!
//! Provides a scripted in-memory USB bus (`MockBackend`), a manually advanced
//! clock, and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::UsbBackend;
//! use common::test_utils::{MockBackend, create_mock_phone};
//!
//! # fn main() {
//! let backend = MockBackend::new(vec![create_mock_phone(0x2d01)]);
//! let devices = backend.devices().unwrap();
//! assert_eq!(devices.len(), 1);
//! assert_eq!(devices[0].vendor_id, 0x18d1);
//! # }
//! ```

use crate::clock::Clock;
use crate::usb_types::{
    DeviceCandidate, IsoAction, IsoCompletion, IsoHandler, IsoPacket, IsoRequest, UsbBackend,
    UsbHandle,
};
use protocol::aoa::{
    ACCESSORY_GET_PROTOCOL, ACCESSORY_SEND_STRING, ACCESSORY_START, ACCESSORY_VENDOR_ID,
    GOOGLE_VENDOR_ID, PID_ANGLER,
};
use protocol::{
    AltSetting, ConfigTree, EndpointInfo, InterfaceTree, TransferKind, TransferStatus, UsbError,
};
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Packet size of the isochronous endpoint on mock accessory-mode devices
pub const MOCK_AUDIO_PACKET_SIZE: u16 = 192;

/// Behavior of one simulated device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Answer to `ACCESSORY_GET_PROTOCOL`, None stalls the request
    pub protocol_version: Option<u16>,
    pub config: ConfigTree,
    /// Control requests answered with a stall
    pub failing_requests: Vec<u8>,
    /// Interfaces bound to a kernel driver
    pub kernel_drivers: Vec<u8>,
    pub open_error: Option<UsbError>,
    /// Number of enumeration snapshots before the device shows up
    pub hidden_for: usize,
    /// Device that replaces this one after `ACCESSORY_START`
    pub switches_to: Option<Box<MockDevice>>,
}

impl MockDevice {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            protocol_version: Some(2),
            config: ConfigTree::default(),
            failing_requests: Vec::new(),
            kernel_drivers: Vec::new(),
            open_error: None,
            hidden_for: 0,
            switches_to: None,
        }
    }

    pub fn with_version(mut self, version: u16) -> Self {
        self.protocol_version = Some(version);
        self
    }

    pub fn without_version(mut self) -> Self {
        self.protocol_version = None;
        self
    }

    pub fn with_config(mut self, config: ConfigTree) -> Self {
        self.config = config;
        self
    }

    pub fn failing_request(mut self, request: u8) -> Self {
        self.failing_requests.push(request);
        self
    }

    pub fn with_kernel_driver(mut self, interface: u8) -> Self {
        self.kernel_drivers.push(interface);
        self
    }

    pub fn with_open_error(mut self, error: UsbError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn hidden_for(mut self, snapshots: usize) -> Self {
        self.hidden_for = snapshots;
        self
    }

    pub fn switches_to(mut self, device: MockDevice) -> Self {
        self.switches_to = Some(Box::new(device));
        self
    }
}

/// Bulk endpoint descriptor
pub fn bulk_endpoint(address: u8) -> EndpointInfo {
    EndpointInfo {
        address,
        transfer_kind: TransferKind::Bulk,
        max_packet_size: 512,
    }
}

/// Isochronous endpoint descriptor
pub fn iso_endpoint(address: u8, max_packet_size: u16) -> EndpointInfo {
    EndpointInfo {
        address,
        transfer_kind: TransferKind::Isochronous,
        max_packet_size,
    }
}

/// Interface with a single alternate setting
pub fn single_setting_interface(
    number: u8,
    class: u8,
    subclass: u8,
    endpoints: Vec<EndpointInfo>,
) -> InterfaceTree {
    InterfaceTree {
        number,
        alt_settings: vec![AltSetting {
            setting: 0,
            class,
            subclass,
            protocol: 0,
            endpoints,
        }],
    }
}

/// Vendor-specific accessory interface with one bulk pair
pub fn accessory_interface(number: u8, source: u8, sink: u8) -> InterfaceTree {
    single_setting_interface(
        number,
        0xff,
        0xff,
        vec![bulk_endpoint(source), bulk_endpoint(sink)],
    )
}

/// Audio streaming interface: zero-bandwidth alternate 0, isochronous IN on alternate 1
pub fn audio_streaming_interface(number: u8, address: u8, max_packet_size: u16) -> InterfaceTree {
    InterfaceTree {
        number,
        alt_settings: vec![
            AltSetting {
                setting: 0,
                class: 0x01,
                subclass: 0x02,
                protocol: 0,
                endpoints: Vec::new(),
            },
            AltSetting {
                setting: 1,
                class: 0x01,
                subclass: 0x02,
                protocol: 0,
                endpoints: vec![iso_endpoint(address, max_packet_size)],
            },
        ],
    }
}

/// Descriptor tree of a device in accessory + audio mode
///
/// Accessory on interface 0 (source 0x81, sink 0x01), audio control on
/// interface 1, audio streaming on interface 2 (endpoint 0x83).
pub fn create_accessory_config() -> ConfigTree {
    ConfigTree {
        interfaces: vec![
            accessory_interface(0, 0x81, 0x01),
            single_setting_interface(1, 0x01, 0x01, Vec::new()),
            audio_streaming_interface(2, 0x83, MOCK_AUDIO_PACKET_SIZE),
        ],
    }
}

/// Device already switched into accessory mode
pub fn create_accessory_mode_device(product_id: u16) -> MockDevice {
    MockDevice::new(ACCESSORY_VENDOR_ID, product_id).with_config(create_accessory_config())
}

/// Phone in its normal configuration that re-enumerates as `after_switch`
pub fn create_mock_phone(after_switch: u16) -> MockDevice {
    MockDevice::new(GOOGLE_VENDOR_ID, PID_ANGLER)
        .switches_to(create_accessory_mode_device(after_switch))
}

/// Deterministic bulk payload
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Control transfer as seen by the mock device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Payload of OUT requests, empty for IN requests
    pub data: Vec<u8>,
}

/// Scripted completion of one isochronous transfer
#[derive(Debug, Clone)]
pub struct MockIsoBatch {
    pub status: TransferStatus,
    pub packets: Vec<Vec<u8>>,
}

impl MockIsoBatch {
    /// Completed batch whose packet `i` holds `lengths[i]` bytes of value `i`
    pub fn with_lengths(lengths: &[usize]) -> Self {
        Self {
            status: TransferStatus::Completed,
            packets: lengths
                .iter()
                .enumerate()
                .map(|(i, len)| vec![i as u8; *len])
                .collect(),
        }
    }

    /// Batch that completed with a non-completed transfer status
    pub fn failed(status: TransferStatus) -> Self {
        Self {
            status,
            packets: Vec::new(),
        }
    }

    fn idle(packets: usize) -> Self {
        Self {
            status: TransferStatus::Completed,
            packets: vec![Vec::new(); packets],
        }
    }
}

struct MockSlot {
    id: usize,
    device: MockDevice,
    hidden_for: usize,
}

#[derive(Default)]
struct MockBus {
    slots: Vec<MockSlot>,
    next_id: usize,
    enumeration_error: Option<UsbError>,
    snapshots: usize,
    opened: Vec<(u16, u16)>,
    closed: usize,
    control_log: Vec<ControlRecord>,
    detached: Vec<u8>,
    claimed: Vec<u8>,
    released: Vec<u8>,
    alt_settings: Vec<(u8, u8)>,
    bulk_endpoints: BTreeSet<u8>,
    bulk_in: VecDeque<Vec<u8>>,
    bulk_in_error: Option<UsbError>,
    bulk_out: Vec<u8>,
    bulk_out_limit: Option<usize>,
    bulk_out_error: Option<UsbError>,
    iso_script: VecDeque<MockIsoBatch>,
    iso_pending: Option<(IsoRequest, Box<dyn IsoHandler>)>,
    iso_submissions: Vec<IsoRequest>,
    iso_resubmit_error: Option<UsbError>,
    iso_retired: Option<Result<(), UsbError>>,
}

impl MockBus {
    fn insert(&mut self, device: MockDevice) {
        let id = self.next_id;
        self.next_id += 1;
        let hidden_for = device.hidden_for;
        self.slots.push(MockSlot {
            id,
            device,
            hidden_for,
        });
    }
}

fn lock(bus: &Mutex<MockBus>) -> MutexGuard<'_, MockBus> {
    bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted USB bus shared by a backend and every handle it opens
#[derive(Clone, Default)]
pub struct MockBackend {
    bus: Arc<Mutex<MockBus>>,
}

impl MockBackend {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        let backend = Self::default();
        for device in devices {
            backend.add_device(device);
        }
        backend
    }

    fn bus(&self) -> MutexGuard<'_, MockBus> {
        lock(&self.bus)
    }

    pub fn add_device(&self, device: MockDevice) {
        self.bus().insert(device);
    }

    pub fn fail_enumeration(&self, error: UsbError) {
        self.bus().enumeration_error = Some(error);
    }

    /// Queue bytes the device sends on its bulk IN endpoint
    pub fn push_bulk_in(&self, data: &[u8]) {
        self.bus().bulk_in.push_back(data.to_vec());
    }

    /// Fail bulk IN transfers once the queued data is drained
    pub fn fail_bulk_in(&self, error: UsbError) {
        self.bus().bulk_in_error = Some(error);
    }

    /// Accept at most `limit` bytes per bulk OUT transfer
    pub fn limit_bulk_out(&self, limit: usize) {
        self.bus().bulk_out_limit = Some(limit);
    }

    pub fn fail_bulk_out(&self, error: UsbError) {
        self.bus().bulk_out_error = Some(error);
    }

    /// Queue the next isochronous completion; an idle batch is delivered when empty
    pub fn script_iso(&self, batch: MockIsoBatch) {
        self.bus().iso_script.push_back(batch);
    }

    pub fn fail_iso_resubmit(&self, error: UsbError) {
        self.bus().iso_resubmit_error = Some(error);
    }

    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.bus().control_log.clone()
    }

    /// Identification strings received, as (slot index, string without NUL)
    pub fn sent_strings(&self) -> Vec<(u16, String)> {
        self.bus()
            .control_log
            .iter()
            .filter(|record| record.request == ACCESSORY_SEND_STRING)
            .map(|record| {
                let text = record.data.strip_suffix(&[0]).unwrap_or(&record.data);
                (record.index, String::from_utf8_lossy(text).into_owned())
            })
            .collect()
    }

    pub fn opened(&self) -> Vec<(u16, u16)> {
        self.bus().opened.clone()
    }

    pub fn closed_handles(&self) -> usize {
        self.bus().closed
    }

    pub fn snapshots(&self) -> usize {
        self.bus().snapshots
    }

    pub fn detached(&self) -> Vec<u8> {
        self.bus().detached.clone()
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.bus().claimed.clone()
    }

    pub fn released(&self) -> Vec<u8> {
        self.bus().released.clone()
    }

    pub fn alternate_settings(&self) -> Vec<(u8, u8)> {
        self.bus().alt_settings.clone()
    }

    /// Endpoints used by bulk transfers so far
    pub fn bulk_endpoints(&self) -> Vec<u8> {
        self.bus().bulk_endpoints.iter().copied().collect()
    }

    /// Bytes received on the bulk OUT endpoint
    pub fn bulk_out(&self) -> Vec<u8> {
        self.bus().bulk_out.clone()
    }

    /// Every isochronous submission, including resubmissions
    pub fn iso_submissions(&self) -> Vec<IsoRequest> {
        self.bus().iso_submissions.clone()
    }

    pub fn iso_retired(&self) -> Option<Result<(), UsbError>> {
        self.bus().iso_retired.clone()
    }
}

impl UsbBackend for MockBackend {
    type Device = usize;
    type Handle = MockHandle;

    fn devices(&self) -> Result<Vec<DeviceCandidate<usize>>, UsbError> {
        let mut bus = self.bus();
        bus.snapshots += 1;
        if let Some(error) = bus.enumeration_error.clone() {
            return Err(error);
        }

        let mut candidates = Vec::new();
        for slot in bus.slots.iter_mut() {
            if slot.hidden_for > 0 {
                slot.hidden_for -= 1;
                continue;
            }
            candidates.push(DeviceCandidate {
                vendor_id: slot.device.vendor_id,
                product_id: slot.device.product_id,
                bus_number: 1,
                device_address: (slot.id % 128) as u8 + 1,
                device: slot.id,
            });
        }
        Ok(candidates)
    }

    fn open(&self, candidate: &DeviceCandidate<usize>) -> Result<MockHandle, UsbError> {
        let mut bus = self.bus();
        let device = bus
            .slots
            .iter()
            .find(|slot| slot.id == candidate.device)
            .map(|slot| slot.device.clone())
            .ok_or(UsbError::NoDevice)?;
        if let Some(error) = device.open_error.clone() {
            return Err(error);
        }
        bus.opened.push((device.vendor_id, device.product_id));
        Ok(MockHandle {
            bus: Arc::clone(&self.bus),
            slot_id: candidate.device,
            device,
        })
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError> {
        let pending = self.bus().iso_pending.take();
        let Some((request, mut handler)) = pending else {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
            return Ok(());
        };

        let scripted = self.bus().iso_script.pop_front();
        let idle = scripted.is_none();
        let batch = scripted.unwrap_or_else(|| MockIsoBatch::idle(request.packets.min(8)));
        let packets: Vec<IsoPacket<'_>> = batch
            .packets
            .iter()
            .map(|data| IsoPacket {
                status: TransferStatus::Completed,
                data: data.as_slice(),
            })
            .collect();

        let action = handler.on_complete(&IsoCompletion {
            status: batch.status,
            packets: &packets,
        });

        let mut bus = self.bus();
        match action {
            IsoAction::Resubmit => {
                if let Some(error) = bus.iso_resubmit_error.clone() {
                    drop(bus);
                    handler.on_retired(Err(error.clone()));
                    self.bus().iso_retired = Some(Err(error));
                    return Ok(());
                }
                bus.iso_submissions.push(request);
                bus.iso_pending = Some((request, handler));
            }
            IsoAction::Stop => {
                drop(bus);
                handler.on_retired(Ok(()));
                self.bus().iso_retired = Some(Ok(()));
                return Ok(());
            }
        }
        drop(bus);

        if idle {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }
}

/// Handle to a device on the mock bus
pub struct MockHandle {
    bus: Arc<Mutex<MockBus>>,
    slot_id: usize,
    device: MockDevice,
}

impl MockHandle {
    fn bus(&self) -> MutexGuard<'_, MockBus> {
        lock(&self.bus)
    }

    fn record(&self, request_type: u8, request: u8, value: u16, index: u16, data: &[u8]) {
        self.bus().control_log.push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.bus().closed += 1;
    }
}

impl UsbHandle for MockHandle {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.record(request_type, request, value, index, &[]);
        if self.device.failing_requests.contains(&request) {
            return Err(UsbError::Pipe);
        }
        if request != ACCESSORY_GET_PROTOCOL {
            return Ok(0);
        }

        let version = self.device.protocol_version.ok_or(UsbError::Pipe)?;
        let bytes = version.to_le_bytes();
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.record(request_type, request, value, index, data);
        if self.device.failing_requests.contains(&request) {
            return Err(UsbError::Pipe);
        }

        if request == ACCESSORY_START {
            if let Some(next) = &self.device.switches_to {
                let mut bus = self.bus();
                bus.slots.retain(|slot| slot.id != self.slot_id);
                bus.insert((**next).clone());
            }
        }
        Ok(data.len())
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut bus = self.bus();
        bus.bulk_endpoints.insert(endpoint);
        match bus.bulk_in.pop_front() {
            Some(mut chunk) => {
                let len = chunk.len().min(buf.len());
                buf[..len].copy_from_slice(&chunk[..len]);
                if len < chunk.len() {
                    chunk.drain(..len);
                    bus.bulk_in.push_front(chunk);
                }
                Ok(len)
            }
            None => {
                if let Some(error) = bus.bulk_in_error.clone() {
                    return Err(error);
                }
                drop(bus);
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
                Err(UsbError::Timeout)
            }
        }
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, UsbError> {
        let mut bus = self.bus();
        bus.bulk_endpoints.insert(endpoint);
        if let Some(error) = bus.bulk_out_error.clone() {
            return Err(error);
        }
        let len = bus.bulk_out_limit.map_or(data.len(), |limit| limit.min(data.len()));
        bus.bulk_out.extend_from_slice(&data[..len]);
        Ok(len)
    }

    fn active_configuration(&self) -> Result<ConfigTree, UsbError> {
        Ok(self.device.config.clone())
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, UsbError> {
        let detached = self.bus().detached.contains(&interface);
        Ok(self.device.kernel_drivers.contains(&interface) && !detached)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError> {
        self.bus().detached.push(interface);
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.bus().claimed.push(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.bus().released.push(interface);
        Ok(())
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), UsbError> {
        self.bus().alt_settings.push((interface, setting));
        Ok(())
    }

    fn submit_isochronous(
        &self,
        request: IsoRequest,
        handler: Box<dyn IsoHandler>,
    ) -> Result<(), UsbError> {
        let mut bus = self.bus();
        if bus.iso_pending.is_some() {
            return Err(UsbError::Busy);
        }
        bus.iso_submissions.push(request);
        bus.iso_pending = Some((request, handler));
        Ok(())
    }
}

/// Clock that only moves when slept on or advanced
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner()) += duration;
    }

    /// Total simulated time since creation
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every requested sleep, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        self.advance(duration);
    }
}

/// Poll `condition` every millisecond until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Run a future with a timeout, useful for async tests
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// # #[tokio::main]
/// # async fn main() {
/// let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
/// assert_eq!(result.unwrap(), 42);
/// # }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::aoa::{ACCESSORY_PRODUCT_IDS, REQUEST_TYPE_VENDOR_OUT};

    #[test]
    fn test_mock_device_switches_on_start() {
        let backend = MockBackend::new(vec![create_mock_phone(0x2d03)]);
        let devices = backend.devices().unwrap();
        assert_eq!(devices[0].product_id, PID_ANGLER);

        let handle = backend.open(&devices[0]).unwrap();
        handle
            .write_control(
                REQUEST_TYPE_VENDOR_OUT,
                ACCESSORY_START,
                0,
                0,
                &[],
                DEFAULT_TEST_TIMEOUT,
            )
            .unwrap();

        let devices = backend.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor_id, ACCESSORY_VENDOR_ID);
        assert!(ACCESSORY_PRODUCT_IDS.contains(&devices[0].product_id));
    }

    #[test]
    fn test_hidden_device_appears_later() {
        let backend = MockBackend::new(vec![create_accessory_mode_device(0x2d00).hidden_for(2)]);
        assert!(backend.devices().unwrap().is_empty());
        assert!(backend.devices().unwrap().is_empty());
        assert_eq!(backend.devices().unwrap().len(), 1);
        assert_eq!(backend.snapshots(), 3);
    }

    #[test]
    fn test_handle_drop_counts_close() {
        let backend = MockBackend::new(vec![create_accessory_mode_device(0x2d00)]);
        let devices = backend.devices().unwrap();
        let handle = backend.open(&devices[0]).unwrap();
        assert_eq!(backend.closed_handles(), 0);
        drop(handle);
        assert_eq!(backend.closed_handles(), 1);
    }

    #[test]
    fn test_bulk_in_chunks_split_across_reads() {
        let backend = MockBackend::new(vec![create_accessory_mode_device(0x2d00)]);
        let devices = backend.devices().unwrap();
        let handle = backend.open(&devices[0]).unwrap();
        backend.push_bulk_in(&create_mock_bulk_data(10));

        let mut buf = [0u8; 4];
        assert_eq!(handle.read_bulk(0x81, &mut buf, DEFAULT_TEST_TIMEOUT), Ok(4));
        assert_eq!(buf, [0, 1, 2, 3]);
        assert_eq!(handle.read_bulk(0x81, &mut buf, DEFAULT_TEST_TIMEOUT), Ok(4));
        assert_eq!(handle.read_bulk(0x81, &mut buf, DEFAULT_TEST_TIMEOUT), Ok(2));
        assert_eq!(
            handle.read_bulk(0x81, &mut buf, Duration::from_millis(1)),
            Err(UsbError::Timeout)
        );
    }

    #[test]
    fn test_manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(250));
        clock.sleep(Duration::from_millis(100));
        assert_eq!(clock.now() - start, Duration::from_millis(350));
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(250), Duration::from_millis(100)]);
    }

    #[test]
    fn test_iso_batch_lengths() {
        let batch = MockIsoBatch::with_lengths(&[0, 3, 1]);
        assert_eq!(batch.packets, vec![vec![], vec![1, 1, 1], vec![2]]);
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
