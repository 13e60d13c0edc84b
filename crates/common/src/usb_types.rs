//! USB access-layer abstractions
//!
//! The host core only talks to USB through these traits. The production
//! implementation wraps rusb/libusb; `test_utils` provides a scripted mock bus.

use protocol::{ConfigTree, TransferStatus, UsbError};
use std::time::Duration;

/// Device seen in one enumeration snapshot
#[derive(Debug, Clone)]
pub struct DeviceCandidate<D> {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    /// Backend-specific device reference, used to open the device
    pub device: D,
}

/// Bus-level operations: enumeration, opening, and asynchronous event dispatch
pub trait UsbBackend: Send + Sync + 'static {
    type Device: Send;
    type Handle: UsbHandle;

    /// Snapshot the devices currently attached to the bus
    fn devices(&self) -> Result<Vec<DeviceCandidate<Self::Device>>, UsbError>;

    /// Open a device from a snapshot
    fn open(&self, candidate: &DeviceCandidate<Self::Device>) -> Result<Self::Handle, UsbError>;

    /// Dispatch completions of asynchronous transfers, waiting at most `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError>;
}

/// Operations on one open device
///
/// Setup operations take `&mut self` and run before the handle is shared with
/// the bridge threads; transfer operations take `&self`.
pub trait UsbHandle: Send + Sync + 'static {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Bulk IN transfer
    ///
    /// Bytes received before a timeout are returned as a successful short
    /// read; `Err(UsbError::Timeout)` means nothing arrived.
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError>;

    /// Bulk OUT transfer
    ///
    /// Bytes accepted before a timeout are returned as a successful short
    /// write; `Err(UsbError::Timeout)` means nothing was sent.
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, UsbError>;

    /// Owned snapshot of the active configuration descriptor
    fn active_configuration(&self) -> Result<ConfigTree, UsbError>;

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, UsbError>;

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError>;

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), UsbError>;

    /// Submit an isochronous IN transfer
    ///
    /// Completions are delivered to `handler` from within
    /// `UsbBackend::handle_events`. The transfer is resubmitted for as long as
    /// the handler answers `IsoAction::Resubmit`.
    fn submit_isochronous(
        &self,
        request: IsoRequest,
        handler: Box<dyn IsoHandler>,
    ) -> Result<(), UsbError>;
}

/// Shape of an isochronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoRequest {
    pub endpoint: u8,
    pub packets: usize,
    pub packet_size: usize,
    /// Zero means no timeout
    pub timeout: Duration,
}

impl IsoRequest {
    pub fn buffer_len(&self) -> usize {
        self.packets * self.packet_size
    }
}

/// One packet of a completed isochronous transfer
#[derive(Debug, Clone, Copy)]
pub struct IsoPacket<'a> {
    pub status: TransferStatus,
    /// Received bytes, `actual_length` long
    pub data: &'a [u8],
}

/// A completed isochronous transfer
#[derive(Debug)]
pub struct IsoCompletion<'a> {
    pub status: TransferStatus,
    pub packets: &'a [IsoPacket<'a>],
}

/// What to do with a transfer after its completion was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoAction {
    Resubmit,
    Stop,
}

/// Receiver of isochronous completions
pub trait IsoHandler: Send {
    fn on_complete(&mut self, completion: &IsoCompletion<'_>) -> IsoAction;

    /// Called exactly once when the transfer will not be submitted again,
    /// with the resubmission error if that is why.
    fn on_retired(&mut self, result: Result<(), UsbError>);
}
