//! rusb-backed USB access layer
//!
//! This module wraps a single `rusb::Context` (created once by the caller) and
//! the device handles opened from it, converting rusb descriptors and errors
//! into the protocol types used by the rest of the host.

use crate::usb::iso_transfer;
use common::{DeviceCandidate, IsoHandler, IsoRequest, UsbBackend, UsbHandle};
use protocol::{AltSetting, ConfigTree, EndpointInfo, InterfaceTree, TransferKind, UsbError};
use rusb::ffi::{self, constants::*};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::ffi::{c_int, c_uint};
use std::time::Duration;
use tracing::debug;

/// Explicit libusb context shared by discovery, transfers and the event loop
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    /// Initialize libusb
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl UsbBackend for RusbBackend {
    type Device = Device<Context>;
    type Handle = RusbHandle;

    fn devices(&self) -> Result<Vec<DeviceCandidate<Device<Context>>>, UsbError> {
        let list = self.context.devices().map_err(map_rusb_error)?;

        let mut candidates = Vec::with_capacity(list.len());
        for device in list.iter() {
            let descriptor = device.device_descriptor().map_err(map_rusb_error)?;
            candidates.push(DeviceCandidate {
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                bus_number: device.bus_number(),
                device_address: device.address(),
                device,
            });
        }
        Ok(candidates)
    }

    fn open(&self, candidate: &DeviceCandidate<Device<Context>>) -> Result<RusbHandle, UsbError> {
        let handle = candidate.device.open().map_err(map_rusb_error)?;
        debug!(
            "Opened device {:04x}:{:04x} at bus {} address {}",
            candidate.vendor_id,
            candidate.product_id,
            candidate.bus_number,
            candidate.device_address
        );
        Ok(RusbHandle { handle })
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError> {
        self.context
            .handle_events(Some(timeout))
            .map_err(map_rusb_error)
    }
}

/// Open rusb device handle, closed when dropped
pub struct RusbHandle {
    handle: DeviceHandle<Context>,
}

impl RusbHandle {
    /// Synchronous bulk transfer that keeps the byte count of timed out transfers
    ///
    /// `rusb::DeviceHandle::read_bulk` drops the partial count when a transfer
    /// times out, which would lose data when the timeout is used as a
    /// cancellation tick.
    fn bulk_transfer(
        &self,
        endpoint: u8,
        data: *mut u8,
        len: usize,
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let length = c_int::try_from(len).map_err(|_| UsbError::InvalidParam)?;
        let timeout_ms = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);
        let mut transferred: c_int = 0;

        // SAFETY: `data` points to `len` bytes owned by the caller for the
        // duration of this synchronous call, and the device handle is open.
        let rc = unsafe {
            ffi::libusb_bulk_transfer(
                self.handle.as_raw(),
                endpoint,
                data,
                length,
                &mut transferred,
                timeout_ms,
            )
        };

        match rc {
            0 => Ok(transferred.max(0) as usize),
            LIBUSB_ERROR_TIMEOUT | LIBUSB_ERROR_INTERRUPTED if transferred > 0 => {
                Ok(transferred as usize)
            }
            code => Err(map_libusb_code(code)),
        }
    }
}

impl UsbHandle for RusbHandle {
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.handle
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(map_rusb_error)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.bulk_transfer(endpoint, buf.as_mut_ptr(), buf.len(), timeout)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, UsbError> {
        // libusb never writes through the buffer of an OUT transfer
        self.bulk_transfer(endpoint, data.as_ptr() as *mut u8, data.len(), timeout)
    }

    fn active_configuration(&self) -> Result<ConfigTree, UsbError> {
        let config = self
            .handle
            .device()
            .active_config_descriptor()
            .map_err(map_rusb_error)?;
        Ok(config_tree(&config))
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, UsbError> {
        self.handle
            .kernel_driver_active(interface)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), UsbError> {
        self.handle
            .detach_kernel_driver(interface)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.handle
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        self.handle
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), UsbError> {
        self.handle
            .set_alternate_setting(interface, setting)
            .map_err(map_rusb_error)
    }

    fn submit_isochronous(
        &self,
        request: IsoRequest,
        handler: Box<dyn IsoHandler>,
    ) -> Result<(), UsbError> {
        iso_transfer::submit(self.handle.as_raw(), request, handler)
    }
}

/// Convert a rusb configuration descriptor into an owned tree
fn config_tree(config: &rusb::ConfigDescriptor) -> ConfigTree {
    let interfaces = config
        .interfaces()
        .map(|interface| InterfaceTree {
            number: interface.number(),
            alt_settings: interface
                .descriptors()
                .map(|alt| AltSetting {
                    setting: alt.setting_number(),
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                    protocol: alt.protocol_code(),
                    endpoints: alt
                        .endpoint_descriptors()
                        .map(|endpoint| EndpointInfo {
                            address: endpoint.address(),
                            transfer_kind: map_transfer_type(endpoint.transfer_type()),
                            max_packet_size: endpoint.max_packet_size(),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    ConfigTree { interfaces }
}

fn map_transfer_type(transfer_type: rusb::TransferType) -> TransferKind {
    match transfer_type {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}

/// Map rusb::Error to protocol::UsbError
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::Interrupted => UsbError::Interrupted,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other {
            message: err.to_string(),
        },
    }
}

/// Map a raw libusb return code to protocol::UsbError
pub fn map_libusb_code(code: c_int) -> UsbError {
    match code {
        LIBUSB_ERROR_TIMEOUT => UsbError::Timeout,
        LIBUSB_ERROR_PIPE => UsbError::Pipe,
        LIBUSB_ERROR_NO_DEVICE => UsbError::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => UsbError::NotFound,
        LIBUSB_ERROR_BUSY => UsbError::Busy,
        LIBUSB_ERROR_OVERFLOW => UsbError::Overflow,
        LIBUSB_ERROR_IO => UsbError::Io,
        LIBUSB_ERROR_INVALID_PARAM => UsbError::InvalidParam,
        LIBUSB_ERROR_ACCESS => UsbError::Access,
        LIBUSB_ERROR_INTERRUPTED => UsbError::Interrupted,
        LIBUSB_ERROR_NOT_SUPPORTED => UsbError::NotSupported,
        _ => UsbError::Other {
            message: format!("libusb error {}", code),
        },
    }
}
