//! Asynchronous isochronous IN transfers on top of raw libusb
//!
//! rusb only exposes synchronous transfers, so the isochronous capture path
//! allocates and submits `libusb_transfer`s itself. Completions are dispatched
//! from `libusb_handle_events` on whichever thread drives the context.

use crate::usb::backend::map_libusb_code;
use common::{IsoAction, IsoCompletion, IsoHandler, IsoPacket, IsoRequest};
use protocol::{TransferStatus, UsbError};
use rusb::ffi::{self, constants::*};
use std::ffi::{c_int, c_uint, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use tracing::error;

/// State owned by one in-flight transfer, reachable through `user_data`
struct IsoState {
    handler: Box<dyn IsoHandler>,
    buffer: Vec<u8>,
    request: IsoRequest,
}

/// Allocate, fill and submit one isochronous transfer
pub(crate) fn submit(
    dev_handle: *mut ffi::libusb_device_handle,
    request: IsoRequest,
    handler: Box<dyn IsoHandler>,
) -> Result<(), UsbError> {
    let packets = c_int::try_from(request.packets).map_err(|_| UsbError::InvalidParam)?;
    let packet_size = c_uint::try_from(request.packet_size).map_err(|_| UsbError::InvalidParam)?;
    let length = c_int::try_from(request.buffer_len()).map_err(|_| UsbError::InvalidParam)?;
    let timeout = c_uint::try_from(request.timeout.as_millis()).unwrap_or(c_uint::MAX);

    // SAFETY: plain allocation, checked for NULL below
    let transfer = unsafe { ffi::libusb_alloc_transfer(packets) };
    if transfer.is_null() {
        return Err(UsbError::Other {
            message: "libusb_alloc_transfer returned NULL".to_string(),
        });
    }

    let mut state = Box::new(IsoState {
        handler,
        buffer: vec![0u8; request.buffer_len()],
        request,
    });
    let buffer = state.buffer.as_mut_ptr();
    let user_data = Box::into_raw(state).cast::<c_void>();

    // SAFETY: `transfer` was allocated above with room for `packets`
    // descriptors. The buffer lives inside the boxed state, which is only
    // reclaimed once the transfer is freed.
    unsafe {
        (*transfer).dev_handle = dev_handle;
        (*transfer).flags = 0;
        (*transfer).endpoint = request.endpoint;
        (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
        (*transfer).timeout = timeout;
        (*transfer).buffer = buffer;
        (*transfer).length = length;
        (*transfer).num_iso_packets = packets;
        (*transfer).callback = iso_callback;
        (*transfer).user_data = user_data;

        let descriptors = packet_descriptors(transfer);
        for descriptor in descriptors.iter_mut() {
            descriptor.length = packet_size;
        }

        let rc = ffi::libusb_submit_transfer(transfer);
        if rc != 0 {
            drop(Box::from_raw(user_data.cast::<IsoState>()));
            ffi::libusb_free_transfer(transfer);
            return Err(map_libusb_code(rc));
        }
    }

    Ok(())
}

/// Packet descriptor array trailing the transfer struct
///
/// # Safety
/// `transfer` must point to a live transfer allocated with at least
/// `num_iso_packets` descriptors.
unsafe fn packet_descriptors<'a>(
    transfer: *mut ffi::libusb_transfer,
) -> &'a mut [ffi::libusb_iso_packet_descriptor] {
    unsafe {
        let count = (*transfer).num_iso_packets.max(0) as usize;
        let first = ptr::addr_of_mut!((*transfer).iso_packet_desc)
            .cast::<ffi::libusb_iso_packet_descriptor>();
        std::slice::from_raw_parts_mut(first, count)
    }
}

fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

extern "system" fn iso_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb hands back the transfer submitted in `submit`, whose
    // user_data is a leaked `Box<IsoState>` and whose buffer is owned by it.
    unsafe {
        let state = &mut *(*transfer).user_data.cast::<IsoState>();
        let packet_size = state.request.packet_size;
        let status = map_transfer_status((*transfer).status);

        let descriptors = packet_descriptors(transfer);
        let packets: Vec<IsoPacket<'_>> = descriptors
            .iter()
            .enumerate()
            .map(|(i, descriptor)| {
                let offset = i * packet_size;
                let len = (descriptor.actual_length as usize).min(packet_size);
                IsoPacket {
                    status: map_transfer_status(descriptor.status),
                    data: &state.buffer[offset..offset + len],
                }
            })
            .collect();

        let completion = IsoCompletion {
            status,
            packets: &packets,
        };
        let handler = &mut state.handler;
        let action = match catch_unwind(AssertUnwindSafe(|| handler.on_complete(&completion))) {
            Ok(action) => action,
            Err(_) => {
                error!("Isochronous completion handler panicked");
                IsoAction::Stop
            }
        };
        drop(packets);

        let result = match action {
            IsoAction::Resubmit => {
                let rc = ffi::libusb_submit_transfer(transfer);
                if rc == 0 {
                    return;
                }
                Err(map_libusb_code(rc))
            }
            IsoAction::Stop => Ok(()),
        };

        let mut state = Box::from_raw((*transfer).user_data.cast::<IsoState>());
        ffi::libusb_free_transfer(transfer);
        let handler = &mut state.handler;
        if catch_unwind(AssertUnwindSafe(|| handler.on_retired(result))).is_err() {
            error!("Isochronous retire handler panicked");
        }
    }
}
