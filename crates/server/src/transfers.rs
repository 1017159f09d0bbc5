//! Asynchronous USB transfer submission
//!
//! Bridges libusb's callback-driven transfer completion to the async
//! dispatcher. The completion callback runs on the event-pump thread and
//! does exactly one thing: consume the one-shot sender parked in the
//! transfer's `user_data` and fire it. The submitting task owns the native
//! transfer object and its buffer for the whole flight and only reads the
//! results after it has observed the completion signal, so no USB state is
//! ever touched from two threads at once.

use common::{ProxyError, Result};
use protocol::usb::{self, transfer_status, transfer_type, CONTROL_SETUP_SIZE};
use protocol::{TransferRequest, TransferResult};
use rusb::ffi;
use rusb::{Context, DeviceHandle};
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// Owner of one in-flight native transfer.
///
/// `buffer` backs the transfer's data pointer and must not move or drop
/// while the native library holds the transfer, which is from submission
/// until the completion callback has fired.
struct NativeTransfer {
    raw: *mut ffi::libusb_transfer,
    buffer: Vec<u8>,
    completed: bool,
}

// The raw transfer is only touched from the owning task; the callback limits
// itself to the sender parked in user_data.
unsafe impl Send for NativeTransfer {}

impl Drop for NativeTransfer {
    fn drop(&mut self) {
        if self.completed {
            unsafe { ffi::libusb_free_transfer(self.raw) };
        } else {
            // Dropped mid-flight (runtime teardown): the native library may
            // still write into the buffer, so leak it instead of dangling.
            unsafe { ffi::libusb_cancel_transfer(self.raw) };
            let buffer = std::mem::take(&mut self.buffer);
            std::mem::forget(buffer);
        }
    }
}

extern "system" fn transfer_done(transfer: *mut ffi::libusb_transfer) {
    // Runs on the event-pump thread: signal and get out.
    let sender =
        unsafe { Box::from_raw((*transfer).user_data as *mut oneshot::Sender<()>) };
    let _ = sender.send(());
}

/// Check the transfer type and buffer length of a request.
///
/// Host-to-device transfers must carry exactly `length` bytes, device-to-host
/// control transfers exactly the 8-byte setup packet, device-to-host
/// bulk/interrupt transfers nothing. Only control, bulk and interrupt types
/// are accepted.
pub fn validate_request(request: &TransferRequest) -> Result<()> {
    match request.kind {
        transfer_type::CONTROL | transfer_type::BULK | transfer_type::INTERRUPT => {}
        _ => return Err(ProxyError::Usb(protocol::usb::error_code::NOT_SUPPORTED)),
    }

    let is_in = usb::is_in(request.endpoint);
    let expected = usb::request_buffer_len(is_in, request.kind, request.length);
    if request.buffer.len() != expected || request.buffer.len() > request.length as usize {
        debug!("transfer packet has the wrong size");
        return Err(ProxyError::Usb(transfer_status::ERROR));
    }
    Ok(())
}

/// Validate, submit and await one transfer on an opened device.
pub async fn submit(
    handle: Arc<Mutex<DeviceHandle<Context>>>,
    request: TransferRequest,
) -> Result<TransferResult> {
    validate_request(&request)?;
    let is_in = usb::is_in(request.endpoint);

    let length = request.length as usize;
    let mut buffer = vec![0u8; length];
    buffer[..request.buffer.len()].copy_from_slice(&request.buffer);

    let raw = unsafe { ffi::libusb_alloc_transfer(0) };
    if raw.is_null() {
        return Err(ProxyError::Usb(transfer_status::ERROR));
    }
    let mut native = NativeTransfer {
        raw,
        buffer,
        completed: false,
    };

    let (sender, completed) = oneshot::channel::<()>();
    let user_data = Box::into_raw(Box::new(sender)) as *mut c_void;
    let handle_ptr = handle.lock().expect("device handle poisoned").as_raw();

    unsafe {
        (*raw).dev_handle = handle_ptr;
        (*raw).flags = 0;
        (*raw).endpoint = request.endpoint;
        (*raw).transfer_type = request.kind;
        (*raw).timeout = request.timeout_ms as c_uint;
        (*raw).length = length as c_int;
        (*raw).buffer = native.buffer.as_mut_ptr();
        (*raw).num_iso_packets = 0;
        (*raw).callback = transfer_done;
        (*raw).user_data = user_data;
    }

    let rc = unsafe { ffi::libusb_submit_transfer(raw) };
    if rc < 0 {
        // Reclaim the sender the callback will never see.
        drop(unsafe { Box::from_raw(user_data as *mut oneshot::Sender<()>) });
        native.completed = true;
        debug!("transfer submission failed: {rc}");
        return Err(ProxyError::Usb(transfer_status::ERROR));
    }

    debug!("transfer submitted, waiting for completion");
    if completed.await.is_err() {
        // The callback dropped the sender without firing, which the native
        // library does not do; treat it as a failed transfer.
        native.completed = true;
        return Err(ProxyError::Usb(transfer_status::ERROR));
    }
    native.completed = true;

    // Access goes through `native` here: the bare pointer must not live
    // across the await or the handler future stops being Send.
    let status = unsafe { (*native.raw).status } as i32;
    let actual = unsafe { (*native.raw).actual_length }.max(0) as usize;

    let skip = if request.kind == transfer_type::CONTROL {
        CONTROL_SETUP_SIZE
    } else {
        0
    };
    let start = skip.min(native.buffer.len());
    let end = (skip + actual).min(native.buffer.len());
    let data = native.buffer[start..end].to_vec();

    debug!(
        "transfer completed with status {}, actual_length={} ({})",
        status,
        actual,
        if is_in { "IN" } else { "OUT" }
    );

    // Keep the shared handle alive until after completion has been observed.
    drop(handle);

    Ok(TransferResult {
        status,
        actual_length: data.len() as i32,
        data,
    })
}
