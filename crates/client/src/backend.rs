//! The host backend contract
//!
//! The host USB library drives its platform plugin through a fixed set of
//! entry points; this module is the Rust rendering of that function table.
//! Entry points are synchronous and report integer status codes following
//! the native libusb convention (`0` success, negative `libusb_error`
//! values otherwise, see [`protocol::usb::error_code`]).
//!
//! Transfer completion is signalled out-of-band: when a submitted transfer
//! finishes, its token is pushed into the [`CompletionSink`] the host
//! supplied at construction, and the host then calls
//! [`UsbBackend::handle_transfer_completion`] to collect the outcome.

use protocol::usb::{transfer_status, CONTROL_SETUP_SIZE};
use protocol::{Capabilities, DeviceId};

use crate::device::DiscoveredDevice;

/// Identifies one submitted transfer until its completion is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken(pub u64);

/// Channel the backend signals completed transfers on. The host end is
/// synchronous, so a std channel is used; sends never block.
pub type CompletionSink = std::sync::mpsc::Sender<TransferToken>;

/// Integer status entry points report, following the libusb convention.
pub type Status = i32;

/// Host-side view of one USB transfer.
///
/// `buffer` is the caller's transfer buffer: for control transfers the
/// 8-byte setup packet followed by the data area, for everything else just
/// the data. `transferred` and `status` are filled in by
/// [`UsbBackend::handle_transfer_completion`].
#[derive(Debug)]
pub struct Transfer {
    pub device_id: DeviceId,
    /// Endpoint address; bit 7 carries the direction for non-control types.
    pub endpoint: u8,
    /// Transfer type code, see [`protocol::usb::transfer_type`].
    pub kind: u8,
    pub timeout_ms: u32,
    pub buffer: Vec<u8>,
    pub transferred: usize,
    pub status: TransferStatus,
    pub(crate) token: Option<TransferToken>,
}

impl Transfer {
    pub fn new(device_id: DeviceId, endpoint: u8, kind: u8, timeout_ms: u32, buffer: Vec<u8>) -> Self {
        Self {
            device_id,
            endpoint,
            kind,
            timeout_ms,
            buffer,
            transferred: 0,
            status: TransferStatus::Completed,
            token: None,
        }
    }

    /// Token of the in-flight submission, if any. The host matches tokens
    /// arriving on the completion sink back to their transfers with this.
    pub fn token(&self) -> Option<TransferToken> {
        self.token
    }

    /// Build a control transfer from its setup fields, with `w_length`
    /// bytes of data area behind the setup packet.
    pub fn control(
        device_id: DeviceId,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        w_length: u16,
        timeout_ms: u32,
    ) -> Self {
        let mut buffer = vec![0u8; CONTROL_SETUP_SIZE + w_length as usize];
        buffer[0] = bm_request_type;
        buffer[1] = b_request;
        buffer[2..4].copy_from_slice(&w_value.to_le_bytes());
        buffer[4..6].copy_from_slice(&w_index.to_le_bytes());
        buffer[6..8].copy_from_slice(&w_length.to_le_bytes());
        Self::new(device_id, 0, protocol::usb::transfer_type::CONTROL, timeout_ms, buffer)
    }

    /// Build a bulk OUT transfer carrying `data`.
    pub fn bulk_out(device_id: DeviceId, endpoint: u8, data: Vec<u8>, timeout_ms: u32) -> Self {
        Self::new(
            device_id,
            endpoint & !protocol::usb::ENDPOINT_DIR_MASK,
            protocol::usb::transfer_type::BULK,
            timeout_ms,
            data,
        )
    }

    /// Build a bulk IN transfer for `length` bytes.
    pub fn bulk_in(device_id: DeviceId, endpoint: u8, length: usize, timeout_ms: u32) -> Self {
        Self::new(
            device_id,
            endpoint | protocol::usb::ENDPOINT_IN,
            protocol::usb::transfer_type::BULK,
            timeout_ms,
            vec![0u8; length],
        )
    }
}

/// Host-side transfer status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    /// Map a wire status code onto the host enumeration. Unknown codes
    /// collapse to `Error`.
    pub fn from_code(code: i32) -> Self {
        match code {
            transfer_status::COMPLETED => TransferStatus::Completed,
            transfer_status::TIMED_OUT => TransferStatus::TimedOut,
            transfer_status::CANCELLED => TransferStatus::Cancelled,
            transfer_status::STALL => TransferStatus::Stall,
            transfer_status::NO_DEVICE => TransferStatus::NoDevice,
            transfer_status::OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

/// The backend function table a host USB library expects.
///
/// Construction plays the role of `init` (capability probing included) and
/// `Drop` the role of `exit`.
pub trait UsbBackend: Send + Sync {
    /// Capabilities probed from the server at init.
    fn capabilities(&self) -> Capabilities;

    /// Enumerate remote devices, reusing already-known records.
    fn get_device_list(&self) -> Result<Vec<DiscoveredDevice>, Status>;

    fn open(&self, device_id: DeviceId) -> Result<(), Status>;

    /// Close never fails towards the host; remote errors are logged.
    fn close(&self, device_id: DeviceId);

    /// Copy the active configuration descriptor into `buf`, returning the
    /// copied length (at most `buf.len()`).
    fn get_active_config_descriptor(
        &self,
        device_id: DeviceId,
        buf: &mut [u8],
    ) -> Result<usize, Status>;

    /// Copy the configuration descriptor at `index` into `buf`, returning
    /// the copied length.
    fn get_config_descriptor(
        &self,
        device_id: DeviceId,
        index: u8,
        buf: &mut [u8],
    ) -> Result<usize, Status>;

    fn get_configuration(&self, device_id: DeviceId) -> Result<u8, Status>;

    fn set_configuration(&self, device_id: DeviceId, config: i32) -> Result<(), Status>;

    fn claim_interface(&self, device_id: DeviceId, iface: u8) -> Result<(), Status>;

    fn release_interface(&self, device_id: DeviceId, iface: u8) -> Result<(), Status>;

    fn set_interface_altsetting(
        &self,
        device_id: DeviceId,
        iface: u8,
        altsetting: u8,
    ) -> Result<(), Status>;

    fn clear_halt(&self, device_id: DeviceId, endpoint: u8) -> Result<(), Status>;

    fn reset_device(&self, device_id: DeviceId) -> Result<(), Status>;

    fn kernel_driver_active(&self, device_id: DeviceId, iface: u8) -> Result<bool, Status>;

    fn detach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<(), Status>;

    fn attach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<(), Status>;

    /// Submit a transfer and return immediately; completion arrives through
    /// the [`CompletionSink`].
    fn submit_transfer(&self, transfer: &mut Transfer) -> Result<(), Status>;

    /// Cancellation is not supported by the wire protocol; the entry point
    /// reports success and the eventual result is discarded.
    fn cancel_transfer(&self, transfer: &mut Transfer) -> Result<(), Status>;

    /// Collect the outcome of a completed transfer into the caller's buffer
    /// and status fields.
    fn handle_transfer_completion(&self, transfer: &mut Transfer);
}
