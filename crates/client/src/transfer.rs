//! Transfer buffer assembly and completion handling

use crate::backend::{Transfer, TransferStatus};
use protocol::usb::{self, transfer_type, CONTROL_SETUP_SIZE, ENDPOINT_DIR_MASK};
use protocol::TransferResult;
use tracing::{debug, error};

/// Direction of a transfer. Control transfers carry their direction in the
/// setup packet's bmRequestType; everything else uses the endpoint address.
pub(crate) fn transfer_is_in(transfer: &Transfer) -> bool {
    if transfer.kind == transfer_type::CONTROL {
        transfer
            .buffer
            .first()
            .is_some_and(|request_type| request_type & ENDPOINT_DIR_MASK != 0)
    } else {
        usb::is_in(transfer.endpoint)
    }
}

/// Assemble the bytes that travel with the request: the full buffer for
/// host-to-device, the setup packet for device-to-host control, nothing for
/// device-to-host bulk/interrupt.
pub(crate) fn outbound_buffer(transfer: &Transfer, is_in: bool) -> Vec<u8> {
    let len = usb::request_buffer_len(is_in, transfer.kind, transfer.buffer.len() as u32);
    transfer.buffer[..len].to_vec()
}

/// Copy a transfer result back into the caller's buffer and fields.
///
/// Payload bytes land behind the setup packet for control transfers. A
/// result that would not fit in the caller's buffer is clamped to
/// `Overflow` without writing anything.
pub(crate) fn apply_completion(transfer: &mut Transfer, result: TransferResult) {
    debug!("handle transfer completion: status={}", result.status);

    let skip = if transfer.kind == transfer_type::CONTROL {
        CONTROL_SETUP_SIZE
    } else {
        0
    };

    let actual = result.actual_length.max(0) as usize;
    if actual + skip > transfer.buffer.len() {
        error!("got more data back than expected");
        transfer.status = TransferStatus::Overflow;
        return;
    }

    let copied = actual.min(result.data.len());
    transfer.buffer[skip..skip + copied].copy_from_slice(&result.data[..copied]);
    transfer.transferred = copied;
    transfer.status = TransferStatus::from_code(result.status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::usb::transfer_status;
    use protocol::DeviceId;

    #[test]
    fn test_control_direction_comes_from_setup() {
        let inbound = Transfer::control(DeviceId(1), 0x80, 0x06, 0x0100, 0, 18, 1000);
        assert!(transfer_is_in(&inbound));

        let outbound = Transfer::control(DeviceId(1), 0x00, 0x09, 1, 0, 0, 1000);
        assert!(!transfer_is_in(&outbound));
    }

    #[test]
    fn test_bulk_direction_comes_from_endpoint() {
        let inbound = Transfer::bulk_in(DeviceId(1), 0x01, 64, 1000);
        assert!(transfer_is_in(&inbound));

        let outbound = Transfer::bulk_out(DeviceId(1), 0x02, vec![1, 2], 1000);
        assert!(!transfer_is_in(&outbound));
    }

    #[test]
    fn test_outbound_buffer_assembly() {
        let control_in = Transfer::control(DeviceId(1), 0x80, 0x06, 0x0100, 0, 18, 1000);
        let buffer = outbound_buffer(&control_in, true);
        assert_eq!(buffer.len(), CONTROL_SETUP_SIZE);
        assert_eq!(buffer[0], 0x80);

        let bulk_out = Transfer::bulk_out(DeviceId(1), 0x02, vec![0xde, 0xad], 1000);
        assert_eq!(outbound_buffer(&bulk_out, false), vec![0xde, 0xad]);

        let bulk_in = Transfer::bulk_in(DeviceId(1), 0x01, 64, 1000);
        assert!(outbound_buffer(&bulk_in, true).is_empty());
    }

    #[test]
    fn test_completion_copies_behind_setup() {
        let mut transfer = Transfer::control(DeviceId(1), 0x80, 0x06, 0x0100, 0, 18, 1000);
        apply_completion(
            &mut transfer,
            TransferResult {
                status: transfer_status::COMPLETED,
                actual_length: 18,
                data: (0u8..18).collect(),
            },
        );
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert_eq!(transfer.transferred, 18);
        // Setup packet is untouched, payload starts behind it.
        assert_eq!(transfer.buffer[0], 0x80);
        assert_eq!(&transfer.buffer[8..12], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_completion_overflow_clamped() {
        let mut transfer = Transfer::control(DeviceId(1), 0x80, 0x06, 0x0100, 0, 4, 1000);
        let before = transfer.buffer.clone();
        apply_completion(
            &mut transfer,
            TransferResult {
                status: transfer_status::COMPLETED,
                actual_length: 16,
                data: (0u8..16).collect(),
            },
        );
        assert_eq!(transfer.status, TransferStatus::Overflow);
        assert_eq!(transfer.transferred, 0);
        // Nothing was written past or into the caller's buffer.
        assert_eq!(transfer.buffer, before);
    }

    #[test]
    fn test_completion_maps_status() {
        let mut transfer = Transfer::bulk_in(DeviceId(1), 0x01, 8, 1000);
        apply_completion(
            &mut transfer,
            TransferResult {
                status: transfer_status::TIMED_OUT,
                actual_length: 0,
                data: Vec::new(),
            },
        );
        assert_eq!(transfer.status, TransferStatus::TimedOut);
        assert_eq!(transfer.transferred, 0);
    }
}
