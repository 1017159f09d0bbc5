//! Test utilities for usb-proxy
//!
//! Provides an in-memory [`MockProxy`] implementing the full
//! [`crate::UsbProxy`] contract plus helpers for building mock devices.
//! The mock validates requests the same way the real server does, so
//! protocol-level tests catch contract violations without hardware.

use crate::error::{ProxyError, Result};
use crate::proxy::UsbProxy;
use async_trait::async_trait;
use protocol::usb::{self, error_code, transfer_status, transfer_type, CONTROL_SETUP_SIZE};
use protocol::{Capabilities, DeviceDescriptor, DeviceId, DeviceSummary, TransferRequest,
    TransferResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Await a future, panicking if it takes longer than [`DEFAULT_TEST_TIMEOUT`].
pub async fn with_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, future)
        .await
        .expect("test timed out")
}

/// Build a device summary for testing.
pub fn mock_summary(id: u32, bus: u8, port: u8, address: u8) -> DeviceSummary {
    DeviceSummary {
        id: DeviceId(id),
        bus_number: bus,
        port_number: port,
        device_address: address,
    }
}

/// Build a sane full-speed device descriptor for testing.
pub fn mock_descriptor(id_vendor: u16, id_product: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        b_length: 18,
        b_descriptor_type: 1,
        bcd_usb: 0x0200,
        b_device_class: 0,
        b_device_sub_class: 0,
        b_device_protocol: 0,
        b_max_packet_size0: 64,
        id_vendor,
        id_product,
        bcd_device: 0x0100,
        i_manufacturer: 1,
        i_product: 2,
        i_serial_number: 3,
        b_num_configurations: 1,
    }
}

/// Build a minimal but well-formed configuration-descriptor blob: one
/// configuration, one interface, one bulk endpoint.
pub fn mock_config_blob() -> Vec<u8> {
    let blob = vec![
        // configuration descriptor, wTotalLength = 25
        9, 2, 25, 0, 1, 1, 0, 0x80, 50,
        // interface descriptor
        9, 4, 0, 0, 1, 0xff, 0, 0, 0,
        // endpoint descriptor (EP1 OUT, bulk)
        7, 5, 0x01, 2, 0x00, 0x02, 0,
    ];
    debug_assert_eq!(blob.len(), 25);
    blob
}

struct MockDeviceState {
    summary: DeviceSummary,
    descriptor: DeviceDescriptor,
    config_blob: Vec<u8>,
    open_count: usize,
    claimed: Vec<u8>,
    configuration: u8,
    kernel_driver_attached: bool,
}

/// In-memory proxy implementation for tests.
///
/// Devices are listed in insertion order. IN transfers complete with a
/// counting byte pattern, OUT transfers echo their payload back, both with
/// `actual_length` matching what a well-behaved device would report.
pub struct MockProxy {
    capabilities: Capabilities,
    devices: Mutex<Vec<MockDeviceState>>,
    hold_transfers: AtomicBool,
}

impl Default for MockProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProxy {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities {
                has_hid_access: true,
                supports_detach_kernel_driver: true,
            },
            devices: Mutex::new(Vec::new()),
            hold_transfers: AtomicBool::new(false),
        }
    }

    /// Build a mock with the given devices already present.
    pub fn with_devices(devices: Vec<(DeviceSummary, DeviceDescriptor)>) -> Self {
        let mock = Self::new();
        for (summary, descriptor) in devices {
            mock.add_device(summary, descriptor);
        }
        mock
    }

    pub fn add_device(&self, summary: DeviceSummary, descriptor: DeviceDescriptor) {
        self.devices
            .lock()
            .expect("mock state poisoned")
            .push(MockDeviceState {
                summary,
                descriptor,
                config_blob: mock_config_blob(),
                open_count: 0,
                claimed: Vec::new(),
                configuration: 1,
                kernel_driver_attached: false,
            });
    }

    /// Make every subsequent `submit_transfer` hang forever. Used to test
    /// connection loss while a transfer is in flight.
    pub fn hold_transfers(&self) {
        self.hold_transfers.store(true, Ordering::SeqCst);
    }

    /// Current open count of a device (test assertion helper).
    pub fn open_count(&self, device_id: DeviceId) -> usize {
        self.devices
            .lock()
            .expect("mock state poisoned")
            .iter()
            .find(|d| d.summary.id == device_id)
            .map(|d| d.open_count)
            .unwrap_or(0)
    }

    /// Interfaces currently claimed on a device (test assertion helper).
    pub fn claimed_interfaces(&self, device_id: DeviceId) -> Vec<u8> {
        self.devices
            .lock()
            .expect("mock state poisoned")
            .iter()
            .find(|d| d.summary.id == device_id)
            .map(|d| d.claimed.clone())
            .unwrap_or_default()
    }

    fn with_device<R>(
        &self,
        device_id: DeviceId,
        f: impl FnOnce(&mut MockDeviceState) -> Result<R>,
    ) -> Result<R> {
        let mut devices = self.devices.lock().expect("mock state poisoned");
        match devices.iter_mut().find(|d| d.summary.id == device_id) {
            Some(device) => f(device),
            None => Err(ProxyError::Usb(error_code::NO_DEVICE)),
        }
    }

    fn with_open_device<R>(
        &self,
        device_id: DeviceId,
        f: impl FnOnce(&mut MockDeviceState) -> Result<R>,
    ) -> Result<R> {
        self.with_device(device_id, |device| {
            if device.open_count == 0 {
                return Err(ProxyError::Usb(error_code::NO_DEVICE));
            }
            f(device)
        })
    }
}

#[async_trait]
impl UsbProxy for MockProxy {
    async fn get_capabilities(&self) -> Result<Capabilities> {
        Ok(self.capabilities)
    }

    async fn devices_list(&self) -> Result<Vec<DeviceSummary>> {
        Ok(self
            .devices
            .lock()
            .expect("mock state poisoned")
            .iter()
            .map(|d| d.summary)
            .collect())
    }

    async fn device_descriptor(&self, device_id: DeviceId) -> Result<DeviceDescriptor> {
        self.with_device(device_id, |d| Ok(d.descriptor))
    }

    async fn active_config_descriptor(&self, device_id: DeviceId) -> Result<Vec<u8>> {
        self.with_device(device_id, |d| Ok(d.config_blob.clone()))
    }

    async fn config_descriptor(&self, device_id: DeviceId, config_index: u8) -> Result<Vec<u8>> {
        self.with_device(device_id, |d| {
            if config_index >= d.descriptor.b_num_configurations {
                return Err(ProxyError::Usb(error_code::NOT_FOUND));
            }
            Ok(d.config_blob.clone())
        })
    }

    async fn get_configuration(&self, device_id: DeviceId) -> Result<u8> {
        self.with_open_device(device_id, |d| Ok(d.configuration))
    }

    async fn set_configuration(&self, device_id: DeviceId, config: i32) -> Result<()> {
        self.with_open_device(device_id, |d| {
            d.configuration = if config < 0 { 0 } else { config as u8 };
            Ok(())
        })
    }

    async fn claim_interface(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        self.with_open_device(device_id, |d| {
            if d.claimed.contains(&iface) {
                return Err(ProxyError::Usb(error_code::BUSY));
            }
            d.claimed.push(iface);
            Ok(())
        })
    }

    async fn release_interface(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        self.with_open_device(device_id, |d| {
            match d.claimed.iter().position(|&i| i == iface) {
                Some(pos) => {
                    d.claimed.remove(pos);
                    Ok(())
                }
                None => Err(ProxyError::Usb(error_code::NOT_FOUND)),
            }
        })
    }

    async fn set_interface_altsetting(
        &self,
        device_id: DeviceId,
        iface: u8,
        _altsetting: u8,
    ) -> Result<()> {
        self.with_open_device(device_id, |d| {
            if !d.claimed.contains(&iface) {
                return Err(ProxyError::Usb(error_code::NOT_FOUND));
            }
            Ok(())
        })
    }

    async fn clear_halt(&self, device_id: DeviceId, _endpoint: u8) -> Result<()> {
        self.with_open_device(device_id, |_| Ok(()))
    }

    async fn reset_device(&self, device_id: DeviceId) -> Result<()> {
        self.with_open_device(device_id, |d| {
            d.claimed.clear();
            Ok(())
        })
    }

    async fn kernel_driver_active(&self, device_id: DeviceId, _iface: u8) -> Result<bool> {
        self.with_open_device(device_id, |d| Ok(d.kernel_driver_attached))
    }

    async fn detach_kernel_driver(&self, device_id: DeviceId, _iface: u8) -> Result<()> {
        self.with_open_device(device_id, |d| {
            d.kernel_driver_attached = false;
            Ok(())
        })
    }

    async fn attach_kernel_driver(&self, device_id: DeviceId, _iface: u8) -> Result<()> {
        self.with_open_device(device_id, |d| {
            d.kernel_driver_attached = true;
            Ok(())
        })
    }

    async fn open_device(&self, device_id: DeviceId) -> Result<()> {
        self.with_device(device_id, |d| {
            d.open_count += 1;
            Ok(())
        })
    }

    async fn close_device(&self, device_id: DeviceId) -> Result<()> {
        self.with_device(device_id, |d| {
            if d.open_count == 0 {
                warn!("ignoring close, the device was not open");
                return Ok(());
            }
            d.open_count -= 1;
            Ok(())
        })
    }

    async fn submit_transfer(&self, request: TransferRequest) -> Result<TransferResult> {
        if self.hold_transfers.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        // Same validation order as the server: open state, type, buffer size.
        // Transfer failures speak transfer-status codes, not error codes.
        let open = self.with_device(request.device_id, |d| Ok(d.open_count > 0))?;
        if !open {
            return Err(ProxyError::Usb(transfer_status::NO_DEVICE));
        }

        match request.kind {
            transfer_type::CONTROL | transfer_type::BULK | transfer_type::INTERRUPT => {}
            _ => return Err(ProxyError::Usb(error_code::NOT_SUPPORTED)),
        }

        let is_in = usb::is_in(request.endpoint);
        let expected = usb::request_buffer_len(is_in, request.kind, request.length);
        if request.buffer.len() != expected || request.buffer.len() > request.length as usize {
            return Err(ProxyError::Usb(transfer_status::ERROR));
        }

        let is_control = request.kind == transfer_type::CONTROL;
        let length = request.length as usize;
        let (actual, data) = if is_in {
            let capacity = if is_control {
                length - CONTROL_SETUP_SIZE
            } else {
                length
            };
            let wanted = if is_control {
                let w_length =
                    u16::from_le_bytes([request.buffer[6], request.buffer[7]]) as usize;
                w_length.min(capacity)
            } else {
                capacity
            };
            let data: Vec<u8> = (0..wanted).map(|i| i as u8).collect();
            (wanted, data)
        } else if is_control {
            let skip = CONTROL_SETUP_SIZE.min(length);
            (length - skip, request.buffer[skip..].to_vec())
        } else {
            (length, request.buffer.clone())
        };

        Ok(TransferResult {
            status: transfer_status::COMPLETED,
            actual_length: actual as i32,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_device_mock() -> MockProxy {
        MockProxy::with_devices(vec![
            (mock_summary(42, 1, 2, 3), mock_descriptor(0x1d6b, 0x0001)),
            (mock_summary(43, 1, 2, 4), mock_descriptor(0x1d6b, 0x0002)),
            (mock_summary(44, 2, 1, 1), mock_descriptor(0x1d6b, 0x0003)),
        ])
    }

    #[tokio::test]
    async fn test_enumeration_order() {
        let mock = three_device_mock();
        let devices = mock.devices_list().await.unwrap();
        let ids: Vec<u32> = devices.iter().map(|d| d.id.0).collect();
        assert_eq!(ids, vec![42, 43, 44]);
    }

    #[tokio::test]
    async fn test_open_close_counting() {
        let mock = three_device_mock();
        let id = DeviceId(42);

        mock.open_device(id).await.unwrap();
        mock.open_device(id).await.unwrap();
        assert_eq!(mock.open_count(id), 2);

        mock.close_device(id).await.unwrap();
        mock.close_device(id).await.unwrap();
        assert_eq!(mock.open_count(id), 0);

        // Extra close is a warning, not an error.
        mock.close_device(id).await.unwrap();
        assert_eq!(mock.open_count(id), 0);
    }

    #[tokio::test]
    async fn test_requires_open() {
        let mock = three_device_mock();
        let err = mock.get_configuration(DeviceId(42)).await.unwrap_err();
        assert_eq!(err, ProxyError::Usb(error_code::NO_DEVICE));
    }

    #[tokio::test]
    async fn test_bulk_out_transfer() {
        let mock = three_device_mock();
        let id = DeviceId(42);
        mock.open_device(id).await.unwrap();

        let result = mock
            .submit_transfer(TransferRequest {
                device_id: id,
                timeout_ms: 1000,
                length: 4,
                endpoint: 0x02,
                kind: transfer_type::BULK,
                buffer: vec![0xde, 0xad, 0xbe, 0xef],
            })
            .await
            .unwrap();
        assert_eq!(result.status, transfer_status::COMPLETED);
        assert_eq!(result.actual_length, 4);
        assert_eq!(result.data.len(), result.actual_length as usize);
    }

    #[tokio::test]
    async fn test_control_in_transfer() {
        let mock = three_device_mock();
        let id = DeviceId(42);
        mock.open_device(id).await.unwrap();

        // GET_DESCRIPTOR(device), wLength = 18
        let setup = vec![0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let result = mock
            .submit_transfer(TransferRequest {
                device_id: id,
                timeout_ms: 1000,
                length: 26,
                endpoint: 0x80,
                kind: transfer_type::CONTROL,
                buffer: setup,
            })
            .await
            .unwrap();
        assert_eq!(result.status, transfer_status::COMPLETED);
        assert_eq!(result.actual_length, 18);
        assert_eq!(result.data.len(), 18);
    }

    #[tokio::test]
    async fn test_transfer_validation() {
        let mock = three_device_mock();
        let id = DeviceId(42);
        mock.open_device(id).await.unwrap();

        // Bulk OUT with a short buffer
        let err = mock
            .submit_transfer(TransferRequest {
                device_id: id,
                timeout_ms: 0,
                length: 8,
                endpoint: 0x02,
                kind: transfer_type::BULK,
                buffer: vec![1, 2],
            })
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::Usb(transfer_status::ERROR));

        // Isochronous is not supported
        let err = mock
            .submit_transfer(TransferRequest {
                device_id: id,
                timeout_ms: 0,
                length: 0,
                endpoint: 0x81,
                kind: transfer_type::ISOCHRONOUS,
                buffer: Vec::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::Usb(error_code::NOT_SUPPORTED));
    }
}
