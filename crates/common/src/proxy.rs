//! The proxy contract
//!
//! Every operation of the remote-USB protocol collapses into this one trait.
//! The server implements it against the native USB library, the client
//! implements it by forwarding each call over RPC, and the mock in
//! [`crate::test_utils`] implements it in memory so both halves can be
//! exercised without hardware or a socket.

use crate::error::Result;
use async_trait::async_trait;
use protocol::{Capabilities, DeviceDescriptor, DeviceId, DeviceSummary, TransferRequest,
    TransferResult};

/// Remote-USB operations, one method per wire call.
///
/// All methods that operate on an opened device fail with the native
/// no-device code when the device has not been opened. `submit_transfer` is
/// the only long-running method: it suspends until the underlying USB
/// transfer completes.
#[async_trait]
pub trait UsbProxy: Send + Sync {
    async fn get_capabilities(&self) -> Result<Capabilities>;

    /// Enumerate devices, refreshing the server's device table.
    async fn devices_list(&self) -> Result<Vec<DeviceSummary>>;

    async fn device_descriptor(&self, device_id: DeviceId) -> Result<DeviceDescriptor>;

    /// Raw configuration-descriptor blob of the active configuration.
    async fn active_config_descriptor(&self, device_id: DeviceId) -> Result<Vec<u8>>;

    /// Raw configuration-descriptor blob by index.
    async fn config_descriptor(&self, device_id: DeviceId, config_index: u8) -> Result<Vec<u8>>;

    async fn get_configuration(&self, device_id: DeviceId) -> Result<u8>;

    /// Select a configuration; a negative value deconfigures the device.
    async fn set_configuration(&self, device_id: DeviceId, config: i32) -> Result<()>;

    async fn claim_interface(&self, device_id: DeviceId, iface: u8) -> Result<()>;

    async fn release_interface(&self, device_id: DeviceId, iface: u8) -> Result<()>;

    async fn set_interface_altsetting(
        &self,
        device_id: DeviceId,
        iface: u8,
        altsetting: u8,
    ) -> Result<()>;

    async fn clear_halt(&self, device_id: DeviceId, endpoint: u8) -> Result<()>;

    async fn reset_device(&self, device_id: DeviceId) -> Result<()>;

    async fn kernel_driver_active(&self, device_id: DeviceId, iface: u8) -> Result<bool>;

    async fn detach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<()>;

    async fn attach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<()>;

    /// Open the device, incrementing its open count.
    async fn open_device(&self, device_id: DeviceId) -> Result<()>;

    /// Close the device, decrementing its open count. Closing a device that
    /// is not open logs a warning and succeeds.
    async fn close_device(&self, device_id: DeviceId) -> Result<()>;

    /// Submit a transfer and suspend until it completes.
    async fn submit_transfer(&self, request: TransferRequest) -> Result<TransferResult>;
}
