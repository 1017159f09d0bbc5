//! Host-side proxy implementation
//!
//! Implements the proxy contract against the native USB library. Owns the
//! device table; every registered handler goes through here. Descriptor and
//! interface operations are short native calls issued inline; transfer
//! submission is handed to [`crate::transfers`] which suspends the handler
//! task until the device answers.

use crate::devices::{native_error_code, DeviceTable};
use crate::transfers;
use async_trait::async_trait;
use common::{ProxyError, Result, UsbProxy};
use protocol::usb::{error_code, transfer_status};
use protocol::{
    Capabilities, DeviceDescriptor, DeviceId, DeviceSummary, TransferRequest, TransferResult,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Timeout for the control reads fetching raw configuration descriptors.
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

const DT_CONFIG: u16 = 0x02;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

fn usb_err(err: rusb::Error) -> ProxyError {
    ProxyError::Usb(native_error_code(err))
}

fn version_bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor() & 0xf) << 4)
        | u16::from(version.sub_minor() & 0xf)
}

/// The server's half of the proxy contract.
pub struct HostProxy {
    context: Context,
    table: Mutex<DeviceTable>,
}

impl HostProxy {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            table: Mutex::new(DeviceTable::new()),
        }
    }

    /// Native device reference for `device_id`, regardless of open state.
    fn device(&self, device_id: DeviceId) -> Result<Device<Context>> {
        let mut table = self.table.lock().expect("device table poisoned");
        Ok(table.get_mut(device_id)?.device().clone())
    }

    /// Shared native handle for `device_id`; fails when not opened.
    fn open_handle(&self, device_id: DeviceId) -> Result<Arc<Mutex<DeviceHandle<Context>>>> {
        let mut table = self.table.lock().expect("device table poisoned");
        table.get_mut(device_id)?.handle()
    }

    /// Fetch the raw configuration-descriptor blob at `index` with a
    /// temporary handle. Failures degrade to an empty blob; the client
    /// treats the blob as opaque bytes either way.
    fn raw_config_descriptor(&self, device: &Device<Context>, index: u8) -> Vec<u8> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Standard,
            rusb::Recipient::Device,
        );
        let value = (DT_CONFIG << 8) | u16::from(index);

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(_) => return Vec::new(),
        };

        // The 9-byte configuration header carries wTotalLength; a second
        // read fetches the whole blob.
        let mut header = [0u8; 9];
        if handle
            .read_control(
                request_type,
                REQUEST_GET_DESCRIPTOR,
                value,
                0,
                &mut header,
                DESCRIPTOR_TIMEOUT,
            )
            .is_err()
        {
            return Vec::new();
        }

        let total_length = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut raw = vec![0u8; total_length];
        match handle.read_control(
            request_type,
            REQUEST_GET_DESCRIPTOR,
            value,
            0,
            &mut raw,
            DESCRIPTOR_TIMEOUT,
        ) {
            Ok(read) => {
                raw.truncate(read);
                raw
            }
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl UsbProxy for HostProxy {
    async fn get_capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities {
            has_hid_access: unsafe {
                rusb::ffi::libusb_has_capability(rusb::constants::LIBUSB_CAP_HAS_HID_ACCESS) != 0
            },
            supports_detach_kernel_driver: unsafe {
                rusb::ffi::libusb_has_capability(
                    rusb::constants::LIBUSB_CAP_SUPPORTS_DETACH_KERNEL_DRIVER,
                ) != 0
            },
        })
    }

    async fn devices_list(&self) -> Result<Vec<DeviceSummary>> {
        let list = match self.context.devices() {
            Ok(list) => list,
            Err(e) => {
                warn!("device enumeration failed: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut table = self.table.lock().expect("device table poisoned");
        let mut summaries = Vec::with_capacity(list.len());
        for device in list.iter() {
            let id = table.ensure_device(&device);
            summaries.push(DeviceSummary {
                id,
                bus_number: device.bus_number(),
                port_number: device.port_number(),
                device_address: device.address(),
            });
        }
        Ok(summaries)
    }

    async fn device_descriptor(&self, device_id: DeviceId) -> Result<DeviceDescriptor> {
        let device = self.device(device_id)?;
        let desc = device.device_descriptor().map_err(|e| {
            error!("cannot get device descriptor for device id {}", device_id);
            usb_err(e)
        })?;

        Ok(DeviceDescriptor {
            b_length: 18,
            b_descriptor_type: 1,
            bcd_usb: version_bcd(desc.usb_version()),
            b_device_class: desc.class_code(),
            b_device_sub_class: desc.sub_class_code(),
            b_device_protocol: desc.protocol_code(),
            b_max_packet_size0: desc.max_packet_size(),
            id_vendor: desc.vendor_id(),
            id_product: desc.product_id(),
            bcd_device: version_bcd(desc.device_version()),
            i_manufacturer: desc.manufacturer_string_index().unwrap_or(0),
            i_product: desc.product_string_index().unwrap_or(0),
            i_serial_number: desc.serial_number_string_index().unwrap_or(0),
            b_num_configurations: desc.num_configurations(),
        })
    }

    async fn active_config_descriptor(&self, device_id: DeviceId) -> Result<Vec<u8>> {
        let device = self.device(device_id)?;

        let active = device.active_config_descriptor().map_err(|e| {
            error!(
                "cannot get active config descriptor for device id {}",
                device_id
            );
            usb_err(e)
        })?;
        let config_value = active.number();

        // Resolve the active configuration value back to its index, then
        // fetch that index as a raw blob.
        let n_configs = self.device_descriptor(device_id).await?.b_num_configurations;
        for index in 0..n_configs {
            let Ok(config) = device.config_descriptor(index) else {
                continue;
            };
            if config.number() == config_value {
                return Ok(self.raw_config_descriptor(&device, index));
            }
        }

        Err(ProxyError::Usb(error_code::NOT_FOUND))
    }

    async fn config_descriptor(&self, device_id: DeviceId, config_index: u8) -> Result<Vec<u8>> {
        let device = self.device(device_id)?;

        device.config_descriptor(config_index).map_err(|e| {
            error!(
                "cannot get config descriptor {} for device id {}",
                config_index, device_id
            );
            usb_err(e)
        })?;

        Ok(self.raw_config_descriptor(&device, config_index))
    }

    async fn get_configuration(&self, device_id: DeviceId) -> Result<u8> {
        let handle = self.open_handle(device_id)?;
        let config = handle
            .lock()
            .expect("device handle poisoned")
            .active_configuration()
            .map_err(|e| {
                error!("failed to get configuration for device id {}", device_id);
                usb_err(e)
            })?;
        Ok(config)
    }

    async fn set_configuration(&self, device_id: DeviceId, config: i32) -> Result<()> {
        let handle = self.open_handle(device_id)?;
        let mut handle = handle.lock().expect("device handle poisoned");
        let result = if config < 0 {
            handle.unconfigure()
        } else {
            handle.set_active_configuration(config as u8)
        };
        result.map_err(|e| {
            error!("failed to set configuration for device id {}", device_id);
            usb_err(e)
        })
    }

    async fn claim_interface(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        let handle = self.open_handle(device_id)?;
        let result = handle
            .lock()
            .expect("device handle poisoned")
            .claim_interface(iface);
        result.map_err(|e| {
            error!(
                "failed to claim interface {} for device id {}",
                iface, device_id
            );
            usb_err(e)
        })
    }

    async fn release_interface(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        let handle = self.open_handle(device_id)?;
        let result = handle
            .lock()
            .expect("device handle poisoned")
            .release_interface(iface);
        result.map_err(|e| {
            error!(
                "failed to release interface {} for device id {}",
                iface, device_id
            );
            usb_err(e)
        })
    }

    async fn set_interface_altsetting(
        &self,
        device_id: DeviceId,
        iface: u8,
        altsetting: u8,
    ) -> Result<()> {
        let handle = self.open_handle(device_id)?;
        let result = handle
            .lock()
            .expect("device handle poisoned")
            .set_alternate_setting(iface, altsetting);
        result.map_err(|e| {
            error!(
                "failed to set interface {} altsetting {} for device id {}",
                iface, altsetting, device_id
            );
            usb_err(e)
        })
    }

    async fn clear_halt(&self, device_id: DeviceId, endpoint: u8) -> Result<()> {
        let handle = self.open_handle(device_id)?;
        let result = handle
            .lock()
            .expect("device handle poisoned")
            .clear_halt(endpoint);
        result.map_err(|e| {
            error!(
                "failed to clear halt on endpoint {} for device id {}",
                endpoint, device_id
            );
            usb_err(e)
        })
    }

    async fn reset_device(&self, device_id: DeviceId) -> Result<()> {
        let handle = self.open_handle(device_id)?;
        let result = handle.lock().expect("device handle poisoned").reset();
        result.map_err(|e| {
            error!("failed to reset device id {}", device_id);
            usb_err(e)
        })
    }

    async fn kernel_driver_active(&self, device_id: DeviceId, iface: u8) -> Result<bool> {
        let handle = self.open_handle(device_id)?;
        let active = handle
            .lock()
            .expect("device handle poisoned")
            .kernel_driver_active(iface)
            .map_err(|e| {
                error!(
                    "failed to query kernel driver on interface {} for device id {}",
                    iface, device_id
                );
                usb_err(e)
            })?;
        Ok(active)
    }

    async fn detach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        let handle = self.open_handle(device_id)?;
        let result = handle
            .lock()
            .expect("device handle poisoned")
            .detach_kernel_driver(iface);
        result.map_err(|e| {
            error!(
                "failed to detach kernel driver from interface {} for device id {}",
                iface, device_id
            );
            usb_err(e)
        })
    }

    async fn attach_kernel_driver(&self, device_id: DeviceId, iface: u8) -> Result<()> {
        let handle = self.open_handle(device_id)?;
        let result = handle
            .lock()
            .expect("device handle poisoned")
            .attach_kernel_driver(iface);
        result.map_err(|e| {
            error!(
                "failed to attach kernel driver to interface {} for device id {}",
                iface, device_id
            );
            usb_err(e)
        })
    }

    async fn open_device(&self, device_id: DeviceId) -> Result<()> {
        let mut table = self.table.lock().expect("device table poisoned");
        table.get_mut(device_id)?.open()
    }

    async fn close_device(&self, device_id: DeviceId) -> Result<()> {
        let mut table = self.table.lock().expect("device table poisoned");
        table.get_mut(device_id)?.close();
        Ok(())
    }

    async fn submit_transfer(&self, request: TransferRequest) -> Result<TransferResult> {
        let handle = {
            let mut table = self.table.lock().expect("device table poisoned");
            let record = table.get_mut(request.device_id)?;
            if record.open_count() == 0 {
                error!("device id {} has not been opened", request.device_id);
                // Transfer failures speak transfer-status codes.
                return Err(ProxyError::Usb(transfer_status::NO_DEVICE));
            }
            record.handle()?
        };

        debug!(
            "submit transfer: endp={:#04x}, length={}",
            request.endpoint, request.length
        );
        transfers::submit(handle, request).await
    }
}
