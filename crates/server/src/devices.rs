//! Device table
//!
//! Process-wide mapping from server-assigned 32-bit identifiers to local
//! device records. Identifiers start at an arbitrary non-zero seed and grow
//! monotonically; an id handed out once is never reissued to a different
//! physical device while the server lives. Devices that disappear from the
//! bus stay in the table; any further operation on them fails with the
//! native no-device error when the USB library refuses to talk to them.

use common::{ProxyError, Result};
use protocol::usb::error_code;
use protocol::DeviceId;
use rusb::{Context, Device, DeviceHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// First identifier handed out by a fresh table.
const FIRST_DEVICE_ID: u32 = 42;

/// One tracked physical device.
///
/// Invariant: `handle.is_some()` exactly when `open_count > 0`. The handle
/// is shared behind an `Arc` so an in-flight transfer keeps the native
/// handle alive even if the device is closed underneath it; the native close
/// happens when the last clone drops.
#[derive(Debug)]
pub struct LocalDevice {
    id: DeviceId,
    device: Device<Context>,
    open_count: usize,
    handle: Option<Arc<Mutex<DeviceHandle<Context>>>>,
}

impl LocalDevice {
    fn new(id: DeviceId, device: Device<Context>) -> Self {
        info!(
            "new device dev_id={}, bus={}, port={}, addr={}",
            id,
            device.bus_number(),
            device.port_number(),
            device.address()
        );
        Self {
            id,
            device,
            open_count: 0,
            handle: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn device(&self) -> &Device<Context> {
        &self.device
    }

    /// The shared native handle; fails when the device is not open.
    pub fn handle(&self) -> Result<Arc<Mutex<DeviceHandle<Context>>>> {
        self.handle.clone().ok_or_else(|| {
            error!("device id {} has not been opened", self.id);
            ProxyError::Usb(error_code::NO_DEVICE)
        })
    }

    pub fn open_count(&self) -> usize {
        self.open_count
    }

    /// Increment the open count, performing the native open on the first
    /// reference. A failed native open rolls the count back.
    pub fn open(&mut self) -> Result<()> {
        self.open_count += 1;
        if self.open_count == 1 {
            match self.device.open() {
                Ok(handle) => self.handle = Some(Arc::new(Mutex::new(handle))),
                Err(e) => {
                    self.open_count -= 1;
                    error!("cannot open device {}: {}", self.id, e);
                    return Err(ProxyError::Usb(native_error_code(e)));
                }
            }
        }
        Ok(())
    }

    /// Decrement the open count, dropping the native handle on the last
    /// reference. Closing a device that is not open is a warning, not an
    /// error, so unbalanced closes never reach the native library.
    pub fn close(&mut self) {
        if self.open_count == 0 {
            warn!("ignoring close, the device was not open");
            return;
        }
        self.open_count -= 1;
        if self.open_count == 0 {
            self.handle = None;
        }
    }
}

/// Mapping of identifiers to device records.
pub struct DeviceTable {
    next_id: u32,
    devices: HashMap<u32, LocalDevice>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            next_id: FIRST_DEVICE_ID,
            devices: HashMap::new(),
        }
    }

    /// Find the record tracking `device`, inserting a fresh one with a new
    /// identifier on first observation. Identity is the device's position on
    /// the bus, which stays fixed for as long as it is plugged in.
    pub fn ensure_device(&mut self, device: &Device<Context>) -> DeviceId {
        let existing = self.devices.values().find(|d| {
            d.device.bus_number() == device.bus_number() && d.device.address() == device.address()
        });
        if let Some(record) = existing {
            return record.id;
        }

        let id = DeviceId(self.next_id);
        self.next_id += 1;
        self.devices.insert(id.0, LocalDevice::new(id, device.clone()));
        id
    }

    pub fn get_mut(&mut self, device_id: DeviceId) -> Result<&mut LocalDevice> {
        match self.devices.get_mut(&device_id.0) {
            Some(record) => Ok(record),
            None => {
                error!("device id {} does not exist", device_id);
                Err(ProxyError::Usb(error_code::NO_DEVICE))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Map a rusb error onto the native libusb error code.
pub fn native_error_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => error_code::IO,
        rusb::Error::InvalidParam => error_code::INVALID_PARAM,
        rusb::Error::Access => error_code::ACCESS,
        rusb::Error::NoDevice => error_code::NO_DEVICE,
        rusb::Error::NotFound => error_code::NOT_FOUND,
        rusb::Error::Busy => error_code::BUSY,
        rusb::Error::Timeout => error_code::TIMEOUT,
        rusb::Error::Overflow => error_code::OVERFLOW,
        rusb::Error::Pipe => error_code::PIPE,
        rusb::Error::Interrupted => error_code::INTERRUPTED,
        rusb::Error::NoMem => error_code::NO_MEM,
        rusb::Error::NotSupported => error_code::NOT_SUPPORTED,
        rusb::Error::BadDescriptor | rusb::Error::Other => error_code::OTHER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(native_error_code(rusb::Error::NoDevice), -4);
        assert_eq!(native_error_code(rusb::Error::Timeout), -7);
        assert_eq!(native_error_code(rusb::Error::NotSupported), -12);
        assert_eq!(native_error_code(rusb::Error::Other), -99);
    }

    #[test]
    fn test_table_starts_empty() {
        let table = DeviceTable::new();
        assert!(table.is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_missing_device_is_no_device() {
        let mut table = DeviceTable::new();
        let err = table.get_mut(DeviceId(7)).unwrap_err();
        assert_eq!(err, ProxyError::Usb(error_code::NO_DEVICE));
    }
}
