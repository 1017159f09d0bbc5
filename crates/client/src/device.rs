//! Host-side device records

use protocol::{DeviceDescriptor, DeviceId};
use tracing::warn;

/// One remote device as presented to the host library.
///
/// The server-assigned id doubles as the host session id, so re-enumeration
/// finds existing records instead of duplicating them.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub bus_number: u8,
    pub port_number: u8,
    pub device_address: u8,
    pub descriptor: DeviceDescriptor,
}

/// Basic descriptor sanity check before a device is handed to the host.
pub(crate) fn sanitize(device: &DiscoveredDevice) -> bool {
    let descriptor = &device.descriptor;
    if descriptor.b_length != 18 || descriptor.b_descriptor_type != 1 {
        warn!(
            "device id {} has a malformed descriptor (bLength={}, bDescriptorType={})",
            device.id, descriptor.b_length, descriptor.b_descriptor_type
        );
        return false;
    }
    if descriptor.b_num_configurations == 0 {
        warn!("device id {} has no configurations", device.id);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(descriptor: DeviceDescriptor) -> DiscoveredDevice {
        DiscoveredDevice {
            id: DeviceId(42),
            bus_number: 1,
            port_number: 2,
            device_address: 3,
            descriptor,
        }
    }

    #[test]
    fn test_sane_device_passes() {
        let descriptor = common::test_utils::mock_descriptor(0x1234, 0x5678);
        assert!(sanitize(&device(descriptor)));
    }

    #[test]
    fn test_malformed_descriptor_rejected() {
        let mut descriptor = common::test_utils::mock_descriptor(0x1234, 0x5678);
        descriptor.b_length = 9;
        assert!(!sanitize(&device(descriptor)));

        let mut descriptor = common::test_utils::mock_descriptor(0x1234, 0x5678);
        descriptor.b_num_configurations = 0;
        assert!(!sanitize(&device(descriptor)));
    }
}
