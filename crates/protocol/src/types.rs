//! USB domain types crossing the wire
//!
//! This module defines the data model exchanged between the proxy client and
//! the server: device summaries, descriptors, transfer requests and results,
//! and server capabilities. The wire layout of every struct is its field
//! declaration order, encoded with the rules in [`crate::wire`].

use crate::error::Result;
use crate::wire::{wire_struct, Reader, WireDecode, WireEncode};

/// Unique device identifier (server-assigned)
///
/// A 32-bit token naming a physical device over the wire. It is assigned on
/// first observation of the device, stays stable while the device remains in
/// the server's enumeration list, and is never reissued to a different
/// device during one server lifetime. Opaque to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl WireEncode for DeviceId {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl WireDecode for DeviceId {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(DeviceId(u32::decode(reader)?))
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a device enumeration
///
/// Produced by `devices_list`; immutable once returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSummary {
    /// Server-assigned identifier, used as the key of every device-scoped call
    pub id: DeviceId,
    /// Bus number on the server
    pub bus_number: u8,
    /// Port number on that bus
    pub port_number: u8,
    /// Device address on the bus
    pub device_address: u8,
}

wire_struct!(DeviceSummary {
    id,
    bus_number,
    port_number,
    device_address,
});

/// Bit-exact mirror of the USB 2.0 standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

wire_struct!(DeviceDescriptor {
    b_length,
    b_descriptor_type,
    bcd_usb,
    b_device_class,
    b_device_sub_class,
    b_device_protocol,
    b_max_packet_size0,
    id_vendor,
    id_product,
    bcd_device,
    i_manufacturer,
    i_product,
    i_serial_number,
    b_num_configurations,
});

/// USB transfer request (client -> server)
///
/// Direction is encoded in bit 7 of `endpoint` (set = device-to-host).
/// `buffer` carries the full data for host-to-device transfers, the 8-byte
/// setup packet for device-to-host control transfers, and nothing for
/// device-to-host bulk/interrupt transfers. Any other buffer length is an
/// input error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Device to perform the transfer on
    pub device_id: DeviceId,
    /// USB-level timeout in milliseconds, honoured by the native library
    pub timeout_ms: u32,
    /// Total transfer length (for control: setup packet included)
    pub length: u32,
    /// Endpoint address including the direction bit
    pub endpoint: u8,
    /// Transfer type code, see [`crate::usb::transfer_type`]
    pub kind: u8,
    /// Outbound bytes, see above
    pub buffer: Vec<u8>,
}

wire_struct!(TransferRequest {
    device_id,
    timeout_ms,
    length,
    endpoint,
    kind,
    buffer,
});

/// USB transfer result (server -> client)
///
/// `status` mirrors the native library's transfer-status enumeration, see
/// [`crate::usb::transfer_status`]. `data` holds exactly `actual_length`
/// bytes; for control transfers the 8-byte setup prefix is omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub status: i32,
    pub actual_length: i32,
    pub data: Vec<u8>,
}

wire_struct!(TransferResult {
    status,
    actual_length,
    data,
});

/// Capabilities advertised by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub has_hid_access: bool,
    pub supports_detach_kernel_driver: bool,
}

wire_struct!(Capabilities {
    has_hid_access,
    supports_detach_kernel_driver,
});
