//! Wire protocol for usb-proxy
//!
//! This crate defines everything that crosses the link between the proxy
//! client and the server: the field-level codec, the outer message framing,
//! and the USB domain types. The codec is pure byte manipulation; the only
//! async surface is the pair of [`read_frame`]/[`write_frame`] helpers.
//!
//! # Example
//!
//! ```
//! use protocol::{decode_payload, encode_payload, Frame};
//!
//! let frame = Frame::Call {
//!     method: "devices_list".to_string(),
//!     correlation_id: 1,
//!     args: encode_payload(&()),
//! };
//!
//! let bytes = frame.encode().unwrap();
//! let decoded = Frame::decode(&bytes[4..]).unwrap();
//! assert_eq!(decoded, frame);
//! ```

pub mod error;
pub mod frame;
pub mod types;
pub mod usb;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_SIZE};
pub use types::{
    Capabilities, DeviceDescriptor, DeviceId, DeviceSummary, TransferRequest, TransferResult,
};
pub use wire::{decode_payload, encode_payload, Reader, WireDecode, WireEncode};
