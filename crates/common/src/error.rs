//! Proxy error type and the wire encoding of domain errors
//!
//! The RPC layer carries errors as plain text, so domain errors are encoded
//! as a stable prefix plus the native libusb error code:
//! `host error: libusb::error::<int>`. The server side produces this text
//! through `Display`; the client side parses it back with
//! [`ProxyError::from_remote_text`].

use thiserror::Error;

/// Stable prefix of domain errors on the wire.
pub const HOST_ERROR_PREFIX: &str = "host error: libusb::error::";

/// Errors produced by a [`crate::UsbProxy`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// Domain error carrying a native libusb error or transfer-status code.
    #[error("host error: libusb::error::{0}")]
    Usb(i32),

    /// The connection went away under an in-flight call.
    #[error("connection closed")]
    Closed,

    /// Socket or framing failure, fatal to the connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote error text that does not carry a recognisable code.
    #[error("{0}")]
    Remote(String),
}

impl ProxyError {
    /// Parse remote error text back into a structured error.
    pub fn from_remote_text(text: &str) -> Self {
        match text
            .strip_prefix(HOST_ERROR_PREFIX)
            .and_then(|code| code.trim().parse::<i32>().ok())
        {
            Some(code) => ProxyError::Usb(code),
            None => ProxyError::Remote(text.to_string()),
        }
    }

    /// The integer status a USB backend entry point reports for this error.
    ///
    /// Recognised domain errors surface their native code; everything else
    /// collapses to the generic "other" code.
    pub fn code(&self) -> i32 {
        match self {
            ProxyError::Usb(code) => *code,
            _ => protocol::usb::error_code::OTHER,
        }
    }
}

impl From<rpc::RpcError> for ProxyError {
    fn from(err: rpc::RpcError) -> Self {
        match err {
            rpc::RpcError::ConnectionClosed => ProxyError::Closed,
            rpc::RpcError::Transport(e) => ProxyError::Transport(e.to_string()),
            rpc::RpcError::MethodNotFound { method } => {
                ProxyError::Remote(format!("method not found: {method}"))
            }
            rpc::RpcError::Remote { message } => ProxyError::from_remote_text(&message),
        }
    }
}

/// Type alias for proxy results
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::usb::error_code;

    #[test]
    fn test_wire_text_roundtrip() {
        let err = ProxyError::Usb(error_code::NO_DEVICE);
        let text = err.to_string();
        assert_eq!(text, "host error: libusb::error::-4");
        assert_eq!(ProxyError::from_remote_text(&text), err);
    }

    #[test]
    fn test_positive_codes_roundtrip() {
        // Transfer-status codes are carried through the same channel.
        let err = ProxyError::Usb(1);
        assert_eq!(ProxyError::from_remote_text(&err.to_string()), err);
    }

    #[test]
    fn test_unrecognised_text_becomes_remote() {
        let err = ProxyError::from_remote_text("something exploded");
        assert_eq!(err, ProxyError::Remote("something exploded".to_string()));
        assert_eq!(err.code(), error_code::OTHER);
    }

    #[test]
    fn test_garbled_code_becomes_remote() {
        let err = ProxyError::from_remote_text("host error: libusb::error::banana");
        assert!(matches!(err, ProxyError::Remote(_)));
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(ProxyError::Usb(-7).code(), -7);
        assert_eq!(ProxyError::Closed.code(), error_code::OTHER);
        assert_eq!(
            ProxyError::Transport("eof".to_string()).code(),
            error_code::OTHER
        );
    }
}
