//! RPC error types

use thiserror::Error;

/// Errors surfaced by [`crate::Endpoint`] calls.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Socket I/O failure, unexpected EOF or malformed frame. Fatal to the
    /// connection.
    #[error("transport error: {0}")]
    Transport(#[from] protocol::ProtocolError),

    /// The connection went away while the call was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer does not know the requested method key.
    #[error("method not found: {method}")]
    MethodNotFound { method: String },

    /// The remote handler reported an error; `message` carries its text.
    #[error("remote error: {message}")]
    Remote { message: String },
}

pub(crate) const METHOD_NOT_FOUND_PREFIX: &str = "method not found: ";

impl RpcError {
    /// Classify the error text of a `response-err` frame.
    pub(crate) fn from_remote_text(message: String) -> Self {
        match message.strip_prefix(METHOD_NOT_FOUND_PREFIX) {
            Some(method) => RpcError::MethodNotFound {
                method: method.to_string(),
            },
            None => RpcError::Remote { message },
        }
    }
}

/// Type alias for RPC results
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_text_classification() {
        let err = RpcError::from_remote_text("method not found: frobnicate".to_string());
        assert!(matches!(
            err,
            RpcError::MethodNotFound { method } if method == "frobnicate"
        ));

        let err = RpcError::from_remote_text("host error: libusb::error::-4".to_string());
        assert!(matches!(
            err,
            RpcError::Remote { message } if message.ends_with("-4")
        ));
    }
}
