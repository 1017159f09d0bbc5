//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// A `MalformedFrame` or `FrameTooLarge` coming out of the codec is fatal to
/// the connection it was read from; the caller is expected to drop the
/// connection rather than resynchronise.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame body could not be decoded
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// What the decoder tripped over
        reason: &'static str,
    },

    /// Frame length exceeds the maximum allowed size
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// I/O error during frame operations
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: &'static str) -> Self {
        ProtocolError::MalformedFrame { reason }
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::MalformedFrame {
            reason: "invalid tag",
        };
        assert_eq!(format!("{}", err), "malformed frame: invalid tag");
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 10_000_000,
            max: 1_000_000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("frame too large"));
        assert!(msg.contains("10000000"));
    }
}
