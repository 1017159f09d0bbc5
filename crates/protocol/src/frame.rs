//! Message framing
//!
//! Every message on the wire is `<u32 total_length><body>` in little-endian,
//! where `total_length` counts the bytes that follow. The body starts with a
//! one-byte tag selecting the message kind:
//!
//! ```text
//! 0 call          <method_key: string><correlation_id: u64><args...>
//! 1 response-ok   <correlation_id: u64><result...>
//! 2 response-err  <correlation_id: u64><error_text: string>
//! ```
//!
//! `args` and `result` run to the end of the frame; their field layout is
//! defined per method. Encoding and decoding are pure; the async
//! [`read_frame`]/[`write_frame`] helpers are the only place the codec meets
//! a socket.

use crate::error::{ProtocolError, Result};
use crate::wire::{Reader, WireDecode, WireEncode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size (16 MiB) to prevent memory exhaustion.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const TAG_CALL: u8 = 0;
const TAG_RESPONSE_OK: u8 = 1;
const TAG_RESPONSE_ERR: u8 = 2;

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Invoke `method` on the peer.
    Call {
        method: String,
        correlation_id: u64,
        args: Vec<u8>,
    },
    /// Successful completion of the call with the same correlation id.
    ResponseOk {
        correlation_id: u64,
        result: Vec<u8>,
    },
    /// Failed completion; `message` carries the remote error text.
    ResponseErr { correlation_id: u64, message: String },
}

impl Frame {
    /// Correlation id carried by any frame kind.
    pub fn correlation_id(&self) -> u64 {
        match self {
            Frame::Call { correlation_id, .. }
            | Frame::ResponseOk { correlation_id, .. }
            | Frame::ResponseErr { correlation_id, .. } => *correlation_id,
        }
    }

    /// Encode the whole frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match self {
            Frame::Call {
                method,
                correlation_id,
                args,
            } => {
                body.push(TAG_CALL);
                method.encode(&mut body);
                correlation_id.encode(&mut body);
                body.extend_from_slice(args);
            }
            Frame::ResponseOk {
                correlation_id,
                result,
            } => {
                body.push(TAG_RESPONSE_OK);
                correlation_id.encode(&mut body);
                body.extend_from_slice(result);
            }
            Frame::ResponseErr {
                correlation_id,
                message,
            } => {
                body.push(TAG_RESPONSE_ERR);
                correlation_id.encode(&mut body);
                message.encode(&mut body);
            }
        }

        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Frame> {
        let mut reader = Reader::new(body);
        let tag = u8::decode(&mut reader)?;
        let frame = match tag {
            TAG_CALL => {
                let method = String::decode(&mut reader)?;
                let correlation_id = u64::decode(&mut reader)?;
                let args = reader.rest().to_vec();
                Frame::Call {
                    method,
                    correlation_id,
                    args,
                }
            }
            TAG_RESPONSE_OK => {
                let correlation_id = u64::decode(&mut reader)?;
                let result = reader.rest().to_vec();
                Frame::ResponseOk {
                    correlation_id,
                    result,
                }
            }
            TAG_RESPONSE_ERR => {
                let correlation_id = u64::decode(&mut reader)?;
                let message = String::decode(&mut reader)?;
                reader.finish()?;
                Frame::ResponseErr {
                    correlation_id,
                    message,
                }
            }
            _ => return Err(ProtocolError::malformed("invalid frame tag")),
        };
        Ok(frame)
    }
}

/// Read one frame from an async reader.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly at a frame
/// boundary. A declared length above [`MAX_FRAME_SIZE`] is an error and the
/// stream must be dropped, since the codec cannot resynchronise.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_le_bytes(len_bytes) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Frame::decode(&body).map(Some)
}

/// Write one frame to an async writer.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    Ok(())
}
