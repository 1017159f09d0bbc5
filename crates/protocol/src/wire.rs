//! Field-level wire encoding
//!
//! Every value crossing the link is serialised as a sequence of typed fields
//! in a stable, per-message field order:
//!
//! - fixed-width integers: little-endian, natural width;
//! - booleans: one byte, `0` or `1`;
//! - byte sequences and strings: `<u32 len><bytes>`;
//! - ordered sequences of `T`: `<u32 count><T...>`;
//! - tagged unions: `<u8 tag><variant payload>`.
//!
//! The codec is pure: it never touches a socket. Overruns, underruns and
//! invalid tags all surface as [`ProtocolError::MalformedFrame`] and the
//! caller decides whether to drop the connection.

use crate::error::{ProtocolError, Result};

/// A value that can be appended to an outgoing payload.
pub trait WireEncode {
    fn encode(&self, buf: &mut Vec<u8>);
}

/// A value that can be read back from an incoming payload.
pub trait WireDecode: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self>;
}

/// Cursor over a received payload.
///
/// Reads never go past the end of the buffer; a short buffer yields
/// `MalformedFrame` instead.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::malformed("field overruns frame"));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Consume everything left in the payload.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Assert that the payload was fully consumed.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::malformed("trailing bytes after payload"));
        }
        Ok(())
    }
}

/// Encode a single value into a fresh payload buffer.
pub fn encode_payload<T: WireEncode + ?Sized>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

/// Decode a payload, requiring every byte to be consumed.
pub fn decode_payload<T: WireDecode>(bytes: &[u8]) -> Result<T> {
    let mut reader = Reader::new(bytes);
    let value = T::decode(&mut reader)?;
    reader.finish()?;
    Ok(value)
}

macro_rules! impl_wire_int {
    ($($ty:ty),+) => {
        $(
            impl WireEncode for $ty {
                fn encode(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }
            }

            impl WireDecode for $ty {
                fn decode(reader: &mut Reader<'_>) -> Result<Self> {
                    let bytes = reader.take(std::mem::size_of::<$ty>())?;
                    Ok(<$ty>::from_le_bytes(bytes.try_into().expect("sized read")))
                }
            }
        )+
    };
}

impl_wire_int!(u8, u16, u32, u64, i32);

impl WireEncode for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }
}

impl WireDecode for bool {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        match reader.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ProtocolError::malformed("invalid boolean")),
        }
    }
}

fn decode_len(reader: &mut Reader<'_>) -> Result<usize> {
    let len = u32::decode(reader)? as usize;
    // A declared length can never exceed what is left in the frame, every
    // element being at least one byte on the wire.
    if len > reader.remaining() {
        return Err(ProtocolError::malformed("length overruns frame"));
    }
    Ok(len)
}

impl WireEncode for str {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        buf.extend_from_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.as_str().encode(buf);
    }
}

impl WireDecode for String {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = decode_len(reader)?;
        let bytes = reader.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::malformed("string is not valid utf-8"))
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let count = decode_len(reader)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}

impl WireEncode for () {
    fn encode(&self, _buf: &mut Vec<u8>) {}
}

impl WireDecode for () {
    fn decode(_reader: &mut Reader<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_wire_tuple {
    ($($name:ident),+) => {
        impl<$($name: WireEncode),+> WireEncode for ($($name,)+) {
            fn encode(&self, buf: &mut Vec<u8>) {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                $($name.encode(buf);)+
            }
        }

        impl<$($name: WireDecode),+> WireDecode for ($($name,)+) {
            fn decode(reader: &mut Reader<'_>) -> Result<Self> {
                Ok(($($name::decode(reader)?,)+))
            }
        }
    };
}

impl_wire_tuple!(A);
impl_wire_tuple!(A, B);
impl_wire_tuple!(A, B, C);
impl_wire_tuple!(A, B, C, D);
impl_wire_tuple!(A, B, C, D, E);
impl_wire_tuple!(A, B, C, D, E, F);

/// Implement the wire traits for a struct, serialising its fields in
/// declaration order.
macro_rules! wire_struct {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl $crate::wire::WireEncode for $ty {
            fn encode(&self, buf: &mut Vec<u8>) {
                $($crate::wire::WireEncode::encode(&self.$field, buf);)+
            }
        }

        impl $crate::wire::WireDecode for $ty {
            fn decode(reader: &mut $crate::wire::Reader<'_>) -> $crate::error::Result<Self> {
                Ok(Self {
                    $($field: $crate::wire::WireDecode::decode(reader)?,)+
                })
            }
        }
    };
}

pub(crate) use wire_struct;
