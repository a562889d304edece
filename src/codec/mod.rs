//! Value serialization between application types and buffer bytes.
//!
//! The transport treats elements as opaque byte runs; this module supplies
//! the collaborator that delimits them. Types implement [`Codec`] to write
//! themselves into a [`BufferBuilder`] and to read themselves back from any
//! [`ByteCursor`], which may be a single contiguous buffer or a cursor
//! walking a whole buffer chain.
//!
//! Unsigned and signed integers use fixed-width little-endian encodings;
//! strings and byte vectors carry a variable-length-encoded length prefix so
//! that [`Codec::skip`] can hop over them without touching the payload.

mod vle;

pub(crate) use vle::{read_vle, vle_len, write_vle};

use crate::buffers::BufferBuilder;

/// Errors surfaced while decoding element bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The cursor ran out of bytes mid-value.
    #[error("not enough bytes to decode the value")]
    ShortRead,
    /// A length prefix exceeds the bytes actually present.
    #[error("length prefix of {0} bytes exceeds the available data")]
    LengthOverrun(u64),
    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Incremental read access to serialized element bytes.
///
/// Implemented by the single-buffer [`BufferReader`] and by the chain cursor
/// that reassembles elements straddling buffer boundaries.
pub trait ByteCursor {
    /// Fills `into` completely, advancing the cursor.
    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), CodecError>;

    /// Returns the number of bytes readable at the cursor right now.
    fn remaining(&self) -> usize;

    /// Reads one byte.
    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let mut byte = 0;
        self.read_exact(core::slice::from_mut(&mut byte))?;
        Ok(byte)
    }

    /// Advances the cursor by `len` bytes without surfacing them.
    ///
    /// The default implementation drains through a scratch buffer;
    /// implementations that can move their cursor directly should override
    /// it.
    fn skip(&mut self, mut len: usize) -> Result<(), CodecError> {
        let mut scratch = [0u8; 64];
        while len > 0 {
            let step = len.min(scratch.len());
            self.read_exact(&mut scratch[..step])?;
            len -= step;
        }
        Ok(())
    }
}

/// Reads serialized values from a single contiguous byte slice.
pub struct BufferReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> BufferReader<'a> {
    /// Creates a reader over `bytes` with the cursor at the start.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    /// Returns the current cursor position in bytes.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl ByteCursor for BufferReader<'_> {
    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), CodecError> {
        let end = self.cursor.checked_add(into.len()).ok_or(CodecError::ShortRead)?;
        if end > self.bytes.len() {
            return Err(CodecError::ShortRead);
        }
        into.copy_from_slice(&self.bytes[self.cursor..end]);
        self.cursor = end;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn skip(&mut self, len: usize) -> Result<(), CodecError> {
        let end = self.cursor.checked_add(len).ok_or(CodecError::ShortRead)?;
        if end > self.bytes.len() {
            return Err(CodecError::ShortRead);
        }
        self.cursor = end;
        Ok(())
    }
}

/// Serialization contract for element types flowing through channels.
///
/// Encodings must be self-delimiting and deterministic: `deserialize`
/// consumes exactly the bytes `serialize` produced, regardless of how those
/// bytes are split across buffers.
pub trait Codec: Sized {
    /// Appends the encoding of `self` to `builder`.
    fn serialize(&self, builder: &mut BufferBuilder);

    /// Reads one value from the cursor.
    fn deserialize<R: ByteCursor>(cursor: &mut R) -> Result<Self, CodecError>;

    /// Advances the cursor past one encoded value without materializing it.
    ///
    /// Override when the framing allows skipping cheaper than decoding.
    fn skip<R: ByteCursor>(cursor: &mut R) -> Result<(), CodecError> {
        Self::deserialize(cursor).map(|_| ())
    }
}

macro_rules! fixed_int_impl {
    ($int:ty) => {
        impl Codec for $int {
            fn serialize(&self, builder: &mut BufferBuilder) {
                builder.put_slice(&self.to_le_bytes());
            }

            fn deserialize<R: ByteCursor>(cursor: &mut R) -> Result<Self, CodecError> {
                let mut bytes = [0u8; core::mem::size_of::<$int>()];
                cursor.read_exact(&mut bytes)?;
                Ok(<$int>::from_le_bytes(bytes))
            }

            fn skip<R: ByteCursor>(cursor: &mut R) -> Result<(), CodecError> {
                cursor.skip(core::mem::size_of::<$int>())
            }
        }
    };
}

fixed_int_impl!(u8);
fixed_int_impl!(u16);
fixed_int_impl!(u32);
fixed_int_impl!(u64);
fixed_int_impl!(i8);
fixed_int_impl!(i16);
fixed_int_impl!(i32);
fixed_int_impl!(i64);

// usize travels as u64 so that the wire layout is the same on every host.
impl Codec for usize {
    fn serialize(&self, builder: &mut BufferBuilder) {
        (*self as u64).serialize(builder);
    }

    fn deserialize<R: ByteCursor>(cursor: &mut R) -> Result<Self, CodecError> {
        u64::deserialize(cursor).map(|x| x as usize)
    }

    fn skip<R: ByteCursor>(cursor: &mut R) -> Result<(), CodecError> {
        u64::skip(cursor)
    }
}

fn read_length_prefix<R: ByteCursor>(cursor: &mut R) -> Result<usize, CodecError> {
    let len = read_vle(cursor)?;
    if len > cursor.remaining() as u64 {
        return Err(CodecError::LengthOverrun(len));
    }
    Ok(len as usize)
}

impl Codec for Vec<u8> {
    fn serialize(&self, builder: &mut BufferBuilder) {
        builder.reserve(vle_len(self.len() as u64) + self.len());
        write_vle(builder, self.len() as u64);
        builder.put_slice(self);
    }

    fn deserialize<R: ByteCursor>(cursor: &mut R) -> Result<Self, CodecError> {
        let len = read_length_prefix(cursor)?;
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn skip<R: ByteCursor>(cursor: &mut R) -> Result<(), CodecError> {
        let len = read_length_prefix(cursor)?;
        cursor.skip(len)
    }
}

impl Codec for String {
    fn serialize(&self, builder: &mut BufferBuilder) {
        builder.reserve(vle_len(self.len() as u64) + self.len());
        write_vle(builder, self.len() as u64);
        builder.put_slice(self.as_bytes());
    }

    fn deserialize<R: ByteCursor>(cursor: &mut R) -> Result<Self, CodecError> {
        let bytes = Vec::<u8>::deserialize(cursor)?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    fn skip<R: ByteCursor>(cursor: &mut R) -> Result<(), CodecError> {
        Vec::<u8>::skip(cursor)
    }
}
