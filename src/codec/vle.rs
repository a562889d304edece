use super::{ByteCursor, CodecError};
use crate::buffers::BufferBuilder;

pub(crate) const VLE_LEN_MAX: usize = vle_len(u64::MAX);

/// Number of bytes `x` occupies once variable-length encoded.
pub(crate) const fn vle_len(x: u64) -> usize {
    const B1: u64 = u64::MAX << 7;
    const B2: u64 = u64::MAX << (7 * 2);
    const B3: u64 = u64::MAX << (7 * 3);
    const B4: u64 = u64::MAX << (7 * 4);
    const B5: u64 = u64::MAX << (7 * 5);
    const B6: u64 = u64::MAX << (7 * 6);
    const B7: u64 = u64::MAX << (7 * 7);
    const B8: u64 = u64::MAX << (7 * 8);

    if (x & B1) == 0 {
        1
    } else if (x & B2) == 0 {
        2
    } else if (x & B3) == 0 {
        3
    } else if (x & B4) == 0 {
        4
    } else if (x & B5) == 0 {
        5
    } else if (x & B6) == 0 {
        6
    } else if (x & B7) == 0 {
        7
    } else if (x & B8) == 0 {
        8
    } else {
        9
    }
}

/// Writes `x` as a 7-bit continuation encoding, at most
/// [`VLE_LEN_MAX`] bytes.
///
/// The ninth byte, when present, carries a full 8 bits: the continuation flag
/// is not needed once the maximum length is reached.
pub(crate) fn write_vle(builder: &mut BufferBuilder, mut x: u64) {
    let mut len = 0;
    while (x & !0x7f_u64) != 0 {
        builder.put_u8((x as u8) | 0x80);
        len += 1;
        x >>= 7;
    }
    // At the maximum length all bits have been emitted inside the loop.
    if len != VLE_LEN_MAX {
        builder.put_u8(x as u8);
    }
}

/// Reads a value written by [`write_vle`].
pub(crate) fn read_vle<R: ByteCursor + ?Sized>(reader: &mut R) -> Result<u64, CodecError> {
    let mut b = reader.read_u8()?;

    let mut v = 0u64;
    let mut i = 0;
    while (b & 0x80_u8) != 0 && i != 7 * (VLE_LEN_MAX - 1) {
        v |= ((b & 0x7f_u8) as u64) << i;
        b = reader.read_u8()?;
        i += 7;
    }
    v |= (b as u64) << i;
    Ok(v)
}
