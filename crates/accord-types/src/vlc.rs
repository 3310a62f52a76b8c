//! Canonical variable-length unsigned integers.
//!
//! Integers are written as little-endian base-128 groups, high bit set on
//! every byte except the last. Exactly one encoding is accepted for each
//! value: a trailing zero group is rejected, as is anything wider than a
//! `u64`. This keeps re-encoding of a decoded value byte-identical.

use crate::error::TypeError;

/// Maximum encoded width of a `u64`.
pub const MAX_VLC_LENGTH: usize = 10;

/// Append the encoding of `value` to `out`.
pub fn write_vlc(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let group = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(group);
            return;
        }
        out.push(group | 0x80);
    }
}

/// Number of bytes `write_vlc` produces for `value`.
pub fn vlc_length(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Read an integer starting at `offset`. Returns the value and the number of
/// bytes consumed.
pub fn read_vlc(data: &[u8], offset: usize) -> Result<(u64, usize), TypeError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VLC_LENGTH {
        let byte = *data
            .get(offset + i)
            .ok_or(TypeError::TruncatedInteger(offset))?;
        let group = u64::from(byte & 0x7f);
        if i == MAX_VLC_LENGTH - 1 && group > 1 {
            return Err(TypeError::IntegerOverflow(offset));
        }
        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            if i > 0 && byte == 0 {
                return Err(TypeError::NonCanonicalInteger(offset));
            }
            return Ok((value, i + 1));
        }
    }
    Err(TypeError::IntegerOverflow(offset))
}
