//! Low-level encoding primitives shared by all on-disk records.
//!
//! Each reader consumes exactly the bytes it promises or returns an error -
//! there is no partial-read ambiguity. Writers append to a `Vec<u8>` record
//! buffer; records are padded to their fixed size by the caller.

use std::io::Read;

use crate::{Error, Result};

/// Read one byte.
#[inline]
pub(crate) fn u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

/// Read a little-endian `u32`.
#[inline]
pub(crate) fn le_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Read a little-endian `u64`.
#[inline]
pub(crate) fn le_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

/// Read exactly `N` bytes into a fixed-size array.
#[inline]
pub(crate) fn bytesa<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Skip `len` bytes.
#[inline]
pub(crate) fn skip<R: Read>(r: &mut R, len: u64) -> Result<()> {
    let copied = std::io::copy(&mut r.by_ref().take(len), &mut std::io::sink())?;
    if copied != len {
        return Err(Error::UnexpectedEof);
    }
    Ok(())
}

/// Verify that the next `N` bytes in the stream match `expected`.
///
/// Returns [`Error::BadMagic`] on mismatch.
#[inline]
pub(crate) fn magic<R: Read, const N: usize>(r: &mut R, expected: &[u8; N]) -> Result<()> {
    let got = bytesa::<N>(r)?;
    if &got != expected {
        return Err(Error::BadMagic);
    }
    Ok(())
}

/// Append a little-endian `u32`.
#[inline]
pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Append a little-endian `u64`.
#[inline]
pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Zero-pad (or truncate) a record buffer to exactly `len` bytes.
#[inline]
pub(crate) fn pad_to(mut out: Vec<u8>, len: usize) -> Vec<u8> {
    out.resize(len, 0);
    out
}

/// Decode a fixed-width, zero-padded name field.
///
/// Unlike a C string the field may be completely full, in which case the
/// name has no terminator.
pub(crate) fn padded_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Round `v` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_up(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// Convert a storage offset into an in-memory index.
#[inline]
pub(crate) fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| Error::InvalidRange)
}
