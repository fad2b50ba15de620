//! Deterministic binary encoding for persisted store snapshots.
//!
//! The loopback engine writes whole committed stores to its commit log. This
//! module provides the [`Encode`] and [`Decode`] traits and the hand-written,
//! byte-stable format used for those records.
//!
//! # Wire format
//!
//! | Rust type               | Encoding                                    |
//! |-------------------------|---------------------------------------------|
//! | `u8`                    | 1 byte                                      |
//! | `u32`                   | 4 bytes, little-endian                      |
//! | `Vec<u8>`               | `[u32 len][bytes]`                          |
//! | `BTreeMap<Vec<u8>, V>`  | `[u32 count]([key][V])…` in ascending order |
//!
//! A [`Store`](crate::model::Store) is therefore
//! `[u32 buckets]([name][u32 keys]([key][value])…)…`.
//!
//! # Safety limits
//!
//! Decoders reject lengths above [`MAX_BYTE_LEN`] and counts above
//! [`MAX_MAP_ENTRIES`] before allocating. Map keys must be strictly
//! ascending, so every store has exactly one valid encoding.
//!
//! No function in this module panics; all failures are [`EncodingError`]s.


use std::collections::BTreeMap;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum decoded length of a single byte string (64 MiB).
pub const MAX_BYTE_LEN: u32 = 64 * 1024 * 1024;

/// Maximum decoded entry count of a single map (16 M).
pub const MAX_MAP_ENTRIES: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A length or count exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Map keys were duplicated or not in ascending order.
    #[error("map keys out of order at entry {0}")]
    UnorderedKeys(usize),

    /// Bytes remained after the top-level value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// The same logical value always yields the same bytes.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` so callers can walk a buffer that holds
/// several items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value that must occupy all of `buf`.
pub fn decode_exact<T: Decode>(buf: &[u8]) -> Result<T, EncodingError> {
    let (value, consumed) = T::decode_from(buf)?;
    if consumed != buf.len() {
        return Err(EncodingError::TrailingBytes(buf.len() - consumed));
    }
    Ok(value)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// Integers
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[..4]);
        Ok((u32::from_le_bytes(bytes), 4))
    }
}

// ------------------------------------------------------------------------------------------------
// Byte strings: [u32 len][bytes]
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Encode for [u8] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, offset) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte string length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
            )));
        }
        let len = len as usize;
        require(&buf[offset..], len)?;
        Ok((buf[offset..offset + len].to_vec(), offset + len))
    }
}

// ------------------------------------------------------------------------------------------------
// Ordered maps: [u32 count]([key][value])…
// ------------------------------------------------------------------------------------------------

impl<V: Encode> Encode for BTreeMap<Vec<u8>, V> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        for (key, value) in self {
            key.encode_to(buf)?;
            value.encode_to(buf)?;
        }
        Ok(())
    }
}

impl<V: Decode> Decode for BTreeMap<Vec<u8>, V> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (count, mut offset) = u32::decode_from(buf)?;
        if count > MAX_MAP_ENTRIES {
            return Err(EncodingError::LengthOverflow(format!(
                "map entry count {count} exceeds MAX_MAP_ENTRIES ({MAX_MAP_ENTRIES})"
            )));
        }
        let mut map = BTreeMap::new();
        for index in 0..count as usize {
            let (key, used) = Vec::<u8>::decode_from(&buf[offset..])?;
            offset += used;
            let (value, used) = V::decode_from(&buf[offset..])?;
            offset += used;

            if map.last_key_value().is_some_and(|(last, _)| *last >= key) {
                return Err(EncodingError::UnorderedKeys(index));
            }
            map.insert(key, value);
        }
        Ok((map, offset))
    }
}
