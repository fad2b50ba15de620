//! # Canonical Encoding and Hashing
//!
//! Produces a layout-independent fingerprint of a [`Store`]. The model and the
//! engine under test both reduce their logical contents to the same byte
//! stream and compare the resulting [`Digest`]s; nothing else about the
//! engine's physical state is ever inspected.
//!
//! # Byte stream
//!
//! ```text
//! for bucket in buckets (ascending):
//!     ['b'][escaped bucket name][0x00]
//!     for (key, value) in bucket (ascending by key):
//!         ['k'][escaped key][0x00]
//!         ['v'][escaped value][0x00]
//! ```
//!
//! Escaping copies payload bytes verbatim, except that every `0x00` is
//! written as `0x00 0xFF`. A bare `0x00` therefore only ever appears as a
//! field terminator, which makes the concatenation of framed fields
//! injective over the sequence of `(tag, payload)` pairs.
//!
//! # Digest
//!
//! A single running BLAKE2b hash with a 32-byte output is fed the stream in
//! order. No per-bucket digests are kept.


use std::fmt;

use blake2::Blake2b;
use blake2::Digest as _;
use blake2::digest::consts::U32;

use crate::model::{Bucket, Store};

type Blake2b256 = Blake2b<U32>;

/// Length of a [`Digest`] in bytes.
pub const DIGEST_LEN: usize = 32;

/// Byte that follows an escaped `0x00` inside a payload.
pub const ZERO_ESCAPE: u8 = 0xFF;

/// Unescaped byte closing every field.
pub const FIELD_TERMINATOR: u8 = 0x00;

// ------------------------------------------------------------------------------------------------
// Field tags
// ------------------------------------------------------------------------------------------------

/// Leading byte of a framed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldTag {
    Bucket = b'b',
    Key = b'k',
    Value = b'v',
}

// ------------------------------------------------------------------------------------------------
// Digest
// ------------------------------------------------------------------------------------------------

/// A 32-byte canonical store digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wraps raw digest bytes.
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a digest from a slice, returning `None` unless it is exactly
    /// [`DIGEST_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, as used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

// ------------------------------------------------------------------------------------------------
// Framing
// ------------------------------------------------------------------------------------------------

/// Appends one framed field (`tag`, escaped `payload`, terminator) to `out`.
pub fn encode_field(tag: FieldTag, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(payload.len() + 2);
    out.push(tag as u8);
    for &byte in payload {
        out.push(byte);
        if byte == 0 {
            out.push(ZERO_ESCAPE);
        }
    }
    out.push(FIELD_TERMINATOR);
}

/// Appends the framed fields of one bucket (name, then every key/value pair).
pub fn encode_bucket(name: &[u8], bucket: &Bucket, out: &mut Vec<u8>) {
    encode_field(FieldTag::Bucket, name, out);
    for (key, value) in bucket {
        encode_field(FieldTag::Key, key, out);
        encode_field(FieldTag::Value, value, out);
    }
}

/// Returns the full canonical byte stream of `store`.
pub fn encode_store(store: &Store) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, bucket) in store {
        encode_bucket(name, bucket, &mut out);
    }
    out
}

// ------------------------------------------------------------------------------------------------
// Hashing
// ------------------------------------------------------------------------------------------------

/// Running hash over framed fields.
///
/// Fields must be fed in canonical order; [`store_digest`] does this for a
/// whole [`Store`].
pub struct CanonicalHasher {
    inner: Blake2b256,
    scratch: Vec<u8>,
}

impl Default for CanonicalHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalHasher {
    pub fn new() -> Self {
        Self {
            inner: Blake2b256::new(),
            scratch: Vec::new(),
        }
    }

    /// Frames and feeds a single field.
    pub fn field(&mut self, tag: FieldTag, payload: &[u8]) {
        self.scratch.clear();
        encode_field(tag, payload, &mut self.scratch);
        self.inner.update(&self.scratch);
    }

    /// Feeds a bucket name followed by all of its entries.
    pub fn bucket(&mut self, name: &[u8], bucket: &Bucket) {
        self.field(FieldTag::Bucket, name);
        for (key, value) in bucket {
            self.field(FieldTag::Key, key);
            self.field(FieldTag::Value, value);
        }
    }

    pub fn finish(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

/// Computes the canonical digest of `store`.
pub fn store_digest(store: &Store) -> Digest {
    let mut hasher = CanonicalHasher::new();
    for (name, bucket) in store {
        hasher.bucket(name, bucket);
    }
    hasher.finish()
}
