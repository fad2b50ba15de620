//! Argument strategies for generated operations.
//!
//! Every generator leans toward the inputs that break byte-oriented stores:
//! empty strings, the bytes `0x00` and `0xFF`, and the counts 0 and 255.

use proptest::collection::vec;
use proptest::prelude::*;
use proptest::sample::select;

/// Longest generated bucket name.
pub const MAX_BUCKET_LEN: usize = 45;

/// Longest generated key.
pub const MAX_KEY_LEN: usize = 46;

/// Longest generated key prefix (one suffix byte is appended).
pub const MAX_KEY_PREFIX_LEN: usize = MAX_KEY_LEN - 1;

/// Longest generated value or value prefix.
pub const MAX_VALUE_LEN: usize = 64;

/// One byte, often `0x00` or `0xFF`.
pub fn edge_byte() -> impl Strategy<Value = u8> {
    prop_oneof![
        1 => Just(0x00u8),
        1 => Just(0xFFu8),
        4 => any::<u8>(),
    ]
}

/// A byte string of at most `max_len` bytes, often empty.
pub fn bytes(max_len: usize) -> BoxedStrategy<Vec<u8>> {
    prop_oneof![
        1 => Just(Vec::new()),
        5 => vec(edge_byte(), 0..=max_len),
    ]
    .boxed()
}

pub fn bucket_name() -> BoxedStrategy<Vec<u8>> {
    bytes(MAX_BUCKET_LEN)
}

pub fn key() -> BoxedStrategy<Vec<u8>> {
    bytes(MAX_KEY_LEN)
}

pub fn key_prefix() -> BoxedStrategy<Vec<u8>> {
    bytes(MAX_KEY_PREFIX_LEN)
}

pub fn value() -> BoxedStrategy<Vec<u8>> {
    bytes(MAX_VALUE_LEN)
}

/// A one-byte count, often 0 or 255.
pub fn count() -> BoxedStrategy<u8> {
    prop_oneof![
        1 => Just(0u8),
        1 => Just(u8::MAX),
        4 => any::<u8>(),
    ]
    .boxed()
}

/// Picks a bucket, then one of its keys.
///
/// `entries` pairs every non-empty bucket with its keys in ascending order.
/// Yields `(bucket, key, rank)` where `rank` is the key's position in its
/// bucket.
pub fn located_key(entries: Vec<(Vec<u8>, Vec<Vec<u8>>)>) -> BoxedStrategy<(Vec<u8>, Vec<u8>, usize)> {
    select(entries)
        .prop_flat_map(|(bucket, keys)| {
            let len = keys.len();
            (Just(bucket), Just(keys), 0..len)
        })
        .prop_map(|(bucket, keys, rank)| {
            let key = keys[rank].clone();
            (bucket, key, rank)
        })
        .boxed()
}
