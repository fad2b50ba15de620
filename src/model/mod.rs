//! # Reference Model
//!
//! An in-memory, fully ordered rendition of the logical state of a
//! transactional multi-bucket key-value store. It is written from the store's
//! documented semantics only and shares no code with any engine.
//!
//! The model tracks three things:
//!
//! - **working**: the open write transaction; every mutation lands here.
//! - **committed**: the last durable snapshot.
//! - **readers**: deep copies of `committed`, one per open read-only
//!   transaction, in creation order.
//!
//! ## Transactions
//!
//! `commit` copies working → committed, `rollback` copies committed →
//! working. Either one with `reset = true` additionally retires every open
//! reader. `kill` models a process crash: working falls back to committed and
//! all readers are dropped.
//!
//! ## Preconditions
//!
//! The operation generator only ever offers legal operations. Methods still
//! validate their preconditions and return [`ModelError`] so that a generator
//! bug halts the run with a precise message instead of letting the model
//! drift from the engine.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

use thiserror::Error;
use tracing::trace;

use crate::canonical::{Digest, store_digest};

/// Ordered key → value mapping of one bucket.
pub type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

/// Ordered bucket name → [`Bucket`] mapping.
pub type Store = BTreeMap<Vec<u8>, Bucket>;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// A precondition of a model operation was not met.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// The bucket does not exist in the working state.
    #[error("bucket {bucket} does not exist")]
    MissingBucket {
        /// Hex-encoded bucket name.
        bucket: String,
    },

    /// The key does not exist in the bucket.
    #[error("key {key} does not exist in bucket {bucket}")]
    MissingKey {
        /// Hex-encoded bucket name.
        bucket: String,
        /// Hex-encoded key.
        key: String,
    },
}

impl ModelError {
    fn missing_bucket(bucket: &[u8]) -> Self {
        Self::MissingBucket {
            bucket: hex::encode(bucket),
        }
    }

    fn missing_key(bucket: &[u8], key: &[u8]) -> Self {
        Self::MissingKey {
            bucket: hex::encode(bucket),
            key: hex::encode(key),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Returns `prefix ‖ i` with `i` as a single big-endian byte.
pub fn numbered(prefix: &[u8], i: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1);
    out.extend_from_slice(prefix);
    out.push(i);
    out
}

// ------------------------------------------------------------------------------------------------
// Reference model
// ------------------------------------------------------------------------------------------------

/// Logical state of the store under test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceModel {
    working: Store,
    committed: Store,
    readers: Vec<Store>,
}

impl ReferenceModel {
    /// An empty store with no readers.
    pub fn new() -> Self {
        Self::default()
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn working(&self) -> &Store {
        &self.working
    }

    pub fn committed(&self) -> &Store {
        &self.committed
    }

    /// Open reader snapshots, oldest first.
    pub fn readers(&self) -> &[Store] {
        &self.readers
    }

    pub fn has_bucket(&self, bucket: &[u8]) -> bool {
        self.working.contains_key(bucket)
    }

    pub fn has_key(&self, bucket: &[u8], key: &[u8]) -> bool {
        self.working
            .get(bucket)
            .is_some_and(|kvs| kvs.contains_key(key))
    }

    /// Names of all buckets in the working state, ascending.
    pub fn bucket_names(&self) -> Vec<Vec<u8>> {
        self.working.keys().cloned().collect()
    }

    /// Names of buckets holding at least one key, ascending.
    pub fn non_empty_buckets(&self) -> Vec<Vec<u8>> {
        self.working
            .iter()
            .filter(|(_, kvs)| !kvs.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Keys of `bucket`, ascending. Empty if the bucket does not exist.
    pub fn keys(&self, bucket: &[u8]) -> Vec<Vec<u8>> {
        self.working
            .get(bucket)
            .map(|kvs| kvs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Zero-based position of `key` in the ascending key order of `bucket`.
    pub fn rank_of(&self, bucket: &[u8], key: &[u8]) -> Option<usize> {
        let kvs = self.working.get(bucket)?;
        if !kvs.contains_key(key) {
            return None;
        }
        Some(kvs.range::<[u8], _>((Unbounded, Excluded(key))).count())
    }

    /// Digest of the working state.
    pub fn working_digest(&self) -> Digest {
        store_digest(&self.working)
    }

    /// Digest of the committed state.
    pub fn committed_digest(&self) -> Digest {
        store_digest(&self.committed)
    }

    /// Digests of every open reader, oldest first.
    pub fn reader_digests(&self) -> Vec<Digest> {
        self.readers.iter().map(store_digest).collect()
    }

    // --------------------------------------------------------------------------------------------
    // Bucket operations
    // --------------------------------------------------------------------------------------------

    /// Adds an empty bucket. Returns `false` (and changes nothing) if the
    /// bucket already exists.
    pub fn create_bucket(&mut self, bucket: &[u8]) -> bool {
        if self.working.contains_key(bucket) {
            return false;
        }
        self.working.insert(bucket.to_vec(), Bucket::new());
        true
    }

    /// Removes a bucket and everything in it.
    pub fn drop_bucket(&mut self, bucket: &[u8]) -> Result<(), ModelError> {
        self.working
            .remove(bucket)
            .map(|_| ())
            .ok_or_else(|| ModelError::missing_bucket(bucket))
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts or overwrites `key`.
    pub fn put(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<(), ModelError> {
        self.bucket_mut(bucket)?
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Writes `key_prefix‖i → value_prefix‖i` for `i` in `0..n`, ascending.
    pub fn put_n(
        &mut self,
        bucket: &[u8],
        key_prefix: &[u8],
        value_prefix: &[u8],
        n: u8,
    ) -> Result<(), ModelError> {
        let kvs = self.bucket_mut(bucket)?;
        for i in 0..n {
            kvs.insert(numbered(key_prefix, i), numbered(value_prefix, i));
        }
        Ok(())
    }

    /// Same as [`put_n`](Self::put_n) but applied in descending order of `i`.
    pub fn put_n_rev(
        &mut self,
        bucket: &[u8],
        key_prefix: &[u8],
        value_prefix: &[u8],
        n: u8,
    ) -> Result<(), ModelError> {
        let kvs = self.bucket_mut(bucket)?;
        for i in (0..n).rev() {
            kvs.insert(numbered(key_prefix, i), numbered(value_prefix, i));
        }
        Ok(())
    }

    /// Overwrites the value of an existing key.
    pub fn change(&mut self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<(), ModelError> {
        let slot = self
            .bucket_mut(bucket)?
            .get_mut(key)
            .ok_or_else(|| ModelError::missing_key(bucket, key))?;
        *slot = value.to_vec();
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Deletes
    // --------------------------------------------------------------------------------------------

    /// Removes an existing key.
    pub fn del(&mut self, bucket: &[u8], key: &[u8]) -> Result<(), ModelError> {
        self.bucket_mut(bucket)?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ModelError::missing_key(bucket, key))
    }

    /// Cursor-based delete. Logically identical to [`del`](Self::del); the
    /// engine exercises a different code path for it.
    pub fn del_cursor(&mut self, bucket: &[u8], key: &[u8]) -> Result<(), ModelError> {
        self.del(bucket, key)
    }

    /// Deletes up to `n` keys starting at `start_key`, ascending. Stops early
    /// at the end of the bucket. Returns the number of keys removed.
    pub fn del_n(&mut self, bucket: &[u8], start_key: &[u8], n: u8) -> Result<usize, ModelError> {
        let kvs = self.bucket_mut(bucket)?;
        if !kvs.contains_key(start_key) {
            return Err(ModelError::missing_key(bucket, start_key));
        }
        let doomed: Vec<Vec<u8>> = kvs
            .range::<[u8], _>((Included(start_key), Unbounded))
            .take(usize::from(n))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            kvs.remove(key);
        }
        trace!(count = doomed.len(), "model del_n");
        Ok(doomed.len())
    }

    /// Deletes up to `n` keys ending at (and including) `start_key`,
    /// descending. `n` is clamped to the number of keys at or before
    /// `start_key`, so the range never wraps past the first key. Returns the
    /// number of keys removed.
    pub fn del_n_rev(
        &mut self,
        bucket: &[u8],
        start_key: &[u8],
        n: u8,
    ) -> Result<usize, ModelError> {
        let n = self.clamp_rev_count(bucket, start_key, n)?;
        let kvs = self.bucket_mut(bucket)?;
        let doomed: Vec<Vec<u8>> = kvs
            .range::<[u8], _>((Unbounded, Included(start_key)))
            .rev()
            .take(usize::from(n))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            kvs.remove(key);
        }
        trace!(count = doomed.len(), "model del_n_rev");
        Ok(doomed.len())
    }

    /// Clamps a reverse-delete count to `rank_of(start_key) + 1`.
    pub fn clamp_rev_count(&self, bucket: &[u8], start_key: &[u8], n: u8) -> Result<u8, ModelError> {
        if !self.has_bucket(bucket) {
            return Err(ModelError::missing_bucket(bucket));
        }
        let rank = self
            .rank_of(bucket, start_key)
            .ok_or_else(|| ModelError::missing_key(bucket, start_key))?;
        let at_or_before = u8::try_from(rank + 1).unwrap_or(u8::MAX);
        Ok(n.min(at_or_before))
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    /// Makes the working state durable. With `reset`, retires all readers.
    pub fn commit(&mut self, reset: bool) {
        self.committed = self.working.clone();
        if reset {
            self.readers.clear();
        }
    }

    /// Discards uncommitted changes. With `reset`, retires all readers.
    pub fn rollback(&mut self, reset: bool) {
        self.working = self.committed.clone();
        if reset {
            self.readers.clear();
        }
    }

    /// Opens a reader over the committed state.
    pub fn create_reader(&mut self) {
        self.readers.push(self.committed.clone());
    }

    /// Process crash and restart: uncommitted work and readers are lost.
    pub fn kill(&mut self) {
        self.working = self.committed.clone();
        self.readers.clear();
    }

    fn bucket_mut(&mut self, bucket: &[u8]) -> Result<&mut Bucket, ModelError> {
        self.working
            .get_mut(bucket)
            .ok_or_else(|| ModelError::missing_bucket(bucket))
    }
}
