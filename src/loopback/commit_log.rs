//! Append-only commit log used by the loopback engine for durability.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC "KVLB"][VERSION_LE][HEADER_CRC32_LE]
//! [REC_LEN_LE][STORE_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][STORE_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! Each record holds a complete committed [`Store`]; the CRC covers
//! `len || store_bytes`. Every append is followed by `fsync`.
//!
//! Recovery returns the last record whose checksum verifies. A torn or
//! corrupted tail is cut off so later appends start on a clean boundary.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use crc32fast::Hasher as Crc32;
use tracing::{info, trace, warn};

use super::LoopbackError;
use crate::encoding::{decode_exact, encode_to_vec};
use crate::model::Store;

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// File identification bytes.
pub const MAGIC: [u8; 4] = *b"KVLB";

/// Current format version.
pub const VERSION: u32 = 1;

/// Header length including its checksum.
pub const HEADER_LEN: usize = MAGIC.len() + 2 * U32_SIZE;

fn crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

fn read_u32(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; U32_SIZE] = buf.get(..U32_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Durable log of committed stores.
#[derive(Debug)]
pub struct CommitLog {
    file: File,
    path: PathBuf,
    records: u64,
}

impl CommitLog {
    /// Opens (or creates) the log and recovers the newest committed store.
    ///
    /// Returns `None` as the store when nothing was ever committed.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Option<Store>), LoopbackError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        if contents.is_empty() {
            let version = VERSION.to_le_bytes();
            let checksum = crc(&[&MAGIC[..], &version[..]]);
            file.write_all(&MAGIC)?;
            file.write_all(&version)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.sync_all()?;
            info!(path = %path.display(), "created commit log");
            return Ok((
                Self {
                    file,
                    path,
                    records: 0,
                },
                None,
            ));
        }

        Self::check_header(&contents)?;

        let mut offset = HEADER_LEN;
        let mut records = 0u64;
        let mut latest = None;
        while offset < contents.len() {
            match Self::read_record(&contents[offset..]) {
                Some((store, used)) => {
                    latest = Some(store);
                    records += 1;
                    offset += used;
                }
                None => break,
            }
        }

        if offset < contents.len() {
            warn!(
                path = %path.display(),
                valid = offset,
                total = contents.len(),
                "discarding torn commit log tail"
            );
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }

        info!(path = %path.display(), records, "recovered commit log");
        Ok((
            Self {
                file,
                path,
                records,
            },
            latest,
        ))
    }

    /// Appends `store` as the newest committed state and syncs it.
    pub fn append(&mut self, store: &Store) -> Result<(), LoopbackError> {
        let body = encode_to_vec(store)?;
        let len = u32::try_from(body.len())
            .map_err(|_| LoopbackError::RecordTooLarge(body.len()))?
            .to_le_bytes();
        let checksum = crc(&[&len[..], &body[..]]);

        self.file.write_all(&len)?;
        self.file.write_all(&body)?;
        self.file.write_all(&checksum.to_le_bytes())?;
        self.file.sync_all()?;

        self.records += 1;
        trace!(bytes = body.len(), checksum, "appended commit");
        Ok(())
    }

    /// Number of valid records, recovered plus appended.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_header(contents: &[u8]) -> Result<(), LoopbackError> {
        if contents.len() < HEADER_LEN {
            return Err(LoopbackError::InvalidHeader("truncated header".into()));
        }
        let (magic, rest) = contents.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(LoopbackError::InvalidHeader("bad magic".into()));
        }
        let version = read_u32(rest).unwrap_or_default();
        let stored = read_u32(&rest[U32_SIZE..]).unwrap_or_default();
        if stored != crc(&[magic, &rest[..U32_SIZE]]) {
            return Err(LoopbackError::InvalidHeader("header checksum mismatch".into()));
        }
        if version != VERSION {
            return Err(LoopbackError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }
        Ok(())
    }

    /// Decodes one record, or `None` if it is torn or corrupted.
    fn read_record(buf: &[u8]) -> Option<(Store, usize)> {
        let len = read_u32(buf)? as usize;
        let body = buf.get(U32_SIZE..U32_SIZE + len)?;
        let stored = read_u32(buf.get(U32_SIZE + len..)?)?;
        if stored != crc(&[&buf[..U32_SIZE], body]) {
            return None;
        }
        let store = decode_exact(body).ok()?;
        Some((store, 2 * U32_SIZE + len))
    }
}
