//! # Loopback Engine
//!
//! A small engine that speaks the command protocol over any pair of streams,
//! used to exercise the harness end to end without an external binary. The
//! `kv-loopback` executable wraps [`serve`] around stdin/stdout.
//!
//! It keeps a working store, the committed store and reader snapshots in
//! memory, and makes commits durable through a [`CommitLog`]. Range deletes
//! walk the ordered map with a cursor, one neighbour at a time, which keeps
//! the code path independent of the reference model's range collection.
//!
//! ## Replies
//!
//! - `ok` after every successfully applied command;
//! - `error: <reason>` when a command is malformed, violates a precondition,
//!   or an `ensure-*` check finds a different digest;
//! - nothing at all for `kill`: the process exits immediately, leaving any
//!   uncommitted work behind, as a crash would.
//!
//! ## Injected faults
//!
//! A [`Fault`] turns the engine into a deliberately broken one, which lets the
//! harness prove it notices divergence.


pub mod commit_log;

use std::io::{self, BufRead, Write};
use std::ops::Bound::{Excluded, Unbounded};
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, warn};

pub use commit_log::CommitLog;

use crate::canonical::store_digest;
use crate::encoding::EncodingError;
use crate::model::{Bucket, Store, numbered};
use crate::protocol::Command;

/// Acknowledgement written after a successful command.
pub const ACK_OK: &str = "ok";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Failures that stop the loopback engine.
#[derive(Debug, Error)]
pub enum LoopbackError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The commit log header is unusable.
    #[error("invalid commit log header: {0}")]
    InvalidHeader(String),

    /// A committed store is too large for one log record.
    #[error("commit record too large ({0} bytes)")]
    RecordTooLarge(usize),

    /// Unknown `--fault` name.
    #[error("unknown fault `{0}`")]
    UnknownFault(String),
}

// ------------------------------------------------------------------------------------------------
// Faults
// ------------------------------------------------------------------------------------------------

/// A deliberate deviation from correct store semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Commits are applied in memory but never reach the commit log.
    LoseCommits,
    /// Rollback leaves uncommitted writes in place.
    StickyRollback,
}

impl FromStr for Fault {
    type Err = LoopbackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lose-commits" => Ok(Self::LoseCommits),
            "sticky-rollback" => Ok(Self::StickyRollback),
            other => Err(LoopbackError::UnknownFault(other.to_string())),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// What the server loop should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Write this line and continue.
    Line(String),
    /// Stop without writing anything.
    Exit,
}

impl Reply {
    fn reject(reason: impl std::fmt::Display) -> Self {
        Self::Line(format!("error: {reason}"))
    }
}

/// In-memory store state backed by a commit log.
#[derive(Debug)]
pub struct LoopbackEngine {
    log: CommitLog,
    working: Store,
    committed: Store,
    readers: Vec<Store>,
    fault: Option<Fault>,
}

impl LoopbackEngine {
    /// Opens the database file at `path`, recovering the last commit.
    pub fn open(path: impl AsRef<Path>, fault: Option<Fault>) -> Result<Self, LoopbackError> {
        let (log, recovered) = CommitLog::open(path)?;
        let committed = recovered.unwrap_or_default();
        info!(
            buckets = committed.len(),
            commits = log.records(),
            ?fault,
            "loopback engine opened"
        );
        Ok(Self {
            log,
            working: committed.clone(),
            committed,
            readers: Vec::new(),
            fault,
        })
    }

    pub fn working(&self) -> &Store {
        &self.working
    }

    pub fn committed(&self) -> &Store {
        &self.committed
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Applies one command and returns the reply to send.
    ///
    /// Only I/O failures of the commit log are errors; everything a client
    /// can cause is reported as an `error:` reply.
    pub fn apply(&mut self, cmd: Command) -> Result<Reply, LoopbackError> {
        let reply = match cmd {
            Command::CreateBucket { bucket } => {
                self.working.entry(bucket).or_default();
                Reply::Line(ACK_OK.into())
            }
            Command::DropBucket { bucket } => match self.working.remove(&bucket) {
                Some(_) => Reply::Line(ACK_OK.into()),
                None => Reply::reject(format_args!("no bucket {}", hex::encode(&bucket))),
            },
            Command::Put { bucket, key, value } => self.with_bucket(&bucket, |kvs| {
                kvs.insert(key, value);
            }),
            Command::PutN {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => self.with_bucket(&bucket, |kvs| {
                for i in 0..n {
                    kvs.insert(numbered(&key_prefix, i), numbered(&value_prefix, i));
                }
            }),
            Command::PutNRev {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => self.with_bucket(&bucket, |kvs| {
                for i in (0..n).rev() {
                    kvs.insert(numbered(&key_prefix, i), numbered(&value_prefix, i));
                }
            }),
            Command::Del { bucket, key } | Command::DelCursor { bucket, key } => {
                self.with_key(&bucket, &key, |kvs| {
                    kvs.remove(&key);
                })
            }
            Command::DelN {
                bucket,
                start_key,
                n,
            } => self.with_key(&bucket, &start_key, |kvs| {
                let mut cursor = Some(start_key.clone());
                for _ in 0..n {
                    let Some(key) = cursor.take() else { break };
                    cursor = kvs
                        .range::<[u8], _>((Excluded(key.as_slice()), Unbounded))
                        .next()
                        .map(|(k, _)| k.clone());
                    kvs.remove(&key);
                }
            }),
            Command::DelNRev {
                bucket,
                start_key,
                n,
            } => self.with_key(&bucket, &start_key, |kvs| {
                let mut cursor = Some(start_key.clone());
                for _ in 0..n {
                    let Some(key) = cursor.take() else { break };
                    cursor = kvs
                        .range::<[u8], _>((Unbounded, Excluded(key.as_slice())))
                        .next_back()
                        .map(|(k, _)| k.clone());
                    kvs.remove(&key);
                }
            }),
            Command::Commit { reset } => {
                self.committed = self.working.clone();
                if self.fault != Some(Fault::LoseCommits) {
                    self.log.append(&self.committed)?;
                }
                if reset {
                    self.readers.clear();
                }
                Reply::Line(ACK_OK.into())
            }
            Command::Rollback { reset } => {
                if self.fault != Some(Fault::StickyRollback) {
                    self.working = self.committed.clone();
                }
                if reset {
                    self.readers.clear();
                }
                Reply::Line(ACK_OK.into())
            }
            Command::CreateReader => {
                self.readers.push(self.committed.clone());
                Reply::Line(ACK_OK.into())
            }
            Command::Kill => Reply::Exit,
            Command::EnsureHash(expected) => {
                let actual = store_digest(&self.working);
                if actual == expected {
                    Reply::Line(ACK_OK.into())
                } else {
                    Reply::reject(format_args!(
                        "hash mismatch: expected {expected}, have {actual}"
                    ))
                }
            }
            Command::EnsureReaderHashes(expected) => {
                let actual: Vec<_> = self.readers.iter().map(store_digest).collect();
                if actual.len() != expected.len() {
                    Reply::reject(format_args!(
                        "reader count mismatch: expected {}, have {}",
                        expected.len(),
                        actual.len()
                    ))
                } else if let Some(i) = (0..actual.len()).find(|&i| actual[i] != expected[i]) {
                    Reply::reject(format_args!(
                        "reader {i} hash mismatch: expected {}, have {}",
                        expected[i], actual[i]
                    ))
                } else {
                    Reply::Line(ACK_OK.into())
                }
            }
        };
        Ok(reply)
    }

    fn with_bucket(&mut self, bucket: &[u8], f: impl FnOnce(&mut Bucket)) -> Reply {
        match self.working.get_mut(bucket) {
            Some(kvs) => {
                f(kvs);
                Reply::Line(ACK_OK.into())
            }
            None => Reply::reject(format_args!("no bucket {}", hex::encode(bucket))),
        }
    }

    fn with_key(&mut self, bucket: &[u8], key: &[u8], f: impl FnOnce(&mut Bucket)) -> Reply {
        match self.working.get_mut(bucket) {
            Some(kvs) if kvs.contains_key(key) => {
                f(kvs);
                Reply::Line(ACK_OK.into())
            }
            Some(_) => Reply::reject(format_args!(
                "no key {} in bucket {}",
                hex::encode(key),
                hex::encode(bucket)
            )),
            None => Reply::reject(format_args!("no bucket {}", hex::encode(bucket))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Server loop
// ------------------------------------------------------------------------------------------------

/// Reads commands from `input` until end of stream or `kill`, writing one
/// reply line per command to `output`.
pub fn serve<R: BufRead, W: Write>(
    engine: &mut LoopbackEngine,
    mut input: R,
    mut output: W,
) -> Result<(), LoopbackError> {
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            debug!("input closed");
            return Ok(());
        }

        let reply = match Command::parse_line(&line) {
            Ok(cmd) => {
                debug!(command = cmd.name(), "apply");
                engine.apply(cmd)?
            }
            Err(e) => {
                warn!(error = %e, "unparseable command");
                Reply::reject(e)
            }
        };

        match reply {
            Reply::Line(text) => {
                if text != ACK_OK {
                    warn!(reply = %text, "rejecting command");
                }
                output.write_all(text.as_bytes())?;
                output.write_all(b"\n")?;
                output.flush()?;
            }
            Reply::Exit => {
                info!("kill received, exiting without acknowledgement");
                return Ok(());
            }
        }
    }
}
