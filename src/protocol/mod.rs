//! # Command Protocol
//!
//! Line-oriented, half-duplex protocol used to drive an engine process.
//!
//! ## Wire format
//!
//! ```text
//! <operation>,<hex(arg1)>,<hex(arg2)>,...\n
//! ```
//!
//! Every argument is lowercase hex regardless of its meaning (bucket name,
//! key, value, one-byte count, digest), so binary payloads never collide with
//! the `,` and `\n` delimiters. A command without arguments is written as
//! `<operation>,` and parsers accept it with or without the trailing comma.
//!
//! ## Acknowledgements
//!
//! After each command the engine writes exactly one line. Its content carries
//! no data; receiving it proves the engine finished the command. A reply
//! starting with `error` is an engine-side rejection (for example a hash that
//! did not match). End of stream instead of a reply means the engine is gone.
//!
//! The client itself blocks until a line arrives. A reader that gives up with
//! [`io::ErrorKind::TimedOut`] turns the wait into [`ProtocolError::Timeout`];
//! the process layer supplies such a reader so a hung engine cannot stall a
//! run forever.
//!
//! The client takes `&mut self` for every call, so a second command can never
//! be issued before the previous acknowledgement has been read.


use std::io::{self, BufRead, Write};

use thiserror::Error;
use tracing::{debug, trace};

use crate::canonical::Digest;

/// Prefix of an acknowledgement that reports a failure.
pub const REJECT_PREFIX: &str = "error";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised while talking to an engine.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine closed its end before acknowledging.
    #[error("engine disconnected while handling `{command}`")]
    Disconnected {
        /// Wire name of the command in flight.
        command: &'static str,
    },

    /// No acknowledgement arrived within the reply deadline.
    #[error("engine did not acknowledge `{command}` in time")]
    Timeout {
        /// Wire name of the command in flight.
        command: &'static str,
    },

    /// The engine acknowledged with an error reply.
    #[error("engine rejected `{command}`: {reply}")]
    Rejected {
        /// Wire name of the rejected command.
        command: &'static str,
        /// The reply line, without the trailing newline.
        reply: String,
    },

    /// A command line could not be parsed.
    #[error("malformed command line: {0}")]
    Parse(String),

    /// A field was not valid hex.
    #[error("invalid hex field: {0}")]
    Hex(#[from] hex::FromHexError),
}

// ------------------------------------------------------------------------------------------------
// Commands
// ------------------------------------------------------------------------------------------------

/// One wire command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateBucket {
        bucket: Vec<u8>,
    },
    DropBucket {
        bucket: Vec<u8>,
    },
    Put {
        bucket: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    PutN {
        bucket: Vec<u8>,
        key_prefix: Vec<u8>,
        value_prefix: Vec<u8>,
        n: u8,
    },
    PutNRev {
        bucket: Vec<u8>,
        key_prefix: Vec<u8>,
        value_prefix: Vec<u8>,
        n: u8,
    },
    Del {
        bucket: Vec<u8>,
        key: Vec<u8>,
    },
    DelCursor {
        bucket: Vec<u8>,
        key: Vec<u8>,
    },
    DelN {
        bucket: Vec<u8>,
        start_key: Vec<u8>,
        n: u8,
    },
    DelNRev {
        bucket: Vec<u8>,
        start_key: Vec<u8>,
        n: u8,
    },
    Commit {
        reset: bool,
    },
    Rollback {
        reset: bool,
    },
    CreateReader,
    Kill,
    /// Expected digest of the engine's live write transaction.
    EnsureHash(Digest),
    /// Expected digests of every open reader, oldest first.
    EnsureReaderHashes(Vec<Digest>),
}

impl Command {
    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateBucket { .. } => "create-bucket",
            Self::DropBucket { .. } => "drop-bucket",
            Self::Put { .. } => "put",
            Self::PutN { .. } => "put-n",
            Self::PutNRev { .. } => "put-n-rev",
            Self::Del { .. } => "del",
            Self::DelCursor { .. } => "del-cursor",
            Self::DelN { .. } => "del-n",
            Self::DelNRev { .. } => "del-n-rev",
            Self::Commit { reset: false } => "commit",
            Self::Commit { reset: true } => "commit-reset",
            Self::Rollback { reset: false } => "rollback",
            Self::Rollback { reset: true } => "rollback-reset",
            Self::CreateReader => "create-reader",
            Self::Kill => "kill",
            Self::EnsureHash(_) => "ensure-hash",
            Self::EnsureReaderHashes(_) => "ensure-reader-hashes",
        }
    }

    /// Positional arguments, in wire order.
    pub fn args(&self) -> Vec<&[u8]> {
        match self {
            Self::CreateBucket { bucket } | Self::DropBucket { bucket } => vec![bucket.as_slice()],
            Self::Put { bucket, key, value } => {
                vec![bucket.as_slice(), key.as_slice(), value.as_slice()]
            }
            Self::PutN {
                bucket,
                key_prefix,
                value_prefix,
                n,
            }
            | Self::PutNRev {
                bucket,
                key_prefix,
                value_prefix,
                n,
            } => vec![
                bucket.as_slice(),
                key_prefix.as_slice(),
                value_prefix.as_slice(),
                std::slice::from_ref(n),
            ],
            Self::Del { bucket, key } | Self::DelCursor { bucket, key } => {
                vec![bucket.as_slice(), key.as_slice()]
            }
            Self::DelN {
                bucket,
                start_key,
                n,
            }
            | Self::DelNRev {
                bucket,
                start_key,
                n,
            } => vec![
                bucket.as_slice(),
                start_key.as_slice(),
                std::slice::from_ref(n),
            ],
            Self::Commit { .. } | Self::Rollback { .. } | Self::CreateReader | Self::Kill => {
                Vec::new()
            }
            Self::EnsureHash(digest) => vec![digest.as_bytes().as_slice()],
            Self::EnsureReaderHashes(digests) => digests
                .iter()
                .map(|d| d.as_bytes().as_slice())
                .collect(),
        }
    }

    /// Renders the command as one wire line, without the trailing newline.
    pub fn to_line(&self) -> String {
        let fields: Vec<String> = self.args().into_iter().map(hex::encode).collect();
        format!("{},{}", self.name(), fields.join(","))
    }

    /// Parses one wire line (trailing `\r\n` / `\n` is ignored).
    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split(',');
        let name = parts.next().unwrap_or_default();
        let raw: Vec<&str> = parts.collect();

        let fields = |arity: usize| -> Result<Vec<Vec<u8>>, ProtocolError> {
            // `op,` is the zero-argument form.
            let raw: &[&str] = if arity == 0 && raw == [""] { &[] } else { &raw };
            if raw.len() != arity {
                return Err(ProtocolError::Parse(format!(
                    "`{name}` takes {arity} field(s), got {}",
                    raw.len()
                )));
            }
            raw.iter()
                .map(|f| hex::decode(f).map_err(ProtocolError::from))
                .collect()
        };

        let cmd = match name {
            "create-bucket" | "drop-bucket" => {
                let [bucket] = take::<1>(fields(1)?)?;
                if name == "create-bucket" {
                    Self::CreateBucket { bucket }
                } else {
                    Self::DropBucket { bucket }
                }
            }
            "put" => {
                let [bucket, key, value] = take::<3>(fields(3)?)?;
                Self::Put { bucket, key, value }
            }
            "put-n" | "put-n-rev" => {
                let [bucket, key_prefix, value_prefix, n] = take::<4>(fields(4)?)?;
                let n = count_byte(&n)?;
                if name == "put-n" {
                    Self::PutN {
                        bucket,
                        key_prefix,
                        value_prefix,
                        n,
                    }
                } else {
                    Self::PutNRev {
                        bucket,
                        key_prefix,
                        value_prefix,
                        n,
                    }
                }
            }
            "del" | "del-cursor" => {
                let [bucket, key] = take::<2>(fields(2)?)?;
                if name == "del" {
                    Self::Del { bucket, key }
                } else {
                    Self::DelCursor { bucket, key }
                }
            }
            "del-n" | "del-n-rev" => {
                let [bucket, start_key, n] = take::<3>(fields(3)?)?;
                let n = count_byte(&n)?;
                if name == "del-n" {
                    Self::DelN {
                        bucket,
                        start_key,
                        n,
                    }
                } else {
                    Self::DelNRev {
                        bucket,
                        start_key,
                        n,
                    }
                }
            }
            "commit" | "commit-reset" => {
                fields(0)?;
                Self::Commit {
                    reset: name == "commit-reset",
                }
            }
            "rollback" | "rollback-reset" => {
                fields(0)?;
                Self::Rollback {
                    reset: name == "rollback-reset",
                }
            }
            "create-reader" => {
                fields(0)?;
                Self::CreateReader
            }
            "kill" => {
                fields(0)?;
                Self::Kill
            }
            "ensure-hash" => {
                let [digest] = take::<1>(fields(1)?)?;
                Self::EnsureHash(parse_digest(&digest)?)
            }
            "ensure-reader-hashes" => {
                let raw: &[&str] = if raw == [""] { &[] } else { &raw };
                let digests = raw
                    .iter()
                    .map(|f| parse_digest(&hex::decode(f)?))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::EnsureReaderHashes(digests)
            }
            other => return Err(ProtocolError::Parse(format!("unknown operation `{other}`"))),
        };
        Ok(cmd)
    }
}

fn take<const N: usize>(fields: Vec<Vec<u8>>) -> Result<[Vec<u8>; N], ProtocolError> {
    fields
        .try_into()
        .map_err(|v: Vec<Vec<u8>>| ProtocolError::Parse(format!("expected {N} fields, got {}", v.len())))
}

fn count_byte(field: &[u8]) -> Result<u8, ProtocolError> {
    match field {
        [n] => Ok(*n),
        _ => Err(ProtocolError::Parse(format!(
            "count must be exactly one byte, got {}",
            field.len()
        ))),
    }
}

fn parse_digest(field: &[u8]) -> Result<Digest, ProtocolError> {
    Digest::from_slice(field)
        .ok_or_else(|| ProtocolError::Parse(format!("digest must be 32 bytes, got {}", field.len())))
}

// ------------------------------------------------------------------------------------------------
// Client
// ------------------------------------------------------------------------------------------------

/// Synchronous request/acknowledge client over a pair of byte streams.
pub struct ProtocolClient<W: Write, R: BufRead> {
    writer: W,
    reader: R,
    sent: u64,
}

impl<W: Write, R: BufRead> ProtocolClient<W, R> {
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            writer,
            reader,
            sent: 0,
        }
    }

    /// Number of commands written so far.
    pub fn commands_sent(&self) -> u64 {
        self.sent
    }

    /// Sends `cmd` and blocks for its acknowledgement.
    ///
    /// Returns the reply line without its newline.
    pub fn send(&mut self, cmd: &Command) -> Result<String, ProtocolError> {
        match self.round_trip(cmd)? {
            Some(reply) => Ok(reply),
            None => Err(ProtocolError::Disconnected {
                command: cmd.name(),
            }),
        }
    }

    /// Like [`send`](Self::send), but end of stream is an accepted outcome.
    ///
    /// Used for commands after which the engine may exit without replying.
    pub fn send_expect_exit(&mut self, cmd: &Command) -> Result<Option<String>, ProtocolError> {
        match self.round_trip(cmd) {
            Err(ProtocolError::Disconnected { .. }) => Ok(None),
            other => other,
        }
    }

    /// Gives back the underlying streams.
    pub fn into_inner(self) -> (W, R) {
        (self.writer, self.reader)
    }

    fn round_trip(&mut self, cmd: &Command) -> Result<Option<String>, ProtocolError> {
        let name = cmd.name();
        let mut line = cmd.to_line();
        trace!(line = %line, "send");
        line.push('\n');

        self.sent += 1;
        if let Err(e) = self
            .writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.flush())
        {
            return Err(disconnect_or_io(e, name));
        }

        let mut reply = String::new();
        let read = self
            .reader
            .read_line(&mut reply)
            .map_err(|e| disconnect_or_io(e, name))?;
        if read == 0 {
            return Err(ProtocolError::Disconnected { command: name });
        }
        let reply = reply.trim_end_matches(['\r', '\n']).to_string();
        debug!(command = name, seq = self.sent, reply = %reply, "ack");

        if reply.starts_with(REJECT_PREFIX) {
            return Err(ProtocolError::Rejected {
                command: name,
                reply,
            });
        }
        Ok(Some(reply))
    }
}

fn disconnect_or_io(e: io::Error, command: &'static str) -> ProtocolError {
    match e.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
            ProtocolError::Disconnected { command }
        }
        io::ErrorKind::TimedOut => ProtocolError::Timeout { command },
        _ => ProtocolError::Io(e),
    }
}
