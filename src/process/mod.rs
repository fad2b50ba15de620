//! # Engine Process Lifecycle
//!
//! Starts the engine under test as a child process, talks to it through a
//! [`ProtocolClient`] over its stdin/stdout, and stops or restarts it.
//!
//! ## Invocation
//!
//! ```text
//! <engine_binary> [engine_args…] --test <db path>
//! ```
//!
//! stderr is inherited so engine diagnostics land in the test output.
//!
//! ## Reply deadline
//!
//! A background thread reads the engine's stdout line by line and forwards
//! each line over a channel. The protocol client reads from that channel, so
//! a wait longer than [`HarnessConfig::reply_timeout`] surfaces as
//! [`ProtocolError::Timeout`]. The hung child is then killed so that stopping
//! it cannot block.
//!
//! ## Stop and restart
//!
//! [`EngineProcess::stop`] closes the command channel and waits for the child
//! to exit. The exit status is only logged; a child that died early shows up
//! as a disconnect on the next protocol call instead.
//!
//! [`EngineSession::kill`] sends `kill`, tolerates the engine vanishing
//! without a reply, waits for the old process to exit and only then starts a
//! fresh one over the same database path.
//!
//! ## Ownership
//!
//! An [`EngineSession`] owns the temporary directory that holds the database
//! file. Dropping the session stops the engine first and then deletes the
//! directory.

#[cfg(test)]
mod tests;

use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::canonical::Digest;
use crate::protocol::{Command, ProtocolClient, ProtocolError};
use crate::{HarnessConfig, HarnessError};

/// Flag that puts the engine into test/oracle mode.
pub const TEST_MODE_FLAG: &str = "--test";

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised while managing or talking to the engine process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The engine binary could not be launched.
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        /// Path of the binary.
        binary: String,
        /// Underlying OS error.
        source: io::Error,
    },

    /// Underlying I/O error while waiting for the child.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stdio pipe was not captured.
    #[error("engine {0} pipe unavailable")]
    MissingPipe(&'static str),

    /// No engine process is running.
    #[error("engine is not running")]
    NotRunning,

    /// Protocol failure while talking to the engine.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// ------------------------------------------------------------------------------------------------
// Reply reader
// ------------------------------------------------------------------------------------------------

/// Engine stdout, read on a background thread and handed over line by line.
///
/// End of stream is reported once the thread is gone. A line that does not
/// arrive within `timeout` is reported as [`io::ErrorKind::TimedOut`].
pub struct ReplyReader {
    lines: Receiver<io::Result<Vec<u8>>>,
    timeout: Option<Duration>,
    buf: Vec<u8>,
    pos: usize,
}

impl ReplyReader {
    /// Starts the thread that drains `stdout`.
    pub fn spawn(stdout: impl Read + Send + 'static, timeout: Option<Duration>) -> io::Result<Self> {
        let (sender, lines) = channel::unbounded();
        thread::Builder::new()
            .name("kvoracle-reply".into())
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    let mut line = Vec::new();
                    match stdout.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            if sender.send(Ok(line)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = sender.send(Err(e));
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            lines,
            timeout,
            buf: Vec::new(),
            pos: 0,
        })
    }
}

impl Read for ReplyReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for ReplyReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos >= self.buf.len() {
            let next = match self.timeout {
                Some(timeout) => self.lines.recv_timeout(timeout),
                None => self.lines.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(Ok(line)) => {
                    self.buf = line;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no reply from engine",
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(&[]),
            }
        }
        Ok(&self.buf[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.buf.len());
    }
}

// ------------------------------------------------------------------------------------------------
// Engine process
// ------------------------------------------------------------------------------------------------

/// One running engine child plus its protocol client.
pub struct EngineProcess {
    child: Child,
    client: ProtocolClient<ChildStdin, ReplyReader>,
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess")
            .field("pid", &self.child.id())
            .field("commands_sent", &self.client.commands_sent())
            .finish_non_exhaustive()
    }
}

impl EngineProcess {
    /// Launches the engine against `db_path`.
    pub fn start(config: &HarnessConfig, db_path: &Path) -> Result<Self, ProcessError> {
        let mut child = ProcessCommand::new(&config.engine_binary)
            .args(&config.engine_args)
            .arg(TEST_MODE_FLAG)
            .arg(db_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                binary: config.engine_binary.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout: ChildStdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
        let replies = match ReplyReader::spawn(stdout, config.reply_timeout) {
            Ok(replies) => replies,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        info!(
            pid = child.id(),
            binary = %config.engine_binary.display(),
            db = %db_path.display(),
            "engine started"
        );

        Ok(Self {
            child,
            client: ProtocolClient::new(stdin, replies),
        })
    }

    /// Process id of the child.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Sends one command and waits for its acknowledgement.
    pub fn send(&mut self, cmd: &Command) -> Result<String, ProcessError> {
        self.client.send(cmd).map_err(|e| self.fail(e))
    }

    /// Sends a command after which the engine may exit without replying.
    pub fn send_expect_exit(&mut self, cmd: &Command) -> Result<Option<String>, ProcessError> {
        self.client.send_expect_exit(cmd).map_err(|e| self.fail(e))
    }

    // A timed-out engine is killed so that `stop` does not wait on it.
    fn fail(&mut self, e: ProtocolError) -> ProcessError {
        if let ProtocolError::Timeout { command } = e {
            warn!(pid = self.child.id(), command, "engine hung; killing it");
            if let Err(kill) = self.child.kill() {
                warn!(error = %kill, "failed to kill hung engine");
            }
        }
        e.into()
    }

    /// Closes the command channel and waits for the child to exit.
    pub fn stop(self) -> Result<ExitStatus, ProcessError> {
        let Self { mut child, client } = self;
        let pid = child.id();
        let (stdin, stdout) = client.into_inner();
        drop(stdin);
        drop(stdout);

        let status = child.wait()?;
        if status.success() {
            info!(pid, "engine stopped");
        } else {
            warn!(pid, %status, "engine exited with failure status");
        }
        Ok(status)
    }
}

// ------------------------------------------------------------------------------------------------
// Engine session
// ------------------------------------------------------------------------------------------------

/// An engine process bound to a private database directory, across restarts.
pub struct EngineSession {
    config: HarnessConfig,
    db_path: PathBuf,
    process: Option<EngineProcess>,
    restarts: u64,
    // Declared last: removed only after the process has been stopped.
    dir: tempfile::TempDir,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("db_path", &self.db_path)
            .field("process", &self.process)
            .field("restarts", &self.restarts)
            .finish_non_exhaustive()
    }
}

impl EngineSession {
    /// Validates `config`, creates a scratch directory and starts the engine.
    pub fn start(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let dir = tempfile::Builder::new().prefix("kvoracle-").tempdir()?;
        let db_path = dir.path().join(&config.db_file_name);
        let process = EngineProcess::start(&config, &db_path)?;
        info!(db = %db_path.display(), "session started");

        Ok(Self {
            config,
            db_path,
            process: Some(process),
            restarts: 0,
            dir,
        })
    }

    /// Path of the database file handed to the engine.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Directory owned by this session.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Number of completed `kill` restarts.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Sends one command and waits for its acknowledgement.
    pub fn send(&mut self, cmd: &Command) -> Result<String, ProcessError> {
        self.process.as_mut().ok_or(ProcessError::NotRunning)?.send(cmd)
    }

    /// Asks the engine to verify its live write transaction digest.
    pub fn ensure_hash(&mut self, expected: Digest) -> Result<(), ProcessError> {
        self.send(&Command::EnsureHash(expected)).map(drop)
    }

    /// Asks the engine to verify one digest per open reader, oldest first.
    pub fn ensure_reader_hashes(&mut self, expected: &[Digest]) -> Result<(), ProcessError> {
        self.send(&Command::EnsureReaderHashes(expected.to_vec()))
            .map(drop)
    }

    /// Crashes the engine and brings a new one up over the same database.
    pub fn kill(&mut self) -> Result<(), ProcessError> {
        let mut process = self.process.take().ok_or(ProcessError::NotRunning)?;
        let reply = process.send_expect_exit(&Command::Kill)?;
        debug!(?reply, "kill sent");
        process.stop()?;

        self.process = Some(EngineProcess::start(&self.config, &self.db_path)?);
        self.restarts += 1;
        info!(restarts = self.restarts, "engine restarted");
        Ok(())
    }

    /// Stops the engine. Further commands fail with [`ProcessError::NotRunning`].
    pub fn stop(&mut self) -> Result<(), ProcessError> {
        match self.process.take() {
            Some(process) => process.stop().map(drop),
            None => Ok(()),
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop engine on drop");
        }
    }
}
