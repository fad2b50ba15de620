//! # kvoracle
//!
//! A **model-based differential testing harness** for transactional,
//! multi-bucket key-value stores with snapshot-isolated readers,
//! commit/rollback and crash recovery.
//!
//! The harness generates long random sequences of store operations, applies
//! each one to an independent in-memory [`ReferenceModel`] and to a real
//! engine driven as a child process over a line protocol, and after every
//! step asks the engine to confirm that its live state (and every open
//! reader) hashes to the same canonical [`Digest`] as the model. Failing
//! sequences are shrunk by `proptest` to a minimal reproducer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kvoracle::{EngineTarget, HarnessConfig, HarnessError, machine::Differential};
//! use proptest::prelude::ProptestConfig;
//!
//! struct MyEngine;
//!
//! impl EngineTarget for MyEngine {
//!     fn config() -> Result<HarnessConfig, HarnessError> {
//!         Ok(HarnessConfig::new("./bin/engine"))
//!     }
//! }
//!
//! type MyEngineDifferential = Differential<MyEngine>;
//!
//! proptest_state_machine::prop_state_machine! {
//!     #![proptest_config(ProptestConfig { cases: 100, ..ProptestConfig::default() })]
//!
//!     #[test]
//!     fn engine_matches_model(sequential 1..100 => MyEngineDifferential);
//! }
//! ```
//!
//! ## Components
//!
//! - [`canonical`]: framed byte encoding and BLAKE2b-256 digest of a store.
//! - [`model`]: reference model: working, committed and reader snapshots.
//! - [`protocol`]: wire commands and the half-duplex client.
//! - [`process`]: engine child process and session lifecycle.
//! - [`machine`]: operation generator, engine replay and invariants.
//! - [`loopback`]: protocol-conforming engine used for self-tests.

pub mod canonical;
pub mod encoding;
pub mod loopback;
pub mod machine;
pub mod model;
pub mod process;
pub mod protocol;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use canonical::{Digest, store_digest};
pub use machine::{Differential, EngineTarget, ModelMachine, Op};
pub use model::{Bucket, ModelError, ReferenceModel, Store};
pub use process::{EngineProcess, EngineSession, ProcessError};
pub use protocol::{Command, ProtocolClient, ProtocolError};

/// Environment variable naming the engine binary for [`HarnessConfig::from_env`].
pub const ENGINE_ENV: &str = "KVORACLE_ENGINE";

/// Environment variable holding extra whitespace-separated engine arguments.
pub const ENGINE_ARGS_ENV: &str = "KVORACLE_ENGINE_ARGS";

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// How to launch the engine under test.
///
/// # Example
///
/// ```rust
/// use kvoracle::HarnessConfig;
///
/// let config = HarnessConfig {
///     engine_args: vec!["--fault".into(), "lose-commits".into()],
///     ..HarnessConfig::new("/usr/local/bin/engine")
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Engine executable.
    pub engine_binary: PathBuf,

    /// Extra arguments placed before `--test <db path>`.
    ///
    /// Default: none.
    pub engine_args: Vec<String>,

    /// Name of the database file inside the session's scratch directory.
    ///
    /// Default: `db.kv`. Must be a plain file name.
    pub db_file_name: String,

    /// How long to wait for each acknowledgement before declaring the engine
    /// hung. `None` waits forever.
    ///
    /// Default: 30 s. Must be non-zero when set.
    pub reply_timeout: Option<Duration>,
}

impl HarnessConfig {
    /// Default database file name.
    pub const DEFAULT_DB_FILE_NAME: &'static str = "db.kv";

    /// Default acknowledgement deadline.
    pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

    /// Configuration for `engine_binary` with default settings.
    pub fn new(engine_binary: impl Into<PathBuf>) -> Self {
        Self {
            engine_binary: engine_binary.into(),
            engine_args: Vec::new(),
            db_file_name: Self::DEFAULT_DB_FILE_NAME.to_string(),
            reply_timeout: Some(Self::DEFAULT_REPLY_TIMEOUT),
        }
    }

    /// Reads [`ENGINE_ENV`] and the optional [`ENGINE_ARGS_ENV`].
    pub fn from_env() -> Result<Self, HarnessError> {
        let binary = std::env::var_os(ENGINE_ENV)
            .ok_or_else(|| HarnessError::InvalidConfig(format!("{ENGINE_ENV} is not set")))?;
        let engine_args = std::env::var(ENGINE_ARGS_ENV)
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let config = Self {
            engine_args,
            ..Self::new(binary)
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.engine_binary.as_os_str().is_empty() {
            return Err(HarnessError::InvalidConfig(
                "engine_binary must not be empty".into(),
            ));
        }
        if self.db_file_name.is_empty() {
            return Err(HarnessError::InvalidConfig(
                "db_file_name must not be empty".into(),
            ));
        }
        if self.db_file_name.contains(std::path::is_separator)
            || self.db_file_name == "."
            || self.db_file_name == ".."
        {
            return Err(HarnessError::InvalidConfig(
                "db_file_name must be a plain file name".into(),
            ));
        }
        if self.reply_timeout == Some(Duration::ZERO) {
            return Err(HarnessError::InvalidConfig(
                "reply_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned when setting up or running the harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Scratch directory or other local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Engine process failure.
    #[error("{0}")]
    Process(#[from] ProcessError),

    /// Protocol failure.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// The generator produced an operation the model rejects.
    #[error("illegal operation: {0}")]
    Model(#[from] ModelError),
}
