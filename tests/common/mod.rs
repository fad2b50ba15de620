//! Shared helpers for integration tests.

#![allow(dead_code)]

use kvoracle::{EngineTarget, HarnessConfig, HarnessError};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration for the bundled loopback engine.
pub fn loopback_config() -> HarnessConfig {
    init_tracing();
    HarnessConfig::new(env!("CARGO_BIN_EXE_kv-loopback"))
}

/// Loopback engine started with `--fault <name>`.
pub fn faulty_config(fault: &str) -> HarnessConfig {
    HarnessConfig {
        engine_args: vec!["--fault".into(), fault.into()],
        ..loopback_config()
    }
}

/// Correct loopback engine.
pub struct Loopback;

impl EngineTarget for Loopback {
    fn config() -> Result<HarnessConfig, HarnessError> {
        Ok(loopback_config())
    }
}

/// Loopback engine whose commits never reach disk.
pub struct LosesCommits;

impl EngineTarget for LosesCommits {
    fn config() -> Result<HarnessConfig, HarnessError> {
        Ok(faulty_config("lose-commits"))
    }
}

/// Loopback engine whose rollback keeps uncommitted writes.
pub struct StickyRollback;

impl EngineTarget for StickyRollback {
    fn config() -> Result<HarnessConfig, HarnessError> {
        Ok(faulty_config("sticky-rollback"))
    }
}
