//! `kv-loopback`: protocol-conforming engine for harness self-tests.
//!
//! ```text
//! kv-loopback [--fault <lose-commits|sticky-rollback>] --test <db path>
//! ```
//!
//! Commands arrive on stdin, one reply line per command goes to stdout.
//! Diagnostics are written to stderr and filtered with `RUST_LOG`.

use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kvoracle::loopback::{Fault, LoopbackEngine, LoopbackError, serve};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kv-loopback", about = "Loopback key-value engine for kvoracle")]
struct Args {
    /// Run in test/oracle mode (the only supported mode).
    #[arg(long)]
    test: bool,

    /// Inject a deliberate fault.
    #[arg(long)]
    fault: Option<String>,

    /// Database file.
    path: PathBuf,
}

fn run(args: Args) -> Result<(), LoopbackError> {
    let fault = args.fault.as_deref().map(str::parse::<Fault>).transpose()?;
    let mut engine = LoopbackEngine::open(&args.path, fault)?;
    let stdin = io::stdin().lock();
    let stdout = BufWriter::new(io::stdout().lock());
    serve(&mut engine, stdin, stdout)
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();

    let args = Args::parse();
    if !args.test {
        error!("kv-loopback only runs with --test");
        return ExitCode::from(2);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "loopback engine failed");
            ExitCode::FAILURE
        }
    }
}
