//! sign - wrap stdin in a signed envelope.
//!
//! Usage: `sign < input > output`. Reads up to 1 MiB from stdin, wraps it
//! under the configured `default-type` claiming the current real uid, and
//! prints the envelope on one line. Configuration comes from
//! `FLUX_IMP_CONFIG_PATTERN`. Exit 0 on success, 1 on any failure with a
//! diagnostic on stderr.

use std::io::Read;
use std::process::ExitCode;

use anyhow::{bail, Context as _};
use imp_core::SecurityContext;
use tracing_subscriber::EnvFilter;

/// Input cap. Payloads are job specifications, not bulk data; anything
/// larger than this is a caller bug.
const MAX_INPUT: usize = 1024 * 1024;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("sign: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    if std::env::args().count() != 1 {
        bail!("Usage: sign <input >output");
    }

    let mut ctx = SecurityContext::configure(None)?;

    let mut payload = Vec::new();
    std::io::stdin()
        .lock()
        .take(MAX_INPUT as u64 + 1)
        .read_to_end(&mut payload)
        .context("read stdin")?;
    if payload.len() > MAX_INPUT {
        bail!("input exceeds {MAX_INPUT} bytes");
    }

    match ctx.sign_wrap(&payload, None) {
        Ok(envelope) => {
            println!("{envelope}");
            Ok(())
        }
        Err(err) => bail!("sign_wrap: {err}"),
    }
}
