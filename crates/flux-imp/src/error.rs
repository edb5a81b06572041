//! IMP-side error type.
//!
//! Everything here maps to exit status 1; the 126/127 exec-failure codes
//! are produced directly in the forked child, which cannot unwind back
//! through `main`.

use thiserror::Error;

/// Fatal IMP conditions.
#[derive(Debug, Error)]
pub enum ImpError {
    /// Configuration could not be loaded or shaped.
    #[error(transparent)]
    Config(#[from] imp_core::ConfigError),

    /// Token verification or policy failed inside the sign engine.
    #[error("signature validation failed: {0}")]
    Sign(#[from] imp_core::SignError),

    /// A local policy check failed (allowed-users, allowed-shells, uid 0).
    #[error("{0}")]
    PolicyDenied(String),

    /// The launch request is malformed.
    #[error("invalid input: {0}")]
    InputMalformed(String),

    /// Privilege separation could not be established or torn down.
    #[error("{0}")]
    Privsep(String),

    /// Cgroup discovery or signaling failed.
    #[error("cgroup: {0}")]
    Cgroup(String),

    /// An OS-level operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ImpError {
    /// Wraps an I/O error with its attempted operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps a `nix` errno with its attempted operation.
    pub fn errno(context: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Self::io(context, std::io::Error::from(errno))
    }
}

/// Terminates the process from a context that cannot propagate errors
/// (forked children between privilege drop and exec).
///
/// The global subscriber installed in `main` is inherited across
/// `fork()`, so the one fatal line lands on stderr like every other.
pub fn die(msg: impl std::fmt::Display) -> ! {
    tracing::error!("{msg}");
    std::process::exit(1);
}
