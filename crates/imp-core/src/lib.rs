//! # imp-core
//!
//! Trust core for a privilege-separated job launcher: a sign/unwrap engine
//! producing compact `HEADER.PAYLOAD.SIGNATURE` envelopes over pluggable
//! signing mechanisms, plus the configuration and keystore plumbing the
//! engine needs.
//!
//! An unprivileged scheduling daemon uses this crate to mint an attested
//! authorization token naming the acting user; the setuid `flux-imp` helper
//! uses the same crate to verify the token before switching users and
//! launching a job shell.
//!
//! ## Envelope format
//!
//! `HEADER "." PAYLOAD "." SIGNATURE`, all ASCII. `HEADER` and `PAYLOAD`
//! are padded standard base64 of binary blobs; `SIGNATURE` is
//! mechanism-defined opaque ASCII containing no `.` and no whitespace. The
//! header is a JSON object carrying `version`, `mechanism`, `userid`, and
//! any mechanism-specific fields.
//!
//! ## Example
//!
//! ```rust,no_run
//! use imp_core::{SecurityContext, UnwrapMode};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctx = SecurityContext::configure(None)?;
//! let envelope = ctx.sign_wrap(b"job payload", None)?.to_string();
//! let unwrapped = ctx.sign_unwrap(&envelope, UnwrapMode::Verify)?;
//! assert_eq!(unwrapped.payload, b"job payload");
//! # Ok(())
//! # }
//! ```
//!
//! Contexts are strictly single-threaded: scratch buffers and the
//! last-error slot live on the context and every wrap/unwrap invalidates
//! the previous call's results (the borrow checker enforces this).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod envelope;
mod error;
pub mod keystore;
pub mod sign;

pub use config::{CurveConfig, ExecConfig, MungeConfig, SecurityConfig, SignConfig};
pub use context::{SecurityContext, CONFIG_PATTERN_ENV};
pub use envelope::Header;
pub use error::{ConfigError, KeystoreError, SignError};
pub use keystore::Keystore;
pub use sign::munge::{CredentialAgent, DecodedCredential, LoopbackAgent};
pub use sign::{SignEngine, UnwrapMode, Unwrapped, MAX_TTL_DISABLED};
