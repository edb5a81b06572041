//! Error types for the trust core.
//!
//! Library operations return structured kinds; the security context renders
//! them to a one-line message at the API boundary (`last_error`).

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while locating, parsing, or shaping configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config glob pattern itself is malformed.
    #[error("config: bad pattern {pattern}: {source}")]
    Pattern {
        /// The offending glob pattern.
        pattern: String,
        /// Underlying glob error.
        source: glob::PatternError,
    },

    /// No configuration file matched the pattern.
    #[error("config: no files match {pattern}")]
    NoMatch {
        /// The glob pattern that matched nothing.
        pattern: String,
    },

    /// `FLUX_IMP_CONFIG_PATTERN` was needed but not set.
    #[error("config: FLUX_IMP_CONFIG_PATTERN is not set")]
    PatternUnset,

    /// A matched file could not be read.
    #[error("config: {path}: {source}")]
    Io {
        /// The file that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A matched file is not valid TOML.
    #[error("config: {path}: {source}")]
    Parse {
        /// The file that failed to parse.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A known table has the wrong shape (unknown key, wrong type).
    #[error("config: [{table}]: {source}")]
    Table {
        /// The top-level table name.
        table: &'static str,
        /// Underlying deserialization error.
        source: toml::de::Error,
    },

    /// A required table is absent from the merged configuration.
    #[error("config: [{table}] table missing")]
    Missing {
        /// The top-level table name.
        table: &'static str,
    },
}

/// Errors raised by the sign engine and its mechanisms.
#[derive(Debug, Error)]
pub enum SignError {
    /// The `[sign]` configuration failed validation at engine init.
    #[error("sign: {0}")]
    ConfigInvalid(String),

    /// The input envelope is structurally bad (separators, base64, header
    /// shape, version).
    #[error("sign-unwrap: {0}")]
    InputMalformed(String),

    /// The envelope's mechanism is not in `allowed-types`.
    #[error("sign-unwrap: header mechanism={mechanism} not allowed")]
    PolicyDenied {
        /// The mechanism named by the envelope header.
        mechanism: String,
    },

    /// Cryptographic verification failed.
    #[error("{0}")]
    SignatureInvalid(String),

    /// The requested mechanism name is not registered.
    #[error("sign: unknown mechanism={name}")]
    MechanismUnknown {
        /// The unrecognized mechanism name.
        name: String,
    },

    /// The mechanism is registered but cannot operate in this context
    /// (missing configuration or collaborator).
    #[error("sign: mechanism {name} unavailable: {reason}")]
    MechanismUnavailable {
        /// The mechanism name.
        name: &'static str,
        /// Why it cannot operate.
        reason: String,
    },

    /// A keystore operation failed.
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
}

/// Errors raised by the uid-keyed keystore.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// I/O error during key file operations.
    #[error("keystore: {path}: {source}")]
    Io {
        /// The key file involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// No key material stored for the user.
    #[error("keystore: no key for userid {userid}")]
    NotFound {
        /// The uid whose key is missing.
        userid: u32,
    },

    /// Group/other permission bits are set on key material.
    #[error("keystore: insecure permissions on {path}")]
    InsecurePermissions {
        /// The path with lax permissions.
        path: PathBuf,
    },

    /// The key file exists but does not hold a valid key.
    #[error("keystore: {path}: invalid key: {reason}")]
    InvalidKey {
        /// The malformed key file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
}
