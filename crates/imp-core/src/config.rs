//! Configuration loading for the trust core.
//!
//! Config files are TOML, discovered by glob pattern (normally taken from
//! `FLUX_IMP_CONFIG_PATTERN`) and merged per top-level table: a table in a
//! later file replaces the same table from an earlier file wholesale.
//! Foreign top-level tables are tolerated; the tables this crate knows
//! (`[sign]`, `[exec]`) are strict about their keys.
//!
//! Value-level validation of `[sign]` (max-ttl range, mechanism names) is
//! deliberately deferred to sign engine init so that exec-only consumers
//! can load a config whose sign section they never use.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// The merged security configuration: the subtrees this crate understands.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    /// The `[sign]` subtree, when present.
    pub sign: Option<SignConfig>,
    /// The `[exec]` subtree, when present.
    pub exec: Option<ExecConfig>,
}

/// The `[sign]` table.
///
/// `allowed_types` stays as raw TOML values here; the sign engine validates
/// entry types and mechanism names at init so it can report the offending
/// index.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SignConfig {
    /// Maximum signature lifetime in seconds. Positive, or exactly -100 to
    /// disable expiry checking in tests.
    pub max_ttl: i64,

    /// Mechanism used when the caller does not name one.
    pub default_type: String,

    /// Ordered list of mechanisms acceptable on unwrap.
    pub allowed_types: Vec<toml::Value>,

    /// The `[sign.curve]` table, required when the curve mechanism is used.
    #[serde(default)]
    pub curve: Option<CurveConfig>,

    /// The `[sign.munge]` table.
    #[serde(default)]
    pub munge: Option<MungeConfig>,
}

/// The `[sign.curve]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CurveConfig {
    /// Signing-key override, mainly for tests. When unset the signing key
    /// is loaded from the keystore entry of the current real uid.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Directory of per-uid key material (`<uid>.key` / `<uid>.pub`).
    pub keystore_path: PathBuf,
}

/// The `[sign.munge]` table.
///
/// The credential daemon itself is reached through the
/// [`CredentialAgent`](crate::CredentialAgent) trait; this table only
/// records where a transport implementation should look.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct MungeConfig {
    /// Socket path of the external credential daemon.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

/// The `[exec]` table consumed by the IMP binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ExecConfig {
    /// Usernames permitted to invoke `flux-imp exec`.
    #[serde(default)]
    pub allowed_users: Vec<String>,

    /// Absolute job shell paths the IMP will launch.
    #[serde(default)]
    pub allowed_shells: Vec<String>,

    /// Permit direct exec without privilege separation (test installs).
    #[serde(default)]
    pub allow_unprivileged_exec: bool,

    /// Open a PAM session around the job shell.
    #[serde(default)]
    pub pam_support: bool,
}

impl SecurityConfig {
    /// Loads and merges every file matching `pattern`.
    ///
    /// Files are merged in sorted path order; each top-level table comes
    /// wholly from the last file defining it.
    ///
    /// # Errors
    ///
    /// Returns an error for a bad pattern, an empty match set, an
    /// unreadable or unparsable file, or a known table of the wrong shape.
    pub fn load_pattern(pattern: &str) -> Result<Self, ConfigError> {
        let entries = glob::glob(pattern).map_err(|source| ConfigError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
        paths.sort();
        if paths.is_empty() {
            return Err(ConfigError::NoMatch {
                pattern: pattern.to_string(),
            });
        }

        let mut merged = toml::Table::new();
        for path in &paths {
            let table = read_table(path)?;
            for (key, value) in table {
                merged.insert(key, value);
            }
        }
        Self::from_table(&merged)
    }

    /// Builds a config from an already-merged TOML table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Table`] when `[sign]` or `[exec]` has the
    /// wrong shape. Unknown top-level tables are ignored.
    pub fn from_table(table: &toml::Table) -> Result<Self, ConfigError> {
        let sign = table
            .get("sign")
            .map(|v| v.clone().try_into::<SignConfig>())
            .transpose()
            .map_err(|source| ConfigError::Table {
                table: "sign",
                source,
            })?;
        let exec = table
            .get("exec")
            .map(|v| v.clone().try_into::<ExecConfig>())
            .transpose()
            .map_err(|source| ConfigError::Table {
                table: "exec",
                source,
            })?;
        Ok(Self { sign, exec })
    }

    /// Parses a config from TOML text. Test and tooling convenience.
    ///
    /// # Errors
    ///
    /// Returns an error when the text is not valid TOML or a known table
    /// has the wrong shape.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(text).map_err(|source| ConfigError::Table {
            table: "config",
            source,
        })?;
        Self::from_table(&table)
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
