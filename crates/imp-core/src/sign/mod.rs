//! The sign engine: policy-checked wrap/unwrap over pluggable mechanisms.
//!
//! One engine per security context. The engine owns the validated `[sign]`
//! config subtree, both scratch buffers, and the mechanism instances.
//! Results borrow the engine, so the compiler enforces the contract that a
//! wrap/unwrap result is invalidated by the next call.

pub mod curve;
pub mod mech;
pub mod munge;
pub mod none;

use nix::unistd::getuid;

use crate::config::SignConfig;
use crate::envelope::{self, Header, SIGN_VERSION};
use crate::error::SignError;
use crate::sign::curve::CurveMech;
use crate::sign::mech::{MechKind, SignMech};
use crate::sign::munge::{CredentialAgent, MungeMech};
use crate::sign::none::NoneMech;

/// Sentinel `max-ttl` value that disables expiry checking. Accepted only
/// so tests can exercise stale envelopes; every other non-positive value
/// is rejected at init.
pub const MAX_TTL_DISABLED: i64 = -100;

/// Whether unwrap performs the mechanism's cryptographic check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwrapMode {
    /// Full verification. The only mode privileged consumers may use.
    Verify,
    /// Skip the cryptographic check. Structural validation and the
    /// version check still apply. Self-test paths only.
    NoVerify,
}

/// A successfully unwrapped envelope. Borrows the engine's unwrap buffer;
/// invalidated by the next engine call.
#[derive(Debug)]
pub struct Unwrapped<'a> {
    /// The original payload bytes (empty slice for an empty payload).
    pub payload: &'a [u8],
    /// The verified acting user.
    pub userid: u32,
    /// The mechanism that attested the envelope.
    pub mechanism: &'static str,
}

/// The sign engine.
#[derive(Debug)]
pub struct SignEngine {
    max_ttl: i64,
    default_type: MechKind,
    allowed: Vec<String>,
    wrapbuf: String,
    unwrapbuf: Vec<u8>,
    none: NoneMech,
    munge: MungeMech,
    curve: Option<CurveMech>,
}

impl SignEngine {
    /// Validates the `[sign]` config subtree and builds the engine.
    ///
    /// `agent` is the optional external credential daemon connection used
    /// by the munge mechanism.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` when `max-ttl` is non-positive (and not the
    /// test sentinel), `allowed-types` is empty / contains a non-string /
    /// names an unknown mechanism, or `default-type` is unknown.
    pub fn new(
        config: &SignConfig,
        agent: Option<Box<dyn CredentialAgent>>,
    ) -> Result<Self, SignError> {
        if config.max_ttl <= 0 && config.max_ttl != MAX_TTL_DISABLED {
            return Err(SignError::ConfigInvalid(
                "max-ttl should be greater than zero".to_string(),
            ));
        }
        if config.allowed_types.is_empty() {
            return Err(SignError::ConfigInvalid(
                "allowed-types array is empty".to_string(),
            ));
        }
        let mut allowed = Vec::with_capacity(config.allowed_types.len());
        for (i, entry) in config.allowed_types.iter().enumerate() {
            let Some(name) = entry.as_str() else {
                return Err(SignError::ConfigInvalid(format!(
                    "allowed-types[{i}] not a string"
                )));
            };
            if MechKind::from_name(name).is_none() {
                return Err(SignError::ConfigInvalid(format!(
                    "unknown mechanism={name}"
                )));
            }
            allowed.push(name.to_string());
        }
        let default_type = MechKind::from_name(&config.default_type).ok_or_else(|| {
            SignError::ConfigInvalid(format!("unknown mechanism={}", config.default_type))
        })?;

        Ok(Self {
            max_ttl: config.max_ttl,
            default_type,
            allowed,
            wrapbuf: String::new(),
            unwrapbuf: Vec::new(),
            none: NoneMech,
            munge: MungeMech::new(agent),
            curve: config
                .curve
                .as_ref()
                .map(|c| CurveMech::new(c, config.max_ttl)),
        })
    }

    /// Wraps `payload` in a signed envelope claiming `userid`.
    ///
    /// `mech_type` of `None` selects the configured `default-type`. The
    /// returned envelope borrows the engine and is invalidated by the next
    /// wrap/unwrap call.
    ///
    /// # Errors
    ///
    /// Returns `MechanismUnknown` for an unregistered name, and the
    /// mechanism's own errors from prep/sign.
    pub fn wrap_as(
        &mut self,
        userid: u32,
        payload: &[u8],
        mech_type: Option<&str>,
    ) -> Result<&str, SignError> {
        let kind = match mech_type {
            Some(name) => MechKind::from_name(name).ok_or_else(|| SignError::MechanismUnknown {
                name: name.to_string(),
            })?,
            None => self.default_type,
        };

        let mut header = Header::new(kind.name(), userid);

        let Self {
            wrapbuf,
            none,
            munge,
            curve,
            ..
        } = self;
        let mech: &mut dyn SignMech = match kind {
            MechKind::None => none,
            MechKind::Munge => munge,
            MechKind::Curve => curve.as_mut().ok_or_else(curve_unconfigured)?,
        };

        mech.prep(&mut header)?;
        envelope::header_encode_cpy(&header, wrapbuf)?;
        envelope::payload_encode_cat(payload, wrapbuf);
        let signature = mech.sign(wrapbuf.as_bytes())?;
        envelope::signature_cat(&signature, wrapbuf)?;

        Ok(self.wrapbuf.as_str())
    }

    /// Wraps `payload` claiming the current real uid.
    ///
    /// # Errors
    ///
    /// As [`wrap_as`](Self::wrap_as).
    pub fn wrap(&mut self, payload: &[u8], mech_type: Option<&str>) -> Result<&str, SignError> {
        self.wrap_as(getuid().as_raw(), payload, mech_type)
    }

    /// Unwraps an envelope, enforcing `allowed-types`.
    ///
    /// # Errors
    ///
    /// Returns `InputMalformed` for structural problems (separators,
    /// base64, header shape, version, userid range), `PolicyDenied` when
    /// the mechanism is not allowed, and `SignatureInvalid` from the
    /// mechanism check (skipped under [`UnwrapMode::NoVerify`]).
    pub fn unwrap(&mut self, input: &str, mode: UnwrapMode) -> Result<Unwrapped<'_>, SignError> {
        self.unwrap_common(input, mode, true)
    }

    /// Unwraps an envelope without the `allowed-types` policy check, for
    /// tooling that inspects foreign envelopes.
    ///
    /// # Errors
    ///
    /// As [`unwrap`](Self::unwrap), minus `PolicyDenied`.
    pub fn unwrap_anymech(
        &mut self,
        input: &str,
        mode: UnwrapMode,
    ) -> Result<Unwrapped<'_>, SignError> {
        self.unwrap_common(input, mode, false)
    }

    /// The envelope produced by the most recent successful wrap. Valid
    /// until the next engine call.
    #[must_use]
    pub fn wrap_result(&self) -> &str {
        &self.wrapbuf
    }

    /// The payload decoded by the most recent successful unwrap. Valid
    /// until the next engine call.
    #[must_use]
    pub fn unwrap_result(&self) -> &[u8] {
        &self.unwrapbuf
    }

    fn unwrap_common(
        &mut self,
        input: &str,
        mode: UnwrapMode,
        check_allowed: bool,
    ) -> Result<Unwrapped<'_>, SignError> {
        let parts = envelope::split_envelope(input)?;
        let header = envelope::header_decode(parts.header_b64)?;

        let version = header
            .get_i64("version")
            .ok_or_else(|| SignError::InputMalformed("header version missing".to_string()))?;
        if version != SIGN_VERSION {
            return Err(SignError::InputMalformed(format!(
                "header version={version} unknown"
            )));
        }
        let mechanism = header
            .get_str("mechanism")
            .ok_or_else(|| SignError::InputMalformed("header mechanism missing".to_string()))?;
        let kind = MechKind::from_name(mechanism).ok_or_else(|| {
            SignError::InputMalformed(format!("header mechanism={mechanism} unknown"))
        })?;
        if check_allowed && !self.allowed.iter().any(|name| name == mechanism) {
            return Err(SignError::PolicyDenied {
                mechanism: mechanism.to_string(),
            });
        }
        let userid = header
            .get_i64("userid")
            .ok_or_else(|| SignError::InputMalformed("header userid missing".to_string()))?;
        let userid = u32::try_from(userid).map_err(|_| {
            SignError::InputMalformed(format!("header userid={userid} invalid"))
        })?;

        envelope::payload_decode_cpy(parts.payload_b64, &mut self.unwrapbuf)?;

        if mode == UnwrapMode::Verify {
            let mech: &dyn SignMech = match kind {
                MechKind::None => &self.none,
                MechKind::Munge => &self.munge,
                MechKind::Curve => self.curve.as_ref().ok_or_else(curve_unconfigured)?,
            };
            mech.verify(&header, parts.prefix.as_bytes(), parts.signature)?;
        }

        Ok(Unwrapped {
            payload: &self.unwrapbuf,
            userid,
            mechanism: kind.name(),
        })
    }
}

fn curve_unconfigured() -> SignError {
    SignError::MechanismUnavailable {
        name: "curve",
        reason: "[sign.curve] config missing".to_string(),
    }
}
