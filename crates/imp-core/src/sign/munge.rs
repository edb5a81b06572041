//! The `munge` mechanism: shared-secret attestation via an external
//! credential daemon.
//!
//! The daemon itself is out of scope; it is reached through the narrow
//! [`CredentialAgent`] trait. Signing hands the `HEADER.PAYLOAD` prefix to
//! the agent and uses the returned opaque credential as the signature
//! segment. Verification submits the credential back, compares the
//! recovered payload with the received prefix in constant time, and
//! compares the daemon-authenticated uid with the header's claimed userid.
//!
//! [`LoopbackAgent`] is an in-process HMAC-SHA256 agent for tests and
//! single-host deployments.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::envelope::Header;
use crate::error::SignError;
use crate::sign::mech::SignMech;

type HmacSha256 = Hmac<Sha256>;

/// A credential returned to its issuer by the daemon.
#[derive(Debug)]
pub struct DecodedCredential {
    /// The payload the credential was minted over.
    pub payload: Vec<u8>,
    /// The uid the daemon authenticated at mint time.
    pub userid: u32,
}

/// Narrow interface to the external credential daemon.
pub trait CredentialAgent {
    /// Mints an opaque credential over `payload`, bound to the caller's
    /// authenticated identity. The credential must be ASCII with no `.`
    /// and no whitespace.
    fn encode(&self, payload: &[u8]) -> Result<String, SignError>;

    /// Validates a credential and recovers its payload and the identity
    /// it was minted under.
    fn decode(&self, credential: &str) -> Result<DecodedCredential, SignError>;
}

/// The shared-secret mechanism.
pub struct MungeMech {
    agent: Option<Box<dyn CredentialAgent>>,
}

impl std::fmt::Debug for MungeMech {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MungeMech")
            .field("agent", &self.agent.is_some())
            .finish()
    }
}

impl MungeMech {
    /// Creates the mechanism with an optionally installed agent. Without
    /// one, sign and verify report the mechanism unavailable.
    #[must_use]
    pub fn new(agent: Option<Box<dyn CredentialAgent>>) -> Self {
        Self { agent }
    }

    fn agent(&self) -> Result<&dyn CredentialAgent, SignError> {
        self.agent
            .as_deref()
            .ok_or_else(|| SignError::MechanismUnavailable {
                name: "munge",
                reason: "no credential agent installed".to_string(),
            })
    }
}

impl SignMech for MungeMech {
    fn name(&self) -> &'static str {
        "munge"
    }

    fn sign(&mut self, prefix: &[u8]) -> Result<String, SignError> {
        self.agent()?.encode(prefix)
    }

    fn verify(&self, header: &Header, prefix: &[u8], signature: &str) -> Result<(), SignError> {
        let cred = self.agent()?.decode(signature)?;
        if !bool::from(cred.payload.as_slice().ct_eq(prefix)) {
            return Err(SignError::SignatureInvalid(
                "sign-munge-verify: payload mismatch".to_string(),
            ));
        }
        let claimed = header.get_i64("userid").ok_or_else(|| {
            SignError::InputMalformed("header userid missing".to_string())
        })?;
        if claimed != i64::from(cred.userid) {
            return Err(SignError::SignatureInvalid(format!(
                "sign-munge-verify: userid mismatch: credential={} header={claimed}",
                cred.userid
            )));
        }
        Ok(())
    }
}

/// In-process keyed credential agent.
///
/// Credentials have the form `userid:base64(payload):base64(mac)` where
/// the mac is HMAC-SHA256 over `userid || payload` under the agent key.
/// Both sides of a loopback deployment share the key, standing in for the
/// daemon's host-wide secret.
pub struct LoopbackAgent {
    key: Vec<u8>,
    userid: u32,
}

impl LoopbackAgent {
    /// Creates an agent keyed with `key`, authenticating credentials as
    /// the current real uid.
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self::with_userid(key, nix::unistd::getuid().as_raw())
    }

    /// Creates an agent that authenticates as an explicit uid. Test use.
    #[must_use]
    pub fn with_userid(key: impl Into<Vec<u8>>, userid: u32) -> Self {
        Self {
            key: key.into(),
            userid,
        }
    }

    fn mac(&self, userid: u32, payload: &[u8]) -> Result<HmacSha256, SignError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|e| SignError::MechanismUnavailable {
                name: "munge",
                reason: format!("bad agent key: {e}"),
            })?;
        mac.update(&userid.to_be_bytes());
        mac.update(payload);
        Ok(mac)
    }
}

impl CredentialAgent for LoopbackAgent {
    fn encode(&self, payload: &[u8]) -> Result<String, SignError> {
        let tag = self.mac(self.userid, payload)?.finalize().into_bytes();
        Ok(format!(
            "{}:{}:{}",
            self.userid,
            BASE64.encode(payload),
            BASE64.encode(tag)
        ))
    }

    fn decode(&self, credential: &str) -> Result<DecodedCredential, SignError> {
        let rejected =
            || SignError::SignatureInvalid("sign-munge-verify: credential rejected".to_string());

        let mut parts = credential.splitn(3, ':');
        let userid: u32 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(rejected)?;
        let payload = parts
            .next()
            .and_then(|s| BASE64.decode(s).ok())
            .ok_or_else(rejected)?;
        let tag = parts
            .next()
            .and_then(|s| BASE64.decode(s).ok())
            .ok_or_else(rejected)?;

        self.mac(userid, &payload)?
            .verify_slice(&tag)
            .map_err(|_| rejected())?;
        Ok(DecodedCredential { payload, userid })
    }
}
