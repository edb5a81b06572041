//! The `curve` mechanism: ed25519 detached signatures bound to a uid by a
//! local keystore.
//!
//! Prep stamps the header with the signer's public key and a creation /
//! expiry timestamp pair. Verification recomputes the signature with the
//! header's declared public key and then confirms that key actually
//! belongs to the claimed uid by consulting the keystore; trusting the
//! header alone would let any keyholder claim any uid.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use subtle::ConstantTimeEq;

use crate::config::CurveConfig;
use crate::envelope::Header;
use crate::error::SignError;
use crate::keystore::Keystore;
use crate::sign::mech::SignMech;
use crate::sign::MAX_TTL_DISABLED;

/// The public-key mechanism.
#[derive(Debug)]
pub struct CurveMech {
    max_ttl: i64,
    config: CurveConfig,
    keystore: Keystore,
    signing_key: Option<SigningKey>,
}

impl CurveMech {
    /// Creates the mechanism from its validated config subtree. The
    /// signing key is loaded lazily on first prep so verify-only contexts
    /// never touch secret material.
    #[must_use]
    pub fn new(config: &CurveConfig, max_ttl: i64) -> Self {
        Self {
            max_ttl,
            keystore: Keystore::new(&config.keystore_path),
            config: config.clone(),
            signing_key: None,
        }
    }

    fn signing_key(&mut self) -> Result<&SigningKey, SignError> {
        if self.signing_key.is_none() {
            let key = match &self.config.cert_path {
                Some(path) => Keystore::load_signing_key_file(path)?,
                None => self
                    .keystore
                    .load_signing_key(nix::unistd::getuid().as_raw())?,
            };
            self.signing_key = Some(key);
        }
        match &self.signing_key {
            Some(key) => Ok(key),
            None => Err(SignError::MechanismUnavailable {
                name: "curve",
                reason: "signing key not loaded".to_string(),
            }),
        }
    }
}

fn incomplete_header() -> SignError {
    SignError::SignatureInvalid("sign-curve-verify: incomplete header".to_string())
}

fn decode_pubkey(b64: &str) -> Result<([u8; PUBLIC_KEY_LENGTH], VerifyingKey), SignError> {
    let bytes = BASE64.decode(b64).map_err(|_| incomplete_header())?;
    let arr: [u8; PUBLIC_KEY_LENGTH] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| incomplete_header())?;
    let key = VerifyingKey::from_bytes(&arr).map_err(|_| {
        SignError::SignatureInvalid("sign-curve-verify: malformed public key".to_string())
    })?;
    Ok((arr, key))
}

impl SignMech for CurveMech {
    fn name(&self) -> &'static str {
        "curve"
    }

    fn prep(&mut self, header: &mut Header) -> Result<(), SignError> {
        let max_ttl = self.max_ttl;
        let key = self.signing_key()?;
        let pubkey = BASE64.encode(key.verifying_key().as_bytes());

        let ctime = Utc::now().timestamp();
        let xtime = if max_ttl == MAX_TTL_DISABLED {
            ctime
        } else {
            ctime + max_ttl
        };
        header.put_str("curve.pubkey", &pubkey);
        header.put_i64("curve.ctime", ctime);
        header.put_i64("curve.xtime", xtime);
        Ok(())
    }

    fn sign(&mut self, prefix: &[u8]) -> Result<String, SignError> {
        let key = self.signing_key()?;
        Ok(BASE64.encode(key.sign(prefix).to_bytes()))
    }

    fn verify(&self, header: &Header, prefix: &[u8], signature: &str) -> Result<(), SignError> {
        let pubkey_b64 = header.get_str("curve.pubkey").ok_or_else(incomplete_header)?;
        let ctime = header.get_i64("curve.ctime").ok_or_else(incomplete_header)?;
        let xtime = header.get_i64("curve.xtime").ok_or_else(incomplete_header)?;
        let userid = header.get_i64("userid").ok_or_else(incomplete_header)?;

        let (declared_bytes, declared_key) = decode_pubkey(pubkey_b64)?;

        let sig_bytes = BASE64.decode(signature).map_err(|_| {
            SignError::SignatureInvalid("sign-curve-verify: malformed signature".to_string())
        })?;
        let sig_arr: [u8; SIGNATURE_LENGTH] = sig_bytes.as_slice().try_into().map_err(|_| {
            SignError::SignatureInvalid("sign-curve-verify: malformed signature".to_string())
        })?;
        let sig = Signature::from_bytes(&sig_arr);

        if declared_key.verify_strict(prefix, &sig).is_err() {
            return Err(SignError::SignatureInvalid(
                "sign-curve-verify: verification failure".to_string(),
            ));
        }

        // The declared key must be the one the keystore binds to the
        // claimed uid.
        let userid = u32::try_from(userid).map_err(|_| {
            SignError::SignatureInvalid(format!("sign-curve-verify: userid {userid} invalid"))
        })?;
        let bound_key = self.keystore.load_verifying_key(userid).map_err(|e| {
            SignError::SignatureInvalid(format!(
                "sign-curve-verify: error loading key for userid {userid}: {e}"
            ))
        })?;
        if !bool::from(bound_key.as_bytes().as_slice().ct_eq(declared_bytes.as_slice())) {
            return Err(SignError::SignatureInvalid(format!(
                "sign-curve-verify: public key does not match userid {userid}"
            )));
        }

        if self.max_ttl != MAX_TTL_DISABLED {
            let now = Utc::now().timestamp();
            if xtime < now || ctime.saturating_add(self.max_ttl) < now {
                return Err(SignError::SignatureInvalid(
                    "sign-curve-verify: xtime or max-ttl exceeded".to_string(),
                ));
            }
            if ctime > now {
                return Err(SignError::SignatureInvalid(
                    "sign-curve-verify: ctime is in the future".to_string(),
                ));
            }
        }
        Ok(())
    }
}
