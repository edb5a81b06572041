//! The `none` mechanism: no cryptographic protection.
//!
//! The signature segment is the literal string `none`. Exists for replay
//! and integration tests; site policy keeps it out of `allowed-types` in
//! production configurations.

use crate::envelope::Header;
use crate::error::SignError;
use crate::sign::mech::SignMech;

const SIGNATURE: &str = "none";

/// The unsigned test mechanism.
#[derive(Debug, Default)]
pub struct NoneMech;

impl SignMech for NoneMech {
    fn name(&self) -> &'static str {
        "none"
    }

    fn sign(&mut self, _prefix: &[u8]) -> Result<String, SignError> {
        Ok(SIGNATURE.to_string())
    }

    fn verify(&self, _header: &Header, _prefix: &[u8], signature: &str) -> Result<(), SignError> {
        if signature == SIGNATURE {
            Ok(())
        } else {
            Err(SignError::SignatureInvalid(
                "sign-none-verify: unexpected signature".to_string(),
            ))
        }
    }
}
