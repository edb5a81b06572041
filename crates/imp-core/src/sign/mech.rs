//! The mechanism capability set and compile-time registry.

use crate::envelope::Header;
use crate::error::SignError;

/// Capability set every signing back-end satisfies.
///
/// Wrap calls `prep` (which may add mechanism fields to the header) and
/// then `sign` over the serialized `HEADER.PAYLOAD` prefix. Unwrap calls
/// `verify` with the parsed header, the same prefix bytes, and the
/// signature segment.
pub trait SignMech {
    /// Stable mechanism identifier. Never reused for a different
    /// implementation.
    fn name(&self) -> &'static str;

    /// Adds mechanism-specific fields to the header before encoding.
    fn prep(&mut self, header: &mut Header) -> Result<(), SignError> {
        let _ = header;
        Ok(())
    }

    /// Produces the signature segment over the `HEADER.PAYLOAD` prefix.
    /// The result must be ASCII with no `.` and no whitespace.
    fn sign(&mut self, prefix: &[u8]) -> Result<String, SignError>;

    /// Checks `signature` against the prefix and the header's claims.
    fn verify(&self, header: &Header, prefix: &[u8], signature: &str) -> Result<(), SignError>;
}

/// The compile-time mechanism registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechKind {
    /// Unsigned test mechanism.
    None,
    /// Shared-secret via an external credential daemon.
    Munge,
    /// Ed25519 detached signature with a uid-keyed keystore.
    Curve,
}

impl MechKind {
    /// Looks up a mechanism by its stable name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::None),
            "munge" => Some(Self::Munge),
            "curve" => Some(Self::Curve),
            _ => None,
        }
    }

    /// The mechanism's stable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Munge => "munge",
            Self::Curve => "curve",
        }
    }
}
