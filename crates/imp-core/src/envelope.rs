//! Envelope codec: `HEADER "." PAYLOAD "." SIGNATURE`.
//!
//! The wrap side composes into an engine-owned `String` in three stages
//! (`header_encode_cpy`, `payload_encode_cat`, `signature_cat`); the buffer
//! keeps its capacity across calls so steady-state wrapping does not
//! allocate. The unwrap side splits on the first two `.` separators and
//! decodes into the engine-owned byte buffer.
//!
//! The header is a JSON object; map keys are kept in a `BTreeMap` so the
//! serialized form is deterministic for a given field set.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::SignError;

/// The sole supported envelope format version.
pub const SIGN_VERSION: i64 = 1;

/// The envelope security header: a small key/value bundle.
///
/// Always carries `version`, `mechanism`, and `userid`; mechanisms add
/// their own dotted fields (`curve.pubkey`, `curve.ctime`, ...) during
/// prep. Values are JSON scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header {
    fields: BTreeMap<String, serde_json::Value>,
}

impl Header {
    /// Creates a header for `mechanism` claiming `userid`, at the current
    /// format version.
    #[must_use]
    pub fn new(mechanism: &str, userid: u32) -> Self {
        let mut header = Self {
            fields: BTreeMap::new(),
        };
        header.put_i64("version", SIGN_VERSION);
        header.put_str("mechanism", mechanism);
        header.put_i64("userid", i64::from(userid));
        header
    }

    /// Inserts or replaces an integer field.
    pub fn put_i64(&mut self, key: &str, value: i64) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Inserts or replaces a string field.
    pub fn put_str(&mut self, key: &str, value: &str) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Fetches an integer field.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key)?.as_i64()
    }

    /// Fetches a string field.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key)?.as_str()
    }
}

/// Borrowed view of one envelope, split at its two separators.
#[derive(Debug)]
pub(crate) struct EnvelopeParts<'a> {
    /// Base64 header segment.
    pub header_b64: &'a str,
    /// Base64 payload segment (may be empty).
    pub payload_b64: &'a str,
    /// Mechanism-defined signature segment.
    pub signature: &'a str,
    /// The signed region: `HEADER "." PAYLOAD`.
    pub prefix: &'a str,
}

/// Splits an envelope at its first two `.` separators.
pub(crate) fn split_envelope(input: &str) -> Result<EnvelopeParts<'_>, SignError> {
    let malformed = || SignError::InputMalformed("not in HEADER.PAYLOAD.SIGNATURE form".to_string());
    let first = input.find('.').ok_or_else(malformed)?;
    let rest = &input[first + 1..];
    let second = first + 1 + rest.find('.').ok_or_else(malformed)?;
    Ok(EnvelopeParts {
        header_b64: &input[..first],
        payload_b64: &input[first + 1..second],
        signature: &input[second + 1..],
        prefix: &input[..second],
    })
}

/// Writes base64(header) into `buf`, replacing any previous content. The
/// buffer's capacity is retained.
pub(crate) fn header_encode_cpy(header: &Header, buf: &mut String) -> Result<(), SignError> {
    let bytes = serde_json::to_vec(header)
        .map_err(|e| SignError::InputMalformed(format!("header encode error: {e}")))?;
    buf.clear();
    BASE64.encode_string(&bytes, buf);
    Ok(())
}

/// Appends `"." + base64(payload)` to `buf`. Must follow
/// [`header_encode_cpy`].
pub(crate) fn payload_encode_cat(payload: &[u8], buf: &mut String) {
    buf.push('.');
    BASE64.encode_string(payload, buf);
}

/// Appends `"." + signature` to `buf`. Must follow
/// [`payload_encode_cat`].
///
/// Rejects signatures that would corrupt the envelope framing: empty,
/// non-ASCII, embedded `.` or whitespace.
pub(crate) fn signature_cat(signature: &str, buf: &mut String) -> Result<(), SignError> {
    let framable = !signature.is_empty()
        && signature
            .bytes()
            .all(|b| b.is_ascii() && b != b'.' && !b.is_ascii_whitespace());
    if !framable {
        return Err(SignError::SignatureInvalid(format!(
            "sign: mechanism produced an unframable signature ({} bytes)",
            signature.len()
        )));
    }
    buf.push('.');
    buf.push_str(signature);
    Ok(())
}

/// Decodes and parses the header segment.
pub(crate) fn header_decode(header_b64: &str) -> Result<Header, SignError> {
    let bytes = BASE64
        .decode(header_b64)
        .map_err(|e| SignError::InputMalformed(format!("header decode error: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SignError::InputMalformed(format!("header parse error: {e}")))
}

/// Decodes the payload segment into `buf`, replacing any previous content
/// and retaining capacity. Returns the decoded length (0 for an empty
/// payload).
pub(crate) fn payload_decode_cpy(payload_b64: &str, buf: &mut Vec<u8>) -> Result<usize, SignError> {
    buf.clear();
    BASE64
        .decode_vec(payload_b64, buf)
        .map_err(|e| SignError::InputMalformed(format!("payload decode error: {e}")))?;
    Ok(buf.len())
}
