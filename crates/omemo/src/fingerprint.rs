//! Hex fingerprints of identity public keys.
//!
//! A fingerprint is the serialized public key without its leading key-type
//! byte, as lowercase hex. The formatted variant groups it in blocks of 8
//! separated by `-`.

use libsignal_protocol::IdentityKey;

use crate::error::OmemoError;

const GROUP_LEN: usize = 8;
/// Key-type prefix of serialized Curve25519 public keys.
pub const DJB_KEY_TYPE: u8 = 0x05;

/// Fingerprint of a serialized (type-prefixed) public key.
pub fn fingerprint_bytes(serialized_key: &[u8], formatted: bool) -> String {
    let raw = hex::encode(serialized_key.get(1..).unwrap_or_default());
    if !formatted {
        return raw;
    }
    let mut out = String::with_capacity(raw.len() + raw.len() / GROUP_LEN);
    for (i, c) in raw.chars().enumerate() {
        if i > 0 && i % GROUP_LEN == 0 {
            out.push('-');
        }
        out.push(c);
    }
    out
}

pub fn fingerprint(identity: &IdentityKey, formatted: bool) -> String {
    fingerprint_bytes(&identity.serialize(), formatted)
}

/// Decode a formatted or raw fingerprint, ignoring every non-hex character.
pub fn parse(fingerprint: &str) -> Result<Vec<u8>, OmemoError> {
    let digits: String = fingerprint
        .chars()
        .filter(char::is_ascii_hexdigit)
        .collect();
    // Nothing left after filtering is an error, not an empty fingerprint.
    if digits.is_empty() {
        return Err(OmemoError::InvalidFingerprint("no hex digits".into()));
    }
    hex::decode(&digits).map_err(|e| OmemoError::InvalidFingerprint(e.to_string()))
}

/// Canonical unformatted form of a user-supplied fingerprint.
pub fn normalize(fingerprint: &str) -> Result<String, OmemoError> {
    parse(fingerprint).map(hex::encode)
}

/// Rebuild the type-prefixed identity key bytes that a fingerprint denotes.
pub fn identity_key_bytes(fingerprint: &str) -> Result<Vec<u8>, OmemoError> {
    let raw = parse(fingerprint)?;
    let mut key = Vec::with_capacity(raw.len() + 1);
    key.push(DJB_KEY_TYPE);
    key.extend_from_slice(&raw);
    Ok(key)
}
