//! Whole-file AES-256-GCM for OMEMO media sharing.
//!
//! The secret travels in the URL fragment as `hex(nonce) || hex(key)`, with
//! no separator. Encrypted files are `ciphertext || tag`.

use std::io::{Read, Write};

use tern_shared::constants::{AESGCM_FILE_KEY_LENGTH, AESGCM_FILE_NONCE_LENGTH};
use zeroize::Zeroizing;

use crate::crypto::CryptoProvider;
use crate::error::OmemoError;

pub const FRAGMENT_LENGTH: usize = 2 * (AESGCM_FILE_NONCE_LENGTH + AESGCM_FILE_KEY_LENGTH);
const AESGCM_SCHEME: &str = "aesgcm://";
const HTTPS_SCHEME: &str = "https://";

/// Encrypt `input` into `output` under a fresh key. Returns the URL fragment.
pub fn encrypt_file(
    crypto: &dyn CryptoProvider,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<String, OmemoError> {
    let key = Zeroizing::new(crypto.random_bytes(AESGCM_FILE_KEY_LENGTH)?);
    let nonce = crypto.random_bytes(AESGCM_FILE_NONCE_LENGTH)?;

    crypto.aes256_gcm_stream_encrypt(&key, &nonce, input, output)?;

    let mut fragment = String::with_capacity(FRAGMENT_LENGTH);
    fragment.push_str(&hex::encode(&nonce));
    fragment.push_str(&Zeroizing::new(hex::encode(key.as_slice())));
    Ok(fragment)
}

/// Decrypt `input` into `output` with the secret from `fragment`.
///
/// A malformed fragment is rejected before anything is read. On error the
/// caller must discard whatever was written to `output`.
pub fn decrypt_file(
    crypto: &dyn CryptoProvider,
    input: &mut dyn Read,
    output: &mut dyn Write,
    fragment: &str,
) -> Result<(), OmemoError> {
    let (nonce, key) = parse_fragment(fragment)?;
    crypto.aes256_gcm_stream_decrypt(&key, &nonce, input, output)?;
    Ok(())
}

/// Split a fragment into `(nonce, key)`.
pub fn parse_fragment(fragment: &str) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), OmemoError> {
    if fragment.len() != FRAGMENT_LENGTH {
        return Err(OmemoError::InvalidFragment(format!(
            "expected {FRAGMENT_LENGTH} hex characters, got {}",
            fragment.len()
        )));
    }
    let split = 2 * AESGCM_FILE_NONCE_LENGTH;
    let (nonce_hex, key_hex) = fragment.split_at(split);
    let nonce = hex::decode(nonce_hex)
        .map_err(|e| OmemoError::InvalidFragment(format!("nonce: {e}")))?;
    let key = Zeroizing::new(
        hex::decode(key_hex).map_err(|e| OmemoError::InvalidFragment(format!("key: {e}")))?,
    );
    Ok((nonce, key))
}

/// Turn the HTTPS upload URL and a fragment into an `aesgcm://` link.
pub fn format_aesgcm_url(https_url: &str, fragment: &str) -> Result<String, OmemoError> {
    let rest = https_url.strip_prefix(HTTPS_SCHEME).ok_or_else(|| {
        OmemoError::InvalidFragment(format!("not an https url: {https_url}"))
    })?;
    if rest.contains('#') {
        return Err(OmemoError::InvalidFragment(
            "upload url already has a fragment".into(),
        ));
    }
    parse_fragment(fragment)?;
    Ok(format!("{AESGCM_SCHEME}{rest}#{fragment}"))
}

/// Split an `aesgcm://` link into the HTTPS download URL and the fragment.
pub fn parse_aesgcm_url(url: &str) -> Result<(String, String), OmemoError> {
    let rest = url
        .strip_prefix(AESGCM_SCHEME)
        .ok_or_else(|| OmemoError::InvalidFragment(format!("not an aesgcm url: {url}")))?;
    let (location, fragment) = rest
        .rsplit_once('#')
        .ok_or_else(|| OmemoError::InvalidFragment("aesgcm url has no fragment".into()))?;
    parse_fragment(fragment)?;
    Ok((format!("{HTTPS_SCHEME}{location}"), fragment.to_string()))
}
