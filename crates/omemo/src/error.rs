//! Error types for the tern-omemo crate.

use tern_shared::{BareJid, DeviceId};
use thiserror::Error;

/// Failure of a cryptographic primitive.
///
/// Fatal for the single operation that raised it; never a silent no-op.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The system random source could not produce bytes.
    #[error("random source unavailable: {0}")]
    RandomUnavailable(String),

    /// A key, IV or nonce had the wrong size or encoding.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// A GCM tag did not verify.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// CBC padding was malformed on decrypt.
    #[error("invalid padding")]
    Padding,

    /// Reading or writing a stream failed mid-operation.
    #[error("stream error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        CryptoError::Io(err.to_string())
    }
}

/// Errors raised by the OMEMO subsystem.
#[derive(Debug, Error)]
pub enum OmemoError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The device's identity key is not trusted under the current policy.
    #[error("untrusted identity for {jid} device {device_id}")]
    Untrusted { jid: BareJid, device_id: DeviceId },

    /// No established session exists for the device.
    #[error("no session for {jid} device {device_id}")]
    NoSession { jid: BareJid, device_id: DeviceId },

    /// Not a single recipient device could be given a key; nothing was sent.
    #[error("no trusted recipient device could receive the message key")]
    NoRecipientKey,

    /// The envelope carries no key for this device.
    #[error("message carries no key for this device")]
    NoKeyForThisDevice,

    /// The unwrapped payload key had the wrong size.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// A bundle failed validation (bad signature, undecodable key).
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    /// A file secret fragment or aesgcm URL could not be parsed.
    #[error("invalid file fragment: {0}")]
    InvalidFragment(String),

    /// A user-supplied fingerprint is not valid hex.
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// No known device carries the given fingerprint.
    #[error("unknown fingerprint {fingerprint} for {jid}")]
    UnknownFingerprint { jid: BareJid, fingerprint: String },

    /// Persisted key material is missing or corrupt; OMEMO is disabled.
    #[error("failed to load key store: {0}")]
    StoreLoad(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signal protocol error: {0}")]
    SignalProtocol(String),

    /// The transport collaborator could not deliver a request or stanza.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("identity not initialized")]
    IdentityNotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("keychain error: {0}")]
    Keychain(String),

    #[error("keychain entry not found")]
    KeychainEntryNotFound,

    #[error("keychain unavailable")]
    KeychainUnavailable,
}

impl OmemoError {
    /// Whether the failure should reach the end user.
    ///
    /// Per-device trust variance (one of several devices untrusted or
    /// without a session) is routine and only logged. Whole-message and
    /// store failures are surfaced.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            OmemoError::Untrusted { .. }
                | OmemoError::NoSession { .. }
                | OmemoError::NoKeyForThisDevice
                | OmemoError::InvalidBundle(_)
        )
    }
}

impl From<rusqlite::Error> for OmemoError {
    fn from(err: rusqlite::Error) -> Self {
        OmemoError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OmemoError {
    fn from(err: serde_json::Error) -> Self {
        OmemoError::Serialization(err.to_string())
    }
}

impl From<libsignal_protocol::SignalProtocolError> for OmemoError {
    fn from(err: libsignal_protocol::SignalProtocolError) -> Self {
        OmemoError::SignalProtocol(err.to_string())
    }
}

impl From<keyring::Error> for OmemoError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::NoEntry => OmemoError::KeychainEntryNotFound,
            keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
                OmemoError::KeychainUnavailable
            }
            other => OmemoError::Keychain(other.to_string()),
        }
    }
}

impl From<OmemoError> for tern_shared::error::TernError {
    fn from(err: OmemoError) -> Self {
        match err {
            OmemoError::StoreLoad(msg) => tern_shared::error::TernError::EncryptionUnavailable(msg),
            other => tern_shared::error::TernError::Encryption(other.to_string()),
        }
    }
}
