/// Client-wide error type shared between the XMPP layers.
#[derive(Debug, thiserror::Error)]
pub enum TernError {
    #[error("invalid jid: {0}")]
    InvalidJid(String),

    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    /// Encryption is unavailable for this session; messages go out unencrypted
    /// only if the user asks for it.
    #[error("encryption unavailable: {0}")]
    EncryptionUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::jid::JidError> for TernError {
    fn from(err: crate::jid::JidError) -> Self {
        TernError::InvalidJid(err.to_string())
    }
}

impl From<crate::ids::InvalidDeviceId> for TernError {
    fn from(err: crate::ids::InvalidDeviceId) -> Self {
        TernError::InvalidDeviceId(err.to_string())
    }
}
