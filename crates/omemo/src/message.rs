//! Chat message bodies: one AES-128-GCM payload, one wrapped key per device.
//!
//! The payload key and its GCM tag travel together as `key || tag` (32
//! bytes), encrypted separately for every recipient device through that
//! device's Signal session.

use serde::{Deserialize, Serialize};
use tern_shared::constants::{AES128_GCM_IV_LENGTH, AES128_GCM_KEY_LENGTH, AES_GCM_TAG_LENGTH};
use tern_shared::{BareJid, DeviceId};
use zeroize::Zeroizing;

use crate::crypto::CryptoProvider;
use crate::error::OmemoError;

const KEYTAG_LENGTH: usize = AES128_GCM_KEY_LENGTH + AES_GCM_TAG_LENGTH;

/// Payload key wrapped for one recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientKey {
    pub device_id: DeviceId,
    #[serde(with = "tern_shared::base64_serde")]
    pub data: Vec<u8>,
    /// The blob is a pre-key message that also establishes the session.
    pub prekey: bool,
}

/// Encrypted message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub sender_device_id: DeviceId,
    #[serde(with = "tern_shared::base64_serde")]
    pub iv: Vec<u8>,
    #[serde(with = "tern_shared::base64_serde")]
    pub ciphertext: Vec<u8>,
    pub keys: Vec<RecipientKey>,
}

impl EncryptedEnvelope {
    pub fn key_for(&self, device_id: DeviceId) -> Option<&RecipientKey> {
        self.keys.iter().find(|key| key.device_id == device_id)
    }
}

/// Per-device wrapping of the payload key through a Signal session.
pub trait SessionCipher {
    /// Returns the blob and whether it is a pre-key message.
    fn encrypt_key(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        keytag: &[u8],
    ) -> Result<(Vec<u8>, bool), OmemoError>;

    fn decrypt_key(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        blob: &[u8],
        prekey: bool,
    ) -> Result<Zeroizing<Vec<u8>>, OmemoError>;
}

/// Encrypts and decrypts message bodies on behalf of one local device.
pub struct MessageCodec<'a> {
    crypto: &'a dyn CryptoProvider,
    own_jid: &'a BareJid,
    own_device: DeviceId,
}

impl<'a> MessageCodec<'a> {
    pub fn new(crypto: &'a dyn CryptoProvider, own_jid: &'a BareJid, own_device: DeviceId) -> Self {
        Self {
            crypto,
            own_jid,
            own_device,
        }
    }

    /// Encrypt `plaintext` for every `(jid, device)` in `recipients`.
    ///
    /// The sending device is always skipped. Devices whose key cannot be
    /// wrapped are logged and left out; if none remain the whole message
    /// fails with `NoRecipientKey`.
    pub fn encrypt(
        &self,
        cipher: &dyn SessionCipher,
        plaintext: &[u8],
        recipients: &[(BareJid, DeviceId)],
    ) -> Result<EncryptedEnvelope, OmemoError> {
        let key = Zeroizing::new(self.crypto.random_bytes(AES128_GCM_KEY_LENGTH)?);
        let iv = self.crypto.random_bytes(AES128_GCM_IV_LENGTH)?;
        let (ciphertext, tag) = self.crypto.aes128_gcm_encrypt(&key, &iv, plaintext)?;

        let mut keytag = Zeroizing::new(Vec::with_capacity(KEYTAG_LENGTH));
        keytag.extend_from_slice(&key);
        keytag.extend_from_slice(&tag);

        let mut keys = Vec::new();
        for (jid, device_id) in recipients {
            if jid == self.own_jid && *device_id == self.own_device {
                continue;
            }
            match cipher.encrypt_key(jid, *device_id, &keytag) {
                Ok((data, prekey)) => keys.push(RecipientKey {
                    device_id: *device_id,
                    data,
                    prekey,
                }),
                Err(e) if e.is_user_visible() => {
                    tracing::warn!(jid = %jid, device_id = %device_id, error = %e, "skipping device");
                }
                Err(e) => {
                    tracing::debug!(jid = %jid, device_id = %device_id, error = %e, "skipping device");
                }
            }
        }

        if keys.is_empty() {
            return Err(OmemoError::NoRecipientKey);
        }

        Ok(EncryptedEnvelope {
            sender_device_id: self.own_device,
            iv,
            ciphertext,
            keys,
        })
    }

    /// Decrypt an envelope from `sender`.
    pub fn decrypt(
        &self,
        cipher: &dyn SessionCipher,
        sender: &BareJid,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>, OmemoError> {
        let entry = envelope
            .key_for(self.own_device)
            .ok_or(OmemoError::NoKeyForThisDevice)?;

        let keytag = cipher.decrypt_key(
            sender,
            envelope.sender_device_id,
            &entry.data,
            entry.prekey,
        )?;
        if keytag.len() != KEYTAG_LENGTH {
            return Err(OmemoError::InvalidKeyLength {
                expected: KEYTAG_LENGTH,
                actual: keytag.len(),
            });
        }

        let (key, tag) = keytag.split_at(AES128_GCM_KEY_LENGTH);
        Ok(self
            .crypto
            .aes128_gcm_decrypt(key, &envelope.iv, &envelope.ciphertext, tag)?)
    }
}
