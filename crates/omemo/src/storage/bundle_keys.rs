//! The two medium-term keys a bundle advertises: the signed pre-key and the
//! Kyber last-resort pre-key.
//!
//! Each is written once, together with its id under `crypto_config`, and
//! never replaced afterwards. Only one-time pre-keys rotate.

use async_trait::async_trait;
use libsignal_protocol::{
    GenericSignedPreKey, KyberPreKeyId, KyberPreKeyRecord, KyberPreKeyStore, PublicKey,
    SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord, SignedPreKeyStore,
};
use rusqlite::OptionalExtension;

use crate::error::OmemoError;
use crate::storage::{config_keys, now_secs, CryptoStore};

#[derive(Debug, Clone, Copy)]
enum BundleKey {
    Signed,
    Kyber,
}

impl BundleKey {
    fn table(self) -> &'static str {
        match self {
            BundleKey::Signed => "crypto_signed_pre_keys",
            BundleKey::Kyber => "crypto_kyber_pre_keys",
        }
    }

    fn config_key(self) -> &'static str {
        match self {
            BundleKey::Signed => config_keys::SIGNED_PRE_KEY_ID,
            BundleKey::Kyber => config_keys::KYBER_PRE_KEY_ID,
        }
    }

    fn label(self) -> &'static str {
        match self {
            BundleKey::Signed => "signed pre-key",
            BundleKey::Kyber => "kyber pre-key",
        }
    }
}

impl CryptoStore<'_> {
    fn bundle_key_record(&self, kind: BundleKey, id: u32) -> rusqlite::Result<Option<Vec<u8>>> {
        self.conn
            .query_row(
                &format!("SELECT record FROM {} WHERE key_id = ?1", kind.table()),
                [id],
                |row| row.get(0),
            )
            .optional()
    }

    fn put_bundle_key(&self, kind: BundleKey, id: u32, record: &[u8]) -> Result<(), OmemoError> {
        let present: bool = self.conn.query_row(
            &format!("SELECT COUNT(*) > 0 FROM {}", kind.table()),
            [],
            |row| row.get(0),
        )?;
        if present {
            return Err(OmemoError::Storage(format!("{} already stored", kind.label())));
        }
        self.conn.execute(
            &format!(
                "INSERT INTO {} (key_id, record, created_at) VALUES (?1, ?2, ?3)",
                kind.table()
            ),
            rusqlite::params![id, record, now_secs()],
        )?;
        self.store_config_u32(kind.config_key(), id)?;
        tracing::debug!(key = kind.label(), id, "stored bundle key");
        Ok(())
    }

    /// Record bytes of the key named by the current id, `None` before the
    /// identity exists.
    fn current_bundle_key(&self, kind: BundleKey) -> Result<Option<Vec<u8>>, OmemoError> {
        let Some(id) = self.get_config_u32(kind.config_key())? else {
            return Ok(None);
        };
        self.bundle_key_record(kind, id)?
            .map(Some)
            .ok_or_else(|| OmemoError::StoreLoad(format!("{} {id} missing", kind.label())))
    }

    /// Store the device's signed pre-key and make it current. Fails if one
    /// is already stored.
    pub fn put_signed_pre_key(&self, record: &SignedPreKeyRecord) -> Result<(), OmemoError> {
        self.put_bundle_key(BundleKey::Signed, record.id()?.into(), &record.serialize()?)
    }

    pub fn current_signed_pre_key(&self) -> Result<Option<SignedPreKeyRecord>, OmemoError> {
        self.current_bundle_key(BundleKey::Signed)?
            .map(|bytes| {
                SignedPreKeyRecord::deserialize(&bytes)
                    .map_err(|e| OmemoError::StoreLoad(format!("signed pre-key: {e}")))
            })
            .transpose()
    }

    /// Store the Kyber last-resort pre-key and make it current. Fails if one
    /// is already stored.
    pub fn put_kyber_pre_key(&self, record: &KyberPreKeyRecord) -> Result<(), OmemoError> {
        self.put_bundle_key(BundleKey::Kyber, record.id()?.into(), &record.serialize()?)
    }

    pub fn current_kyber_pre_key(&self) -> Result<Option<KyberPreKeyRecord>, OmemoError> {
        self.current_bundle_key(BundleKey::Kyber)?
            .map(|bytes| {
                KyberPreKeyRecord::deserialize(&bytes)
                    .map_err(|e| OmemoError::StoreLoad(format!("kyber pre-key: {e}")))
            })
            .transpose()
    }
}

#[async_trait(?Send)]
impl SignedPreKeyStore for CryptoStore<'_> {
    async fn get_signed_pre_key(
        &self,
        signed_prekey_id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        let bytes = self
            .bundle_key_record(BundleKey::Signed, signed_prekey_id.into())
            .map_err(|e| SignalProtocolError::InvalidState("get_signed_pre_key", e.to_string()))?
            .ok_or(SignalProtocolError::InvalidSignedPreKeyId)?;
        SignedPreKeyRecord::deserialize(&bytes)
    }

    async fn save_signed_pre_key(
        &mut self,
        _signed_prekey_id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.put_signed_pre_key(record)
            .map_err(|e| SignalProtocolError::InvalidState("save_signed_pre_key", e.to_string()))
    }
}

#[async_trait(?Send)]
impl KyberPreKeyStore for CryptoStore<'_> {
    async fn get_kyber_pre_key(
        &self,
        kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        let bytes = self
            .bundle_key_record(BundleKey::Kyber, kyber_prekey_id.into())
            .map_err(|e| SignalProtocolError::InvalidState("get_kyber_pre_key", e.to_string()))?
            .ok_or(SignalProtocolError::InvalidKyberPreKeyId)?;
        KyberPreKeyRecord::deserialize(&bytes)
    }

    async fn save_kyber_pre_key(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
        record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.put_kyber_pre_key(record)
            .map_err(|e| SignalProtocolError::InvalidState("save_kyber_pre_key", e.to_string()))
    }

    /// Last resort: stays published after use.
    async fn mark_kyber_pre_key_used(
        &mut self,
        kyber_prekey_id: KyberPreKeyId,
        _ec_prekey_id: SignedPreKeyId,
        _base_key: &PublicKey,
    ) -> Result<(), SignalProtocolError> {
        let id: u32 = kyber_prekey_id.into();
        tracing::trace!(kyber_pre_key_id = id, "last-resort kyber pre-key used");
        Ok(())
    }
}
