//! IdentityKeyStore trait implementation and trust records for CryptoStore.
//!
//! `crypto_trusted_identities` holds one accepted identity key per remote
//! (JID, device). Whether an unseen key is acceptable depends on the store's
//! trust mode.

use async_trait::async_trait;
use libsignal_protocol::{
    Direction, IdentityChange, IdentityKey, IdentityKeyPair, IdentityKeyStore, ProtocolAddress,
    SignalProtocolError,
};
use rusqlite::OptionalExtension;
use tern_shared::{BareJid, DeviceId};

use crate::config::TrustMode;
use crate::error::OmemoError;
use crate::storage::{now_secs, split_address, CryptoStore};

impl CryptoStore<'_> {
    /// Persist the local identity key pair (single row).
    pub fn save_local_identity(&self, pair: &IdentityKeyPair) -> Result<(), OmemoError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO crypto_identity_keys (id, public_key, private_key, created_at)
             VALUES (1, ?1, ?2, ?3)",
            rusqlite::params![
                pair.identity_key().serialize().as_ref(),
                pair.private_key().serialize(),
                now_secs()
            ],
        )?;
        Ok(())
    }

    pub fn has_local_identity(&self) -> Result<bool, OmemoError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM crypto_identity_keys WHERE id = 1",
            [],
            |row| row.get(0),
        )?)
    }

    /// Record `identity_key` as trusted for the device, replacing any earlier key.
    pub fn set_trusted(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        identity_key: &[u8],
    ) -> Result<(), OmemoError> {
        self.conn.execute(
            "INSERT INTO crypto_trusted_identities (address, device_id, identity_key, trusted_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(address, device_id) DO UPDATE SET
                 identity_key = excluded.identity_key,
                 trusted_at = excluded.trusted_at",
            rusqlite::params![jid.as_str(), device_id.get(), identity_key, now_secs()],
        )?;
        Ok(())
    }

    /// Remove the trust record. Returns whether one existed.
    pub fn remove_trusted(&self, jid: &BareJid, device_id: DeviceId) -> Result<bool, OmemoError> {
        let removed = self.conn.execute(
            "DELETE FROM crypto_trusted_identities WHERE address = ?1 AND device_id = ?2",
            rusqlite::params![jid.as_str(), device_id.get()],
        )?;
        Ok(removed > 0)
    }

    /// Raw (type-prefixed) identity key trusted for the device, if any.
    pub fn trusted_identity(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
    ) -> Result<Option<Vec<u8>>, OmemoError> {
        Ok(self
            .conn
            .query_row(
                "SELECT identity_key FROM crypto_trusted_identities WHERE address = ?1 AND device_id = ?2",
                rusqlite::params![jid.as_str(), device_id.get()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Device whose trust record holds exactly `identity_key`, if any.
    pub fn device_trusting(
        &self,
        jid: &BareJid,
        identity_key: &[u8],
    ) -> Result<Option<DeviceId>, OmemoError> {
        let id: Option<u32> = self
            .conn
            .query_row(
                "SELECT device_id FROM crypto_trusted_identities
                 WHERE address = ?1 AND identity_key = ?2
                 ORDER BY trusted_at DESC LIMIT 1",
                rusqlite::params![jid.as_str(), identity_key],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|id| DeviceId::new(id).map_err(|e| OmemoError::StoreLoad(e.to_string())))
            .transpose()
    }

    pub fn trusted_devices(&self, jid: &BareJid) -> Result<Vec<DeviceId>, OmemoError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id FROM crypto_trusted_identities WHERE address = ?1 ORDER BY device_id",
        )?;
        let ids = stmt
            .query_map([jid.as_str()], |row| row.get::<_, u32>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|id| DeviceId::new(id).map_err(|e| OmemoError::StoreLoad(e.to_string())))
            .collect()
    }

    fn lookup_trusted(&self, address: &ProtocolAddress) -> Result<Option<Vec<u8>>, SignalProtocolError> {
        let (jid, device_id) = split_address(address)?;
        self.conn
            .query_row(
                "SELECT identity_key FROM crypto_trusted_identities WHERE address = ?1 AND device_id = ?2",
                rusqlite::params![jid, device_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SignalProtocolError::InvalidState("lookup_trusted", e.to_string()))
    }
}

#[async_trait(?Send)]
impl IdentityKeyStore for CryptoStore<'_> {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        let (pub_bytes, priv_bytes): (Vec<u8>, Vec<u8>) = self
            .conn
            .query_row(
                "SELECT public_key, private_key FROM crypto_identity_keys WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| {
                SignalProtocolError::InvalidState(
                    "get_identity_key_pair",
                    "no identity key stored".into(),
                )
            })?;

        let public = IdentityKey::decode(&pub_bytes)?;
        let private = libsignal_protocol::PrivateKey::deserialize(&priv_bytes)?;
        Ok(IdentityKeyPair::new(public, private))
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        self.get_config_u32(crate::storage::config_keys::REGISTRATION_ID)
            .map_err(|e| {
                SignalProtocolError::InvalidState("get_local_registration_id", e.to_string())
            })?
            .ok_or_else(|| {
                SignalProtocolError::InvalidState(
                    "get_local_registration_id",
                    "registration_id not found in config".into(),
                )
            })
    }

    /// Accepting a key always records it; callers only reach here after
    /// `is_trusted_identity` allowed it.
    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<IdentityChange, SignalProtocolError> {
        let existing = self.lookup_trusted(address)?;
        let key_bytes = identity.serialize();
        let changed = existing
            .as_ref()
            .map(|existing_key| existing_key.as_slice() != key_bytes.as_ref())
            .unwrap_or(false);

        let (jid, device_id) = split_address(address)?;
        self.conn
            .execute(
                "INSERT INTO crypto_trusted_identities (address, device_id, identity_key, trusted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(address, device_id) DO UPDATE SET identity_key = excluded.identity_key",
                rusqlite::params![jid, device_id, key_bytes.as_ref(), now_secs()],
            )
            .map_err(|e| SignalProtocolError::InvalidState("save_identity", e.to_string()))?;

        if existing.is_none() {
            tracing::info!(jid, device_id, "trusted new identity");
        }
        Ok(IdentityChange::from_changed(changed))
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        if self.trust_mode() == TrustMode::Blind {
            return Ok(true);
        }
        Ok(self
            .lookup_trusted(address)?
            .is_some_and(|stored| stored.as_slice() == identity.serialize().as_ref()))
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        self.lookup_trusted(address)?
            .map(|bytes| IdentityKey::decode(&bytes))
            .transpose()
    }
}
