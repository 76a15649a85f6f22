//! Local device identity: key pair, registration id and OMEMO device id.
//!
//! Created once per account on first connect together with the initial
//! pre-key batch and signed pre-key, then only ever loaded.

use libsignal_protocol::{IdentityKeyPair, IdentityKeyStore};
use rusqlite::Connection;
use tern_shared::constants::{OMEMO_MAX_REGISTRATION_ID, OMEMO_SIGNED_PRE_KEY_ID};
use tern_shared::DeviceId;

use crate::crypto::CryptoProvider;
use crate::error::OmemoError;
use crate::prekeys;
use crate::storage::{config_keys, with_transaction, CryptoStore};

/// Kyber last-resort pre-key id.
pub const KYBER_PRE_KEY_ID: u32 = 1;

/// The local device's long-term identity.
pub struct LocalIdentity {
    pub device_id: DeviceId,
    pub registration_id: u32,
    pub key_pair: IdentityKeyPair,
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("device_id", &self.device_id)
            .field("registration_id", &self.registration_id)
            .field("key_pair", &"[REDACTED]")
            .finish()
    }
}

/// Draw a 31-bit non-zero device id from the provider.
pub fn random_device_id(crypto: &dyn CryptoProvider) -> Result<DeviceId, OmemoError> {
    loop {
        let bytes = crypto.random_bytes(4)?;
        let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7FFF_FFFF;
        if let Ok(id) = DeviceId::new(raw) {
            return Ok(id);
        }
    }
}

/// Draw a registration id in `1..=16380`.
pub fn random_registration_id(crypto: &dyn CryptoProvider) -> Result<u32, OmemoError> {
    let bytes = crypto.random_bytes(4)?;
    let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok(raw % OMEMO_MAX_REGISTRATION_ID + 1)
}

/// Generate and persist a fresh identity with `pre_key_count` pre-keys,
/// signed pre-key 1 and the Kyber last-resort key.
///
/// Refuses to overwrite an existing identity; that would orphan every session.
pub fn generate_identity(
    conn: &Connection,
    crypto: &dyn CryptoProvider,
    pre_key_count: u32,
) -> Result<LocalIdentity, OmemoError> {
    let key_pair = IdentityKeyPair::generate(&mut crypto.rng()?);
    let device_id = random_device_id(crypto)?;
    let registration_id = random_registration_id(crypto)?;

    with_transaction(conn, |store| {
        if store.has_local_identity()? {
            return Err(OmemoError::Storage("identity already exists".into()));
        }
        store.save_local_identity(&key_pair)?;
        store.store_config_u32(config_keys::DEVICE_ID, device_id.get())?;
        store.store_config_u32(config_keys::REGISTRATION_ID, registration_id)?;
        prekeys::generate_signed_pre_key(store, crypto, &key_pair, OMEMO_SIGNED_PRE_KEY_ID)?;
        prekeys::generate_kyber_pre_key(store, &key_pair, KYBER_PRE_KEY_ID)?;
        prekeys::generate_pre_keys(store, crypto, pre_key_count)?;
        Ok(())
    })?;

    tracing::info!(device_id = %device_id, registration_id, "generated omemo identity");
    Ok(LocalIdentity {
        device_id,
        registration_id,
        key_pair,
    })
}

/// Load the stored identity. `Ok(None)` for a fresh store; `StoreLoad` when
/// the store holds only part of an identity.
pub fn load_identity(conn: &Connection) -> Result<Option<LocalIdentity>, OmemoError> {
    let store = CryptoStore::new(conn);
    if !store.has_local_identity()? {
        return Ok(None);
    }

    let key_pair = futures::executor::block_on(store.get_identity_key_pair())
        .map_err(|e| OmemoError::StoreLoad(format!("identity key: {e}")))?;
    let device_id = store
        .get_config_u32(config_keys::DEVICE_ID)?
        .ok_or_else(|| OmemoError::StoreLoad("device id missing".into()))
        .and_then(|id| DeviceId::new(id).map_err(|e| OmemoError::StoreLoad(e.to_string())))?;
    let registration_id = store
        .get_config_u32(config_keys::REGISTRATION_ID)?
        .ok_or_else(|| OmemoError::StoreLoad("registration id missing".into()))?;
    if store.current_signed_pre_key()?.is_none() {
        return Err(OmemoError::StoreLoad("signed pre-key missing".into()));
    }

    Ok(Some(LocalIdentity {
        device_id,
        registration_id,
        key_pair,
    }))
}

/// Load the identity, generating one on first use.
pub fn load_or_generate(
    conn: &Connection,
    crypto: &dyn CryptoProvider,
    pre_key_count: u32,
) -> Result<LocalIdentity, OmemoError> {
    match load_identity(conn)? {
        Some(identity) => {
            tracing::debug!(device_id = %identity.device_id, "loaded omemo identity");
            Ok(identity)
        }
        None => generate_identity(conn, crypto, pre_key_count),
    }
}
