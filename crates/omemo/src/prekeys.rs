//! Pre-key management and the published device bundle.
//!
//! One-time pre-key ids come from a persisted counter so an id is never
//! issued twice, even after the key it named was consumed and deleted.

use libsignal_protocol::{
    kem, GenericSignedPreKey, IdentityKey, IdentityKeyPair, KeyPair, KyberPreKeyId,
    KyberPreKeyRecord, PreKeyBundle, PreKeyId, PreKeyRecord, PreKeyStore, PublicKey,
    SignedPreKeyId, SignedPreKeyRecord, Timestamp,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoProvider;
use crate::error::OmemoError;
use crate::identity;
use crate::storage::{config_keys, with_transaction, CryptoStore};

/// One published one-time pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePreKey {
    pub id: u32,
    #[serde(with = "tern_shared::base64_serde")]
    pub public_key: Vec<u8>,
}

/// Everything a peer needs to start a session with this device without it
/// being online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmemoBundle {
    pub registration_id: u32,
    /// Type-prefixed identity public key.
    #[serde(with = "tern_shared::base64_serde")]
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    #[serde(with = "tern_shared::base64_serde")]
    pub signed_pre_key: Vec<u8>,
    #[serde(with = "tern_shared::base64_serde")]
    pub signed_pre_key_signature: Vec<u8>,
    pub kyber_pre_key_id: u32,
    #[serde(with = "tern_shared::base64_serde")]
    pub kyber_pre_key: Vec<u8>,
    #[serde(with = "tern_shared::base64_serde")]
    pub kyber_pre_key_signature: Vec<u8>,
    pub pre_keys: Vec<BundlePreKey>,
}

impl OmemoBundle {
    pub fn identity(&self) -> Result<IdentityKey, OmemoError> {
        IdentityKey::decode(&self.identity_key)
            .map_err(|e| OmemoError::InvalidBundle(format!("identity key: {e}")))
    }

    /// Check both pre-key signatures against the bundle's identity key.
    pub fn verify(&self) -> Result<IdentityKey, OmemoError> {
        let identity = self.identity()?;
        let signed = PublicKey::deserialize(&self.signed_pre_key)
            .map_err(|e| OmemoError::InvalidBundle(format!("signed pre-key: {e}")))?;
        if !identity
            .public_key()
            .verify_signature(&signed.serialize(), &self.signed_pre_key_signature)
        {
            return Err(OmemoError::InvalidBundle(
                "signed pre-key signature does not verify".into(),
            ));
        }
        if !identity
            .public_key()
            .verify_signature(&self.kyber_pre_key, &self.kyber_pre_key_signature)
        {
            return Err(OmemoError::InvalidBundle(
                "kyber pre-key signature does not verify".into(),
            ));
        }
        Ok(identity)
    }

    /// Pick one published pre-key uniformly at random.
    pub fn select_pre_key(
        &self,
        crypto: &dyn CryptoProvider,
    ) -> Result<Option<&BundlePreKey>, OmemoError> {
        if self.pre_keys.is_empty() {
            return Ok(None);
        }
        let bytes = crypto.random_bytes(4)?;
        let roll = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        Ok(self.pre_keys.get(roll % self.pre_keys.len()))
    }

    /// Build the libsignal bundle for `device_id` using `pre_key` (if any).
    pub fn to_pre_key_bundle(
        &self,
        pre_key: Option<&BundlePreKey>,
    ) -> Result<PreKeyBundle, OmemoError> {
        let identity = self.verify()?;
        let signed = PublicKey::deserialize(&self.signed_pre_key)
            .map_err(|e| OmemoError::InvalidBundle(format!("signed pre-key: {e}")))?;
        let kyber = kem::PublicKey::deserialize(&self.kyber_pre_key)
            .map_err(|e| OmemoError::InvalidBundle(format!("kyber pre-key: {e}")))?;
        let one_time = pre_key
            .map(|k| {
                PublicKey::deserialize(&k.public_key)
                    .map(|pk| (PreKeyId::from(k.id), pk))
                    .map_err(|e| OmemoError::InvalidBundle(format!("pre-key {}: {e}", k.id)))
            })
            .transpose()?;

        PreKeyBundle::new(
            self.registration_id,
            libsignal_protocol::DeviceId::new(1).expect("device ID 1 is valid"),
            one_time,
            SignedPreKeyId::from(self.signed_pre_key_id),
            signed,
            self.signed_pre_key_signature.clone(),
            KyberPreKeyId::from(self.kyber_pre_key_id),
            kyber,
            self.kyber_pre_key_signature.clone(),
            identity,
        )
        .map_err(|e| OmemoError::InvalidBundle(e.to_string()))
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Create and store the signed pre-key `id`, signed by `identity`.
pub fn generate_signed_pre_key(
    store: &CryptoStore<'_>,
    crypto: &dyn CryptoProvider,
    identity: &IdentityKeyPair,
    id: u32,
) -> Result<(), OmemoError> {
    let mut rng = crypto.rng()?;
    let pair = KeyPair::generate(&mut rng);
    let signature = identity
        .private_key()
        .calculate_signature(&pair.public_key.serialize(), &mut rng)?;
    let record = SignedPreKeyRecord::new(
        SignedPreKeyId::from(id),
        Timestamp::from_epoch_millis(now_millis()),
        &pair,
        &signature,
    );
    store.put_signed_pre_key(&record)
}

/// Create and store the Kyber last-resort pre-key `id`.
pub fn generate_kyber_pre_key(
    store: &CryptoStore<'_>,
    identity: &IdentityKeyPair,
    id: u32,
) -> Result<(), OmemoError> {
    let record = KyberPreKeyRecord::generate(
        kem::KeyType::Kyber1024,
        KyberPreKeyId::from(id),
        identity.private_key(),
    )?;
    store.put_kyber_pre_key(&record)
}

/// Generate `count` one-time pre-keys with fresh ids. Returns the ids.
pub fn generate_pre_keys(
    store: &CryptoStore<'_>,
    crypto: &dyn CryptoProvider,
    count: u32,
) -> Result<Vec<u32>, OmemoError> {
    let start = store
        .get_config_u32(config_keys::NEXT_PRE_KEY_ID)?
        .unwrap_or(0);
    let end = start
        .checked_add(count)
        .ok_or_else(|| OmemoError::Storage("pre-key id space exhausted".into()))?;

    let mut rng = crypto.rng()?;
    let mut writer = CryptoStore::new(store.conn);
    for id in start..end {
        let pair = KeyPair::generate(&mut rng);
        let record = PreKeyRecord::new(PreKeyId::from(id), &pair);
        futures::executor::block_on(writer.save_pre_key(PreKeyId::from(id), &record))?;
    }
    store.store_config_u32(config_keys::NEXT_PRE_KEY_ID, end)?;
    Ok((start..end).collect())
}

/// Top the pre-key supply back up to `target` once it drops below
/// `low_watermark`. Returns how many keys were generated.
pub fn replenish(
    conn: &Connection,
    crypto: &dyn CryptoProvider,
    target: u32,
    low_watermark: u32,
) -> Result<u32, OmemoError> {
    with_transaction(conn, |store| {
        let remaining = store.count_pre_keys()?;
        if remaining >= low_watermark || remaining >= target {
            return Ok(0);
        }
        let generated = generate_pre_keys(store, crypto, target - remaining)?.len() as u32;
        tracing::info!(remaining, generated, "replenished pre-keys");
        Ok(generated)
    })
}

/// Assemble the bundle to publish from the stored key material.
pub fn build_bundle(conn: &Connection) -> Result<OmemoBundle, OmemoError> {
    let local = identity::load_identity(conn)?.ok_or(OmemoError::IdentityNotInitialized)?;
    let store = CryptoStore::new(conn);

    let signed = store
        .current_signed_pre_key()?
        .ok_or_else(|| OmemoError::StoreLoad("no signed pre-key".into()))?;
    let kyber = store
        .current_kyber_pre_key()?
        .ok_or_else(|| OmemoError::StoreLoad("no kyber pre-key".into()))?;

    let pre_keys = store
        .load_pre_keys()?
        .iter()
        .map(|record| {
            Ok(BundlePreKey {
                id: record.id()?.into(),
                public_key: record.public_key()?.serialize().to_vec(),
            })
        })
        .collect::<Result<Vec<_>, libsignal_protocol::SignalProtocolError>>()?;

    Ok(OmemoBundle {
        registration_id: local.registration_id,
        identity_key: local.key_pair.identity_key().serialize().to_vec(),
        signed_pre_key_id: signed.id()?.into(),
        signed_pre_key: signed.public_key()?.serialize().to_vec(),
        signed_pre_key_signature: signed.signature()?,
        kyber_pre_key_id: kyber.id()?.into(),
        kyber_pre_key: kyber.public_key()?.serialize().to_vec(),
        kyber_pre_key_signature: kyber.signature()?,
        pre_keys,
    })
}
