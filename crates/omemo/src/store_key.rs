//! At-rest encryption key for account stores.
//!
//! A 32-byte master key comes from the OS keychain (one entry per account) or
//! from a passphrase via Argon2id. Each account database gets its own SQLCipher
//! key expanded from the master key with HKDF-SHA256.

use hkdf::Hkdf;
use sha2::Sha256;
use tern_shared::BareJid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::CryptoProvider;
use crate::error::OmemoError;

const KEYCHAIN_SERVICE: &str = "im.tern.omemo";
const STORE_KEY_INFO_PREFIX: &[u8] = b"tern-omemo-store-v1:";
const MIN_SALT_LEN: usize = 16;

/// A 32-byte master key, wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// SQLCipher raw key (`x'..'`) for one account database.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StoreKey {
    pragma: String,
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreKey")
            .field("pragma", &"[REDACTED]")
            .finish()
    }
}

impl StoreKey {
    /// Wrap already-derived raw key bytes.
    pub fn from_bytes(mut bytes: [u8; 32]) -> Self {
        let mut hex_str = hex::encode(bytes);
        bytes.zeroize();
        let key = Self {
            pragma: format!("x'{hex_str}'"),
        };
        hex_str.zeroize();
        key
    }

    pub fn as_pragma_value(&self) -> &str {
        &self.pragma
    }
}

/// Load the account's master key from the OS keychain, creating it on first use.
pub fn master_key_from_keychain(
    account: &BareJid,
    crypto: &dyn CryptoProvider,
) -> Result<MasterKey, OmemoError> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, account.as_str())
        .map_err(|_| OmemoError::KeychainUnavailable)?;

    match entry.get_password() {
        Ok(hex_string) => {
            let hex_string = Zeroizing::new(hex_string);
            let bytes = Zeroizing::new(
                hex::decode(hex_string.as_str())
                    .map_err(|_| OmemoError::Keychain("malformed master key in keychain".into()))?,
            );
            if bytes.len() != 32 {
                return Err(OmemoError::Keychain("malformed master key in keychain".into()));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            Ok(MasterKey { key })
        }
        Err(keyring::Error::NoEntry) => {
            let fresh = Zeroizing::new(crypto.random_bytes(32)?);
            let mut key = [0u8; 32];
            key.copy_from_slice(&fresh);
            let hex_string = Zeroizing::new(hex::encode(key));
            entry.set_password(&hex_string)?;
            tracing::info!(account = %account, "created store master key in keychain");
            Ok(MasterKey { key })
        }
        Err(e) => Err(OmemoError::from(e)),
    }
}

/// Derive a master key from a passphrase and salt with Argon2id.
pub fn master_key_from_passphrase(passphrase: &str, salt: &[u8]) -> Result<MasterKey, OmemoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(OmemoError::Config("salt too short".into()));
    }

    let params = argon2::Params::new(65536, 3, 4, Some(32))
        .map_err(|e| OmemoError::Config(e.to_string()))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| OmemoError::Config(e.to_string()))?;
    Ok(MasterKey { key })
}

/// Fresh salt for [`master_key_from_passphrase`], to be stored next to the
/// account.
pub fn generate_salt(crypto: &dyn CryptoProvider) -> Result<[u8; MIN_SALT_LEN], OmemoError> {
    let bytes = crypto.random_bytes(MIN_SALT_LEN)?;
    let mut salt = [0u8; MIN_SALT_LEN];
    salt.copy_from_slice(&bytes);
    Ok(salt)
}

/// Expand the master key into the store key for `account`.
pub fn derive_store_key(master: &MasterKey, account: &BareJid) -> Result<StoreKey, OmemoError> {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut info = STORE_KEY_INFO_PREFIX.to_vec();
    info.extend_from_slice(account.as_str().as_bytes());

    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|e| OmemoError::Config(e.to_string()))?;
    Ok(StoreKey::from_bytes(okm))
}

/// Key the connection and check that SQLCipher is present.
///
/// The raw `x'..'` form is a SQL literal; bound as a parameter SQLCipher would
/// treat it as a passphrase and run its own KDF over it.
pub fn apply_store_key(conn: &rusqlite::Connection, key: &StoreKey) -> Result<(), OmemoError> {
    conn.execute_batch(&format!("PRAGMA key = \"{}\";", key.as_pragma_value()))?;

    let cipher_version: String = conn
        .pragma_query_value(None, "cipher_version", |row| row.get(0))
        .map_err(|_| OmemoError::StoreLoad("SQLCipher not available".into()))?;
    if cipher_version.is_empty() {
        return Err(OmemoError::StoreLoad("SQLCipher not available".into()));
    }
    Ok(())
}
