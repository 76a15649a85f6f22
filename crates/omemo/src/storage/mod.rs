//! Per-account key store backed by SQLite.
//!
//! `CryptoStore` implements the libsignal store traits directly on top of a
//! borrowed connection. Every mutation is a single statement (or a short
//! transaction opened by the caller) and is durable when the call returns.

pub mod bundle_keys;
pub mod identity_store;
pub mod known_devices;
pub mod migrations;
pub mod pre_key_store;
pub mod session_store;

use std::path::Path;

use libsignal_protocol::{ProtocolAddress, SignalProtocolError};
use rusqlite::{Connection, OptionalExtension};
use tern_shared::{BareJid, DeviceId};

use crate::config::TrustMode;
use crate::error::OmemoError;
use crate::store_key::StoreKey;

/// Config keys in `crypto_config`.
pub(crate) mod config_keys {
    pub const DEVICE_ID: &str = "device_id";
    pub const REGISTRATION_ID: &str = "registration_id";
    pub const NEXT_PRE_KEY_ID: &str = "next_pre_key_id";
    pub const SIGNED_PRE_KEY_ID: &str = "signed_pre_key_id";
    pub const KYBER_PRE_KEY_ID: &str = "kyber_pre_key_id";
}

/// Store handle over one account database.
///
/// Cheap to construct; build a fresh one for each libsignal call the way
/// the session and message layers do.
pub struct CryptoStore<'a> {
    pub(crate) conn: &'a Connection,
    trust_mode: TrustMode,
}

impl<'a> CryptoStore<'a> {
    /// Store with the default (manual) trust policy.
    pub fn new(conn: &'a Connection) -> Self {
        Self::with_trust_mode(conn, TrustMode::default())
    }

    pub fn with_trust_mode(conn: &'a Connection, trust_mode: TrustMode) -> Self {
        Self { conn, trust_mode }
    }

    pub fn trust_mode(&self) -> TrustMode {
        self.trust_mode
    }

    pub fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>, OmemoError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM crypto_config WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn store_config(&self, key: &str, value: &[u8]) -> Result<(), OmemoError> {
        self.conn.execute(
            "INSERT INTO crypto_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Read a big-endian u32 config value.
    pub fn get_config_u32(&self, key: &str) -> Result<Option<u32>, OmemoError> {
        match self.get_config(key)? {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| OmemoError::StoreLoad(format!("invalid {key} length")))?;
                Ok(Some(u32::from_be_bytes(arr)))
            }
        }
    }

    pub fn store_config_u32(&self, key: &str, value: u32) -> Result<(), OmemoError> {
        self.store_config(key, &value.to_be_bytes())
    }
}

/// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
pub fn with_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&CryptoStore<'_>) -> Result<T, OmemoError>,
) -> Result<T, OmemoError> {
    let tx = conn.unchecked_transaction()?;
    let store = CryptoStore::new(conn);
    let value = f(&store)?;
    tx.commit()?;
    Ok(value)
}

/// libsignal address for a remote OMEMO device.
///
/// libsignal bounds its own device ids well below the 31-bit OMEMO range, so
/// the OMEMO device id travels in the address name and libsignal always sees
/// device 1. Bare JIDs never contain ':'.
pub fn protocol_address(jid: &BareJid, device_id: DeviceId) -> ProtocolAddress {
    ProtocolAddress::new(
        format!("{jid}:{device_id}"),
        libsignal_protocol::DeviceId::new(1).expect("device ID 1 is valid"),
    )
}

/// Inverse of [`protocol_address`]: `(bare jid, omemo device id)` as stored.
pub(crate) fn split_address(
    address: &ProtocolAddress,
) -> Result<(&str, u32), SignalProtocolError> {
    address
        .name()
        .rsplit_once(':')
        .and_then(|(jid, device)| device.parse::<u32>().ok().map(|d| (jid, d)))
        .ok_or_else(|| {
            SignalProtocolError::InvalidArgument(format!(
                "address {} does not carry an OMEMO device id",
                address.name()
            ))
        })
}

pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Open (creating if needed) the account database at `path` and run migrations.
///
/// With a key, the database is SQLCipher-encrypted; a wrong key surfaces as
/// `StoreLoad` on the first read.
pub fn open_database(path: &Path, key: Option<&StoreKey>) -> Result<Connection, OmemoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| OmemoError::StoreLoad(format!("{}: {e}", parent.display())))?;
    }
    let conn = Connection::open(path).map_err(|e| OmemoError::StoreLoad(e.to_string()))?;
    if let Some(key) = key {
        crate::store_key::apply_store_key(&conn, key)
            .map_err(|e| OmemoError::StoreLoad(e.to_string()))?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| OmemoError::StoreLoad(e.to_string()))?;
    migrations::run_crypto_migrations(&conn).map_err(|e| OmemoError::StoreLoad(e.to_string()))?;
    tracing::debug!(path = %path.display(), encrypted = key.is_some(), "opened omemo store");
    Ok(conn)
}

/// Fresh in-memory store with the schema applied.
pub fn open_in_memory() -> Result<Connection, OmemoError> {
    let conn = Connection::open_in_memory()?;
    migrations::run_crypto_migrations(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub(crate) fn init_test_db() -> Connection {
    open_in_memory().unwrap()
}
