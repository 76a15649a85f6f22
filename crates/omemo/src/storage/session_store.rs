//! SessionStore trait implementation for CryptoStore.
//!
//! Sessions are keyed by (bare JID, OMEMO device id), decoded from the
//! libsignal address name.

use async_trait::async_trait;
use libsignal_protocol::{ProtocolAddress, SessionRecord, SessionStore, SignalProtocolError};
use tern_shared::{BareJid, DeviceId};

use crate::error::OmemoError;
use crate::storage::{now_secs, split_address, CryptoStore};

impl CryptoStore<'_> {
    pub fn contains_session(&self, jid: &BareJid, device_id: DeviceId) -> Result<bool, OmemoError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM crypto_sessions WHERE address = ?1 AND device_id = ?2",
            rusqlite::params![jid.as_str(), device_id.get()],
            |row| row.get(0),
        )?)
    }

    /// Devices of `jid` that have a session, in id order.
    pub fn session_devices(&self, jid: &BareJid) -> Result<Vec<DeviceId>, OmemoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT device_id FROM crypto_sessions WHERE address = ?1 ORDER BY device_id")?;
        let ids = stmt
            .query_map([jid.as_str()], |row| row.get::<_, u32>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|id| DeviceId::new(id).map_err(|e| OmemoError::StoreLoad(e.to_string())))
            .collect()
    }

    pub fn delete_session(&self, jid: &BareJid, device_id: DeviceId) -> Result<bool, OmemoError> {
        let removed = self.conn.execute(
            "DELETE FROM crypto_sessions WHERE address = ?1 AND device_id = ?2",
            rusqlite::params![jid.as_str(), device_id.get()],
        )?;
        Ok(removed > 0)
    }

    /// Delete every session with `jid`. Returns how many were removed.
    pub fn delete_all_sessions(&self, jid: &BareJid) -> Result<usize, OmemoError> {
        Ok(self.conn.execute(
            "DELETE FROM crypto_sessions WHERE address = ?1",
            [jid.as_str()],
        )?)
    }
}

#[async_trait(?Send)]
impl SessionStore for CryptoStore<'_> {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        let (jid, device_id) = split_address(address)?;

        match self.conn.query_row(
            "SELECT session_data FROM crypto_sessions WHERE address = ?1 AND device_id = ?2",
            rusqlite::params![jid, device_id],
            |row| row.get::<_, Vec<u8>>(0),
        ) {
            Ok(bytes) => Ok(Some(SessionRecord::deserialize(&bytes)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SignalProtocolError::InvalidState(
                "load_session",
                e.to_string(),
            )),
        }
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        let (jid, device_id) = split_address(address)?;
        let session_bytes = record.serialize()?;

        self.conn
            .execute(
                "INSERT INTO crypto_sessions (address, device_id, session_data, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(address, device_id) DO UPDATE SET
                     session_data = excluded.session_data,
                     last_used_at = excluded.last_used_at",
                rusqlite::params![jid, device_id, session_bytes, now_secs()],
            )
            .map_err(|e| SignalProtocolError::InvalidState("store_session", e.to_string()))?;

        Ok(())
    }
}
