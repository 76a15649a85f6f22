//! PreKeyStore trait implementation for CryptoStore.

use async_trait::async_trait;
use libsignal_protocol::{PreKeyId, PreKeyRecord, PreKeyStore, SignalProtocolError};

use crate::error::OmemoError;
use crate::storage::{now_secs, CryptoStore};

impl CryptoStore<'_> {
    pub fn contains_pre_key(&self, id: u32) -> Result<bool, OmemoError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM crypto_pre_keys WHERE key_id = ?1",
            [id],
            |row| row.get(0),
        )?)
    }

    pub fn count_pre_keys(&self) -> Result<u32, OmemoError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM crypto_pre_keys", [], |row| row.get(0))?)
    }

    /// Stored pre-key records in id order.
    pub fn load_pre_keys(&self) -> Result<Vec<PreKeyRecord>, OmemoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record FROM crypto_pre_keys ORDER BY key_id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|bytes| {
                PreKeyRecord::deserialize(bytes).map_err(|e| OmemoError::StoreLoad(e.to_string()))
            })
            .collect()
    }
}

#[async_trait(?Send)]
impl PreKeyStore for CryptoStore<'_> {
    async fn get_pre_key(&self, prekey_id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        let id: u32 = prekey_id.into();
        let record_bytes: Vec<u8> = self
            .conn
            .query_row(
                "SELECT record FROM crypto_pre_keys WHERE key_id = ?1",
                [id],
                |row| row.get(0),
            )
            .map_err(|_| SignalProtocolError::InvalidPreKeyId)?;

        PreKeyRecord::deserialize(&record_bytes)
    }

    async fn save_pre_key(
        &mut self,
        prekey_id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        let id: u32 = prekey_id.into();
        let record_bytes = record.serialize()?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO crypto_pre_keys (key_id, record, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, record_bytes, now_secs()],
            )
            .map_err(|e| SignalProtocolError::InvalidState("save_pre_key", e.to_string()))?;

        Ok(())
    }

    async fn remove_pre_key(&mut self, prekey_id: PreKeyId) -> Result<(), SignalProtocolError> {
        let id: u32 = prekey_id.into();
        self.conn
            .execute("DELETE FROM crypto_pre_keys WHERE key_id = ?1", [id])
            .map_err(|e| SignalProtocolError::InvalidState("remove_pre_key", e.to_string()))?;
        tracing::debug!(pre_key_id = id, "consumed pre-key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;
    use libsignal_protocol::KeyPair;

    fn record(id: u32) -> PreKeyRecord {
        let key_pair = KeyPair::generate(&mut rand::rng());
        PreKeyRecord::new(PreKeyId::from(id), &key_pair)
    }

    #[test]
    fn save_then_get_pre_key_round_trips() {
        let conn = init_test_db();
        let mut store = CryptoStore::new(&conn);
        let record = record(1);

        futures::executor::block_on(store.save_pre_key(PreKeyId::from(1), &record)).unwrap();
        let loaded = futures::executor::block_on(store.get_pre_key(PreKeyId::from(1))).unwrap();

        assert_eq!(loaded.serialize().unwrap(), record.serialize().unwrap());
        assert!(store.contains_pre_key(1).unwrap());
    }

    #[test]
    fn get_pre_key_returns_error_for_nonexistent_id() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        let result = futures::executor::block_on(store.get_pre_key(PreKeyId::from(99999)));
        assert!(matches!(result, Err(SignalProtocolError::InvalidPreKeyId)));
    }

    #[test]
    fn remove_pre_key_deletes_the_key() {
        let conn = init_test_db();
        let mut store = CryptoStore::new(&conn);
        futures::executor::block_on(store.save_pre_key(PreKeyId::from(1), &record(1))).unwrap();
        futures::executor::block_on(store.save_pre_key(PreKeyId::from(2), &record(2))).unwrap();
        assert_eq!(store.count_pre_keys().unwrap(), 2);

        futures::executor::block_on(store.remove_pre_key(PreKeyId::from(1))).unwrap();
        assert!(!store.contains_pre_key(1).unwrap());
        assert_eq!(store.count_pre_keys().unwrap(), 1);
    }

    #[test]
    fn remove_pre_key_for_nonexistent_id_does_not_error() {
        let conn = init_test_db();
        let mut store = CryptoStore::new(&conn);
        let result = futures::executor::block_on(store.remove_pre_key(PreKeyId::from(99999)));
        assert!(result.is_ok());
    }

    #[test]
    fn load_pre_keys_returns_records_in_id_order() {
        let conn = init_test_db();
        let mut store = CryptoStore::new(&conn);
        for id in [3u32, 1, 2] {
            futures::executor::block_on(store.save_pre_key(PreKeyId::from(id), &record(id)))
                .unwrap();
        }
        let ids: Vec<u32> = store
            .load_pre_keys()
            .unwrap()
            .iter()
            .map(|r| r.id().unwrap().into())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
