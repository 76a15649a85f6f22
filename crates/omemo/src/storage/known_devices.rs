//! Cache of identity fingerprints seen per device, independent of trust.
//!
//! Every distinct fingerprint a device has presented is kept, so a key that
//! was trusted stays addressable after an impostor shows up under its id.

use rusqlite::OptionalExtension;
use tern_shared::{BareJid, DeviceId};

use crate::error::OmemoError;
use crate::storage::{now_secs, CryptoStore};

impl CryptoStore<'_> {
    /// Remember the unformatted fingerprint observed for a device.
    ///
    /// A repeat sighting of the same fingerprint moves it to the back of the
    /// sighting order.
    pub fn record_known_device(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        fingerprint: &str,
    ) -> Result<(), OmemoError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO crypto_known_devices (address, device_id, fingerprint, seen_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![jid.as_str(), device_id.get(), fingerprint, now_secs()],
        )?;
        Ok(())
    }

    /// Fingerprint the device presented most recently.
    pub fn known_fingerprint(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
    ) -> Result<Option<String>, OmemoError> {
        Ok(self
            .conn
            .query_row(
                "SELECT fingerprint FROM crypto_known_devices
                 WHERE address = ?1 AND device_id = ?2
                 ORDER BY seen_at DESC, rowid DESC LIMIT 1",
                rusqlite::params![jid.as_str(), device_id.get()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Device that last presented `fingerprint` (unformatted), if any.
    pub fn device_for_fingerprint(
        &self,
        jid: &BareJid,
        fingerprint: &str,
    ) -> Result<Option<DeviceId>, OmemoError> {
        let id: Option<u32> = self
            .conn
            .query_row(
                "SELECT device_id FROM crypto_known_devices
                 WHERE address = ?1 AND fingerprint = ?2
                 ORDER BY seen_at DESC, rowid DESC LIMIT 1",
                rusqlite::params![jid.as_str(), fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|id| DeviceId::new(id).map_err(|e| OmemoError::StoreLoad(e.to_string())))
            .transpose()
    }

    /// All `(device, fingerprint)` pairs cached for `jid`, in device order and
    /// then sighting order.
    pub fn known_devices(&self, jid: &BareJid) -> Result<Vec<(DeviceId, String)>, OmemoError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, fingerprint FROM crypto_known_devices
             WHERE address = ?1
             ORDER BY device_id, seen_at, rowid",
        )?;
        let rows = stmt
            .query_map([jid.as_str()], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, fp)| {
                DeviceId::new(id)
                    .map(|d| (d, fp))
                    .map_err(|e| OmemoError::StoreLoad(e.to_string()))
            })
            .collect()
    }
}
