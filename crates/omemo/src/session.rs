//! Session establishment and trust decisions.
//!
//! A remote device moves through `Unknown -> AwaitingDeviceList ->
//! AwaitingBundle -> Established`. The session itself lives in the store;
//! the manager only tracks which requests are outstanding.
//!
//! No `RefCell` borrow is held across a collaborator call, so a transport
//! that answers synchronously can re-enter the manager.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::time::SystemTime;

use libsignal_protocol::{
    CiphertextMessageType, IdentityKey, PreKeySignalMessage, SignalMessage, SignalProtocolError,
};
use rusqlite::Connection;
use tern_shared::{BareJid, DeviceId};
use zeroize::Zeroizing;

use crate::collaborators::{Transport, Ui};
use crate::config::TrustMode;
use crate::crypto::CryptoProvider;
use crate::error::OmemoError;
use crate::fingerprint;
use crate::message::SessionCipher;
use crate::prekeys::OmemoBundle;
use crate::storage::{protocol_address, with_transaction, CryptoStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    AwaitingDeviceList,
    AwaitingBundle,
    Established,
}

fn map_signal_error(err: SignalProtocolError, jid: &BareJid, device_id: DeviceId) -> OmemoError {
    match err {
        SignalProtocolError::UntrustedIdentity(_) => OmemoError::Untrusted {
            jid: jid.clone(),
            device_id,
        },
        SignalProtocolError::SessionNotFound(_) => OmemoError::NoSession {
            jid: jid.clone(),
            device_id,
        },
        other => OmemoError::SignalProtocol(other.to_string()),
    }
}

pub struct SessionManager {
    trust_mode: TrustMode,
    awaiting_lists: RefCell<HashSet<BareJid>>,
    awaiting_bundles: RefCell<HashSet<(BareJid, DeviceId)>>,
}

impl SessionManager {
    pub fn new(trust_mode: TrustMode) -> Self {
        Self {
            trust_mode,
            awaiting_lists: RefCell::new(HashSet::new()),
            awaiting_bundles: RefCell::new(HashSet::new()),
        }
    }

    pub fn state(
        &self,
        conn: &Connection,
        jid: &BareJid,
        device_id: DeviceId,
    ) -> Result<SessionState, OmemoError> {
        if CryptoStore::new(conn).contains_session(jid, device_id)? {
            return Ok(SessionState::Established);
        }
        if self
            .awaiting_bundles
            .borrow()
            .contains(&(jid.clone(), device_id))
        {
            return Ok(SessionState::AwaitingBundle);
        }
        if self.awaiting_lists.borrow().contains(jid) {
            return Ok(SessionState::AwaitingDeviceList);
        }
        Ok(SessionState::Unknown)
    }

    pub fn request_device_list(
        &self,
        transport: &dyn Transport,
        jid: &BareJid,
    ) -> Result<(), OmemoError> {
        self.awaiting_lists.borrow_mut().insert(jid.clone());
        if let Err(e) = transport.request_device_list(jid) {
            self.awaiting_lists.borrow_mut().remove(jid);
            return Err(e);
        }
        tracing::debug!(jid = %jid, "requested device list");
        Ok(())
    }

    /// Handle a device list of `jid`. Returns the devices that still need a
    /// bundle (never `skip`, normally our own device) and marks them awaiting.
    pub fn device_list_received(
        &self,
        conn: &Connection,
        jid: &BareJid,
        ids: &BTreeSet<DeviceId>,
        skip: Option<DeviceId>,
    ) -> Result<Vec<DeviceId>, OmemoError> {
        self.awaiting_lists.borrow_mut().remove(jid);
        if self.trust_mode == TrustMode::FirstUsage {
            self.promote_known_devices(conn, jid, ids)?;
        }

        let store = CryptoStore::new(conn);
        let mut missing = Vec::new();
        for &device_id in ids {
            if Some(device_id) == skip || store.contains_session(jid, device_id)? {
                continue;
            }
            missing.push(device_id);
        }

        let mut awaiting = self.awaiting_bundles.borrow_mut();
        for &device_id in &missing {
            awaiting.insert((jid.clone(), device_id));
        }
        Ok(missing)
    }

    /// First-use trust: a contact without any trusted device gets every
    /// listed device whose identity was already seen promoted to trusted.
    fn promote_known_devices(
        &self,
        conn: &Connection,
        jid: &BareJid,
        ids: &BTreeSet<DeviceId>,
    ) -> Result<usize, OmemoError> {
        with_transaction(conn, |store| {
            if !store.trusted_devices(jid)?.is_empty() {
                return Ok(0);
            }
            let mut promoted = 0;
            for &device_id in ids {
                let Some(fp) = store.known_fingerprint(jid, device_id)? else {
                    continue;
                };
                store.set_trusted(jid, device_id, &fingerprint::identity_key_bytes(&fp)?)?;
                tracing::info!(jid = %jid, device_id = %device_id, "trusted on first use");
                promoted += 1;
            }
            Ok(promoted)
        })
    }

    pub fn request_bundle(
        &self,
        transport: &dyn Transport,
        jid: &BareJid,
        device_id: DeviceId,
    ) -> Result<(), OmemoError> {
        let key = (jid.clone(), device_id);
        self.awaiting_bundles.borrow_mut().insert(key.clone());
        if let Err(e) = transport.request_bundle(jid, device_id) {
            self.awaiting_bundles.borrow_mut().remove(&key);
            return Err(e);
        }
        tracing::debug!(jid = %jid, device_id = %device_id, "requested bundle");
        Ok(())
    }

    /// Validate a received bundle, decide trust and build the session.
    ///
    /// A bundle whose signatures do not verify fails with `InvalidBundle`;
    /// a rejected identity fails with `Untrusted`. Neither creates a session.
    pub fn process_bundle(
        &self,
        conn: &Connection,
        crypto: &dyn CryptoProvider,
        ui: &dyn Ui,
        jid: &BareJid,
        device_id: DeviceId,
        bundle: &OmemoBundle,
    ) -> Result<SessionState, OmemoError> {
        self.awaiting_bundles
            .borrow_mut()
            .remove(&(jid.clone(), device_id));

        let identity = bundle.verify().inspect_err(|e| {
            tracing::warn!(jid = %jid, device_id = %device_id, error = %e, "discarding bundle");
        })?;
        let store = CryptoStore::with_trust_mode(conn, self.trust_mode);
        store.record_known_device(jid, device_id, &fingerprint::fingerprint(&identity, false))?;

        if !self.accept_identity(&store, ui, jid, device_id, &identity)? {
            tracing::info!(jid = %jid, device_id = %device_id, mode = %self.trust_mode, "identity not trusted");
            return Err(OmemoError::Untrusted {
                jid: jid.clone(),
                device_id,
            });
        }

        let pre_key = bundle.select_pre_key(crypto)?;
        let pre_key_bundle = bundle.to_pre_key_bundle(pre_key)?;
        let address = protocol_address(jid, device_id);

        let tx = conn.unchecked_transaction()?;
        let mut session_store = CryptoStore::with_trust_mode(conn, self.trust_mode);
        let mut identity_store = CryptoStore::with_trust_mode(conn, self.trust_mode);
        futures::executor::block_on(libsignal_protocol::process_prekey_bundle(
            &address,
            &mut session_store,
            &mut identity_store,
            &pre_key_bundle,
            SystemTime::now(),
            &mut crypto.rng()?,
        ))
        .map_err(|e| map_signal_error(e, jid, device_id))?;
        tx.commit()?;

        tracing::info!(
            jid = %jid,
            device_id = %device_id,
            pre_key_id = pre_key.map(|k| k.id),
            "session established"
        );
        Ok(SessionState::Established)
    }

    fn accept_identity(
        &self,
        store: &CryptoStore<'_>,
        ui: &dyn Ui,
        jid: &BareJid,
        device_id: DeviceId,
        identity: &IdentityKey,
    ) -> Result<bool, OmemoError> {
        let presented = identity.serialize();
        match store.trusted_identity(jid, device_id)? {
            Some(stored) if stored.as_slice() == presented.as_ref() => Ok(true),
            Some(_) if self.trust_mode == TrustMode::Blind => Ok(true),
            Some(_) => {
                ui.show_warning(&format!(
                    "Identity of {jid} device {device_id} changed. New fingerprint: {}",
                    fingerprint::fingerprint(identity, true)
                ));
                Ok(false)
            }
            None => match self.trust_mode {
                TrustMode::Blind => Ok(true),
                TrustMode::FirstUsage => Ok(false),
                TrustMode::Manual => {
                    let formatted = fingerprint::fingerprint(identity, true);
                    if !ui.prompt_trust_decision(jid, device_id, &formatted) {
                        return Ok(false);
                    }
                    store.set_trusted(jid, device_id, &presented)?;
                    Ok(true)
                }
            },
        }
    }

    /// Trust the device of `jid` that presented `fingerprint`.
    ///
    /// A session built on a different key for that device is dropped.
    pub fn trust(
        &self,
        conn: &Connection,
        jid: &BareJid,
        fingerprint: &str,
    ) -> Result<DeviceId, OmemoError> {
        let fp = fingerprint::normalize(fingerprint)?;
        let key = fingerprint::identity_key_bytes(&fp)?;
        let device_id = with_transaction(conn, |store| {
            let device_id = store
                .device_for_fingerprint(jid, &fp)?
                .ok_or_else(|| OmemoError::UnknownFingerprint {
                    jid: jid.clone(),
                    fingerprint: fp.clone(),
                })?;
            if store
                .trusted_identity(jid, device_id)?
                .is_some_and(|stored| stored != key)
            {
                store.delete_session(jid, device_id)?;
            }
            store.set_trusted(jid, device_id, &key)?;
            Ok(device_id)
        })?;
        tracing::info!(jid = %jid, device_id = %device_id, "identity trusted");
        Ok(device_id)
    }

    /// Drop trust in `fingerprint` and end the session built on it. The
    /// known-device cache is kept.
    ///
    /// The trust record is matched by key, so a device that has since
    /// presented another identity can still be untrusted by its old
    /// fingerprint. Untrusting a key that was never trusted leaves a trusted
    /// key of the same device alone.
    pub fn untrust(
        &self,
        conn: &Connection,
        jid: &BareJid,
        fingerprint: &str,
    ) -> Result<DeviceId, OmemoError> {
        let fp = fingerprint::normalize(fingerprint)?;
        let key = fingerprint::identity_key_bytes(&fp)?;
        let (device_id, ended) = with_transaction(conn, |store| {
            if let Some(device_id) = store.device_trusting(jid, &key)? {
                store.remove_trusted(jid, device_id)?;
                store.delete_session(jid, device_id)?;
                return Ok((device_id, true));
            }
            let device_id = store
                .device_for_fingerprint(jid, &fp)?
                .ok_or_else(|| OmemoError::UnknownFingerprint {
                    jid: jid.clone(),
                    fingerprint: fp.clone(),
                })?;
            if store.trusted_identity(jid, device_id)?.is_some() {
                return Ok((device_id, false));
            }
            store.delete_session(jid, device_id)?;
            Ok((device_id, true))
        })?;
        if ended {
            self.awaiting_bundles
                .borrow_mut()
                .remove(&(jid.clone(), device_id));
        }
        tracing::info!(jid = %jid, device_id = %device_id, ended, "identity untrusted");
        Ok(device_id)
    }

    pub fn is_trusted(
        &self,
        conn: &Connection,
        jid: &BareJid,
        device_id: DeviceId,
    ) -> Result<bool, OmemoError> {
        Ok(CryptoStore::new(conn)
            .trusted_identity(jid, device_id)?
            .is_some())
    }

    pub fn delete_session(
        &self,
        conn: &Connection,
        jid: &BareJid,
        device_id: DeviceId,
    ) -> Result<bool, OmemoError> {
        self.awaiting_bundles
            .borrow_mut()
            .remove(&(jid.clone(), device_id));
        CryptoStore::new(conn).delete_session(jid, device_id)
    }

    /// Delete every session with `jid`.
    pub fn end_session(&self, conn: &Connection, jid: &BareJid) -> Result<usize, OmemoError> {
        self.awaiting_bundles
            .borrow_mut()
            .retain(|(pending, _)| pending != jid);
        self.awaiting_lists.borrow_mut().remove(jid);
        let removed = CryptoStore::new(conn).delete_all_sessions(jid)?;
        tracing::info!(jid = %jid, removed, "ended sessions");
        Ok(removed)
    }

    /// Forget outstanding requests. Stored sessions are untouched.
    pub fn clear(&self) {
        self.awaiting_lists.borrow_mut().clear();
        self.awaiting_bundles.borrow_mut().clear();
    }
}

/// [`SessionCipher`] backed by libsignal sessions in the account store.
pub struct SignalSessionCipher<'a> {
    conn: &'a Connection,
    crypto: &'a dyn CryptoProvider,
    trust_mode: TrustMode,
}

impl<'a> SignalSessionCipher<'a> {
    pub fn new(conn: &'a Connection, crypto: &'a dyn CryptoProvider, trust_mode: TrustMode) -> Self {
        Self {
            conn,
            crypto,
            trust_mode,
        }
    }

    fn store(&self) -> CryptoStore<'a> {
        CryptoStore::with_trust_mode(self.conn, self.trust_mode)
    }
}

impl SessionCipher for SignalSessionCipher<'_> {
    fn encrypt_key(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        keytag: &[u8],
    ) -> Result<(Vec<u8>, bool), OmemoError> {
        if !self.store().contains_session(jid, device_id)? {
            return Err(OmemoError::NoSession {
                jid: jid.clone(),
                device_id,
            });
        }
        let address = protocol_address(jid, device_id);

        let tx = self.conn.unchecked_transaction()?;
        let mut session_store = self.store();
        let mut identity_store = self.store();
        let message = futures::executor::block_on(libsignal_protocol::message_encrypt(
            keytag,
            &address,
            &mut session_store,
            &mut identity_store,
            SystemTime::now(),
            &mut self.crypto.rng()?,
        ))
        .map_err(|e| map_signal_error(e, jid, device_id))?;

        let prekey = match message.message_type() {
            CiphertextMessageType::PreKey => true,
            CiphertextMessageType::Whisper => false,
            other => {
                return Err(OmemoError::SignalProtocol(format!(
                    "unexpected ciphertext message type: {other:?}"
                )))
            }
        };
        let blob = message.serialize().to_vec();
        tx.commit()?;
        Ok((blob, prekey))
    }

    fn decrypt_key(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        blob: &[u8],
        prekey: bool,
    ) -> Result<Zeroizing<Vec<u8>>, OmemoError> {
        let address = protocol_address(jid, device_id);

        if prekey {
            let message = PreKeySignalMessage::try_from(blob)
                .map_err(|e| OmemoError::SignalProtocol(e.to_string()))?;
            // Remember the sender's identity even if it ends up rejected.
            self.store().record_known_device(
                jid,
                device_id,
                &fingerprint::fingerprint(message.identity_key(), false),
            )?;

            let tx = self.conn.unchecked_transaction()?;
            let mut session_store = self.store();
            let mut identity_store = self.store();
            let mut pre_key_store = self.store();
            let signed_pre_key_store = self.store();
            let mut kyber_pre_key_store = self.store();
            let plaintext = futures::executor::block_on(libsignal_protocol::message_decrypt_prekey(
                &message,
                &address,
                &mut session_store,
                &mut identity_store,
                &mut pre_key_store,
                &signed_pre_key_store,
                &mut kyber_pre_key_store,
                &mut self.crypto.rng()?,
            ))
            .map_err(|e| map_signal_error(e, jid, device_id))?;
            tx.commit()?;
            tracing::debug!(jid = %jid, device_id = %device_id, "session established by pre-key message");
            Ok(Zeroizing::new(plaintext))
        } else {
            let message = SignalMessage::try_from(blob)
                .map_err(|e| OmemoError::SignalProtocol(e.to_string()))?;

            let tx = self.conn.unchecked_transaction()?;
            let mut session_store = self.store();
            let mut identity_store = self.store();
            let plaintext = futures::executor::block_on(libsignal_protocol::message_decrypt_signal(
                &message,
                &address,
                &mut session_store,
                &mut identity_store,
                &mut self.crypto.rng()?,
            ))
            .map_err(|e| map_signal_error(e, jid, device_id))?;
            tx.commit()?;
            Ok(Zeroizing::new(plaintext))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SeededCryptoProvider;
    use crate::identity::{generate_identity, LocalIdentity};
    use crate::prekeys::build_bundle;
    use crate::storage::init_test_db;
    use parking_lot::Mutex;

    struct ScriptedUi {
        accept: bool,
        prompts: Mutex<Vec<(BareJid, DeviceId, String)>>,
        warnings: Mutex<Vec<String>>,
    }

    impl ScriptedUi {
        fn new(accept: bool) -> Self {
            Self {
                accept,
                prompts: Mutex::new(Vec::new()),
                warnings: Mutex::new(Vec::new()),
            }
        }
    }

    impl Ui for ScriptedUi {
        fn prompt_trust_decision(&self, jid: &BareJid, device_id: DeviceId, fingerprint: &str) -> bool {
            self.prompts
                .lock()
                .push((jid.clone(), device_id, fingerprint.to_string()));
            self.accept
        }

        fn show_warning(&self, text: &str) {
            self.warnings.lock().push(text.to_string());
        }
    }

    struct Peer {
        conn: Connection,
        identity: LocalIdentity,
    }

    fn peer(seed: u64, pre_keys: u32) -> Peer {
        let conn = init_test_db();
        let identity = generate_identity(&conn, &SeededCryptoProvider::new(seed), pre_keys).unwrap();
        Peer { conn, identity }
    }

    fn alice() -> BareJid {
        BareJid::parse("alice@example.org").unwrap()
    }

    fn bob() -> BareJid {
        BareJid::parse("bob@example.org").unwrap()
    }

    fn dev(id: u32) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn bob_fingerprint(b: &Peer) -> String {
        fingerprint::fingerprint(b.identity.key_pair.identity_key(), true)
    }

    #[test]
    fn blind_mode_trusts_and_establishes() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(false);
        let crypto = SeededCryptoProvider::new(3);

        let state = manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();
        assert_eq!(state, SessionState::Established);
        assert!(manager.is_trusted(&a.conn, &bob(), dev(222)).unwrap());
        assert!(ui.prompts.lock().is_empty());

        let store = CryptoStore::new(&a.conn);
        assert_eq!(
            store.known_fingerprint(&bob(), dev(222)).unwrap().unwrap(),
            fingerprint::normalize(&bob_fingerprint(&b)).unwrap()
        );
    }

    #[test]
    fn manual_mode_prompts_and_respects_refusal() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::Manual);
        let ui = ScriptedUi::new(false);
        let crypto = SeededCryptoProvider::new(3);

        let err = manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap_err();
        assert!(matches!(err, OmemoError::Untrusted { .. }));
        assert_eq!(manager.state(&a.conn, &bob(), dev(222)).unwrap(), SessionState::Unknown);

        let prompts = ui.prompts.lock();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].2, bob_fingerprint(&b));
    }

    #[test]
    fn manual_mode_accepting_prompt_records_trust() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::Manual);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);

        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();
        assert!(manager.is_trusted(&a.conn, &bob(), dev(222)).unwrap());
        assert_eq!(
            manager.state(&a.conn, &bob(), dev(222)).unwrap(),
            SessionState::Established
        );
    }

    #[test]
    fn changed_identity_is_rejected_outside_blind_mode() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let impostor = peer(4, 5);
        let manager = SessionManager::new(TrustMode::Manual);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);

        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();
        let err = manager
            .process_bundle(
                &a.conn,
                &crypto,
                &ui,
                &bob(),
                dev(222),
                &build_bundle(&impostor.conn).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, OmemoError::Untrusted { .. }));
        assert_eq!(ui.warnings.lock().len(), 1);
        assert_eq!(ui.prompts.lock().len(), 1);
    }

    #[test]
    fn invalid_bundle_is_skipped_without_session() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);

        let mut bundle = build_bundle(&b.conn).unwrap();
        bundle.signed_pre_key_signature[0] ^= 0xFF;
        let err = manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &bundle)
            .unwrap_err();
        assert!(matches!(err, OmemoError::InvalidBundle(_)));
        assert!(!err.is_user_visible());
        assert!(!CryptoStore::new(&a.conn).contains_session(&bob(), dev(222)).unwrap());
        assert!(CryptoStore::new(&a.conn).known_fingerprint(&bob(), dev(222)).unwrap().is_none());
    }

    #[test]
    fn first_use_promotes_known_devices_only() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::FirstUsage);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);
        let bundle = build_bundle(&b.conn).unwrap();

        // Seen but not trusted: no session, no prompt.
        let err = manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &bundle)
            .unwrap_err();
        assert!(matches!(err, OmemoError::Untrusted { .. }));
        assert!(ui.prompts.lock().is_empty());

        // 333 was never seen and stays untrusted.
        let ids: BTreeSet<DeviceId> = [dev(222), dev(333)].into_iter().collect();
        let missing = manager
            .device_list_received(&a.conn, &bob(), &ids, None)
            .unwrap();
        assert_eq!(missing, vec![dev(222), dev(333)]);
        assert!(manager.is_trusted(&a.conn, &bob(), dev(222)).unwrap());
        assert!(!manager.is_trusted(&a.conn, &bob(), dev(333)).unwrap());

        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &bundle)
            .unwrap();
        assert_eq!(
            manager.state(&a.conn, &bob(), dev(222)).unwrap(),
            SessionState::Established
        );
    }

    #[test]
    fn first_use_does_nothing_once_a_device_is_trusted() {
        let a = peer(1, 5);
        let manager = SessionManager::new(TrustMode::FirstUsage);
        let store = CryptoStore::new(&a.conn);
        let other = IdentityKeyFixture::new();
        store.set_trusted(&bob(), dev(111), &other.bytes).unwrap();
        store.record_known_device(&bob(), dev(222), &other.fingerprint).unwrap();

        let ids: BTreeSet<DeviceId> = [dev(111), dev(222)].into_iter().collect();
        manager
            .device_list_received(&a.conn, &bob(), &ids, None)
            .unwrap();
        assert!(!manager.is_trusted(&a.conn, &bob(), dev(222)).unwrap());
    }

    struct IdentityKeyFixture {
        bytes: Vec<u8>,
        fingerprint: String,
    }

    impl IdentityKeyFixture {
        fn new() -> Self {
            let pair = libsignal_protocol::IdentityKeyPair::generate(&mut rand::rng());
            Self {
                bytes: pair.identity_key().serialize().to_vec(),
                fingerprint: fingerprint::fingerprint(pair.identity_key(), false),
            }
        }
    }

    #[test]
    fn device_list_skips_own_and_established_devices() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);
        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();

        let ids: BTreeSet<DeviceId> = [dev(7), dev(222), dev(333)].into_iter().collect();
        let missing = manager
            .device_list_received(&a.conn, &bob(), &ids, Some(dev(7)))
            .unwrap();
        assert_eq!(missing, vec![dev(333)]);
        assert_eq!(
            manager.state(&a.conn, &bob(), dev(333)).unwrap(),
            SessionState::AwaitingBundle
        );
    }

    #[test]
    fn key_round_trip_consumes_the_pre_key() {
        let a = peer(1, 5);
        let b = peer(2, 1);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);
        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();
        assert!(CryptoStore::new(&b.conn).contains_pre_key(0).unwrap());

        let keytag = [0x42u8; 32];
        let sender = SignalSessionCipher::new(&a.conn, &crypto, TrustMode::Blind);
        let (blob, prekey) = sender.encrypt_key(&bob(), dev(222), &keytag).unwrap();
        assert!(prekey);

        let receiver = SignalSessionCipher::new(&b.conn, &crypto, TrustMode::Blind);
        let opened = receiver.decrypt_key(&alice(), dev(111), &blob, true).unwrap();
        assert_eq!(opened.as_slice(), &keytag);
        assert!(!CryptoStore::new(&b.conn).contains_pre_key(0).unwrap());
        assert!(CryptoStore::new(&b.conn).contains_session(&alice(), dev(111)).unwrap());
        assert!(CryptoStore::new(&b.conn)
            .known_fingerprint(&alice(), dev(111))
            .unwrap()
            .is_some());
    }

    #[test]
    fn consumed_pre_key_cannot_be_used_again() {
        let a = peer(1, 5);
        let b = peer(2, 1);
        let c = peer(5, 5);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);
        let stale = build_bundle(&b.conn).unwrap();

        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &stale)
            .unwrap();
        let (blob, _) = SignalSessionCipher::new(&a.conn, &crypto, TrustMode::Blind)
            .encrypt_key(&bob(), dev(222), &[1u8; 32])
            .unwrap();
        let receiver = SignalSessionCipher::new(&b.conn, &crypto, TrustMode::Blind);
        receiver.decrypt_key(&alice(), dev(111), &blob, true).unwrap();

        let carol = BareJid::parse("carol@example.org").unwrap();
        manager
            .process_bundle(&c.conn, &crypto, &ui, &bob(), dev(222), &stale)
            .unwrap();
        let (blob, _) = SignalSessionCipher::new(&c.conn, &crypto, TrustMode::Blind)
            .encrypt_key(&bob(), dev(222), &[2u8; 32])
            .unwrap();
        assert!(receiver.decrypt_key(&carol, dev(333), &blob, true).is_err());
        assert!(!CryptoStore::new(&b.conn).contains_session(&carol, dev(333)).unwrap());
    }

    #[test]
    fn untrusted_pre_key_message_is_rejected_in_manual_mode() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);
        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();
        let (blob, _) = SignalSessionCipher::new(&a.conn, &crypto, TrustMode::Blind)
            .encrypt_key(&bob(), dev(222), &[3u8; 32])
            .unwrap();

        let receiver = SignalSessionCipher::new(&b.conn, &crypto, TrustMode::Manual);
        let err = receiver
            .decrypt_key(&alice(), dev(111), &blob, true)
            .unwrap_err();
        assert!(matches!(err, OmemoError::Untrusted { .. }));
        let store = CryptoStore::new(&b.conn);
        assert!(!store.contains_session(&alice(), dev(111)).unwrap());
        assert!(store.known_fingerprint(&alice(), dev(111)).unwrap().is_some());
    }

    #[test]
    fn encrypt_without_session_is_no_session() {
        let a = peer(1, 5);
        let crypto = SeededCryptoProvider::new(3);
        let err = SignalSessionCipher::new(&a.conn, &crypto, TrustMode::Blind)
            .encrypt_key(&bob(), dev(222), &[0u8; 32])
            .unwrap_err();
        assert!(matches!(err, OmemoError::NoSession { .. }));
    }

    #[test]
    fn trust_and_untrust_by_fingerprint() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);
        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();

        let fp = bob_fingerprint(&b);
        assert_eq!(manager.untrust(&a.conn, &bob(), &fp).unwrap(), dev(222));
        assert!(!manager.is_trusted(&a.conn, &bob(), dev(222)).unwrap());
        let store = CryptoStore::new(&a.conn);
        assert!(!store.contains_session(&bob(), dev(222)).unwrap());
        assert!(store.known_fingerprint(&bob(), dev(222)).unwrap().is_some());

        assert_eq!(manager.trust(&a.conn, &bob(), &fp).unwrap(), dev(222));
        assert_eq!(
            store.trusted_identity(&bob(), dev(222)).unwrap().unwrap(),
            b.identity.key_pair.identity_key().serialize().to_vec()
        );
    }

    /// Bob's device 222 established and trusted, then an impostor bundle
    /// for the same device refused.
    fn trusted_then_impostor() -> (Peer, Peer, Peer, SessionManager) {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let impostor = peer(4, 5);
        let manager = SessionManager::new(TrustMode::Manual);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);

        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();
        let err = manager
            .process_bundle(
                &a.conn,
                &crypto,
                &ui,
                &bob(),
                dev(222),
                &build_bundle(&impostor.conn).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, OmemoError::Untrusted { .. }));
        (a, b, impostor, manager)
    }

    #[test]
    fn untrust_by_old_fingerprint_after_impostor_sighting() {
        let (a, b, impostor, manager) = trusted_then_impostor();
        let store = CryptoStore::new(&a.conn);
        let genuine = fingerprint::normalize(&bob_fingerprint(&b)).unwrap();
        let fake = fingerprint::fingerprint(impostor.identity.key_pair.identity_key(), false);
        assert_eq!(
            store.known_devices(&bob()).unwrap(),
            vec![(dev(222), genuine), (dev(222), fake.clone())]
        );

        // The impostor's key was never trusted, so the genuine record stays.
        assert_eq!(manager.untrust(&a.conn, &bob(), &fake).unwrap(), dev(222));
        assert!(manager.is_trusted(&a.conn, &bob(), dev(222)).unwrap());
        assert!(store.contains_session(&bob(), dev(222)).unwrap());

        assert_eq!(
            manager.untrust(&a.conn, &bob(), &bob_fingerprint(&b)).unwrap(),
            dev(222)
        );
        assert!(store.trusted_identity(&bob(), dev(222)).unwrap().is_none());
        assert!(!store.contains_session(&bob(), dev(222)).unwrap());
        assert_eq!(manager.state(&a.conn, &bob(), dev(222)).unwrap(), SessionState::Unknown);
    }

    #[test]
    fn trusting_a_new_key_drops_the_session_built_on_the_old_one() {
        let (a, _b, impostor, manager) = trusted_then_impostor();
        let store = CryptoStore::new(&a.conn);
        let new_fp = fingerprint::fingerprint(impostor.identity.key_pair.identity_key(), true);

        assert_eq!(manager.trust(&a.conn, &bob(), &new_fp).unwrap(), dev(222));
        assert_eq!(
            store.trusted_identity(&bob(), dev(222)).unwrap().unwrap(),
            impostor.identity.key_pair.identity_key().serialize().to_vec()
        );
        assert!(!store.contains_session(&bob(), dev(222)).unwrap());

        let ui = ScriptedUi::new(false);
        let state = manager
            .process_bundle(
                &a.conn,
                &SeededCryptoProvider::new(3),
                &ui,
                &bob(),
                dev(222),
                &build_bundle(&impostor.conn).unwrap(),
            )
            .unwrap();
        assert_eq!(state, SessionState::Established);
        assert!(ui.prompts.lock().is_empty());
    }

    #[test]
    fn untrust_in_blind_mode_ends_a_session_without_record() {
        let a = peer(1, 5);
        let b = peer(2, 5);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);
        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b.conn).unwrap())
            .unwrap();
        let store = CryptoStore::new(&a.conn);
        store.remove_trusted(&bob(), dev(222)).unwrap();

        assert_eq!(
            manager.untrust(&a.conn, &bob(), &bob_fingerprint(&b)).unwrap(),
            dev(222)
        );
        assert!(!store.contains_session(&bob(), dev(222)).unwrap());
    }

    #[test]
    fn trust_unknown_fingerprint_fails() {
        let a = peer(1, 5);
        let manager = SessionManager::new(TrustMode::Manual);
        let err = manager
            .trust(&a.conn, &bob(), &"ab".repeat(32))
            .unwrap_err();
        assert!(matches!(err, OmemoError::UnknownFingerprint { .. }));
    }

    #[test]
    fn end_session_removes_all_sessions_of_contact() {
        let a = peer(1, 5);
        let b1 = peer(2, 5);
        let b2 = peer(6, 5);
        let manager = SessionManager::new(TrustMode::Blind);
        let ui = ScriptedUi::new(true);
        let crypto = SeededCryptoProvider::new(3);
        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(111), &build_bundle(&b1.conn).unwrap())
            .unwrap();
        manager
            .process_bundle(&a.conn, &crypto, &ui, &bob(), dev(222), &build_bundle(&b2.conn).unwrap())
            .unwrap();

        assert!(manager.delete_session(&a.conn, &bob(), dev(111)).unwrap());
        assert!(!manager.delete_session(&a.conn, &bob(), dev(111)).unwrap());
        assert_eq!(manager.end_session(&a.conn, &bob()).unwrap(), 1);
        assert_eq!(manager.state(&a.conn, &bob(), dev(222)).unwrap(), SessionState::Unknown);
    }
}
