//! Per-account OMEMO context shared by the network and user-command paths.
//!
//! All state sits behind one reentrant lock taken at each public method.
//! Collaborators are called with the lock held, so a transport that answers
//! a request synchronously re-enters the context on the same thread.
//! Interior `RefCell`s are only borrowed for short stretches that never
//! include a collaborator call.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;

use parking_lot::ReentrantMutex;
use rusqlite::Connection;
use tern_shared::{BareJid, DeviceId};
use tokio::sync::oneshot;

use crate::collaborators::Collaborators;
use crate::config::OmemoConfig;
use crate::crypto::CryptoProvider;
use crate::devices::DeviceDirectory;
use crate::error::OmemoError;
use crate::fingerprint;
use crate::identity::{self, LocalIdentity};
use crate::message::{EncryptedEnvelope, MessageCodec};
use crate::prekeys::{self, OmemoBundle};
use crate::session::{SessionManager, SessionState, SignalSessionCipher};
use crate::storage::{self, CryptoStore};
use crate::store_key::{self, StoreKey};

const DATABASE_FILE: &str = "omemo.db";

struct OmemoState {
    account: BareJid,
    config: OmemoConfig,
    conn: Connection,
    identity: LocalIdentity,
    crypto: Box<dyn CryptoProvider>,
    collaborators: Collaborators,
    devices: RefCell<DeviceDirectory>,
    sessions: SessionManager,
    connected: Cell<bool>,
}

pub struct OmemoContext {
    state: ReentrantMutex<OmemoState>,
}

impl OmemoContext {
    /// Open the account store under `config.data_dir`, creating the identity
    /// on first use. With `encrypt_store` the store key comes from the OS
    /// keychain.
    pub fn open(
        account: BareJid,
        config: OmemoConfig,
        crypto: Box<dyn CryptoProvider>,
        collaborators: Collaborators,
    ) -> Result<Self, OmemoError> {
        let key = if config.encrypt_store {
            let master = store_key::master_key_from_keychain(&account, crypto.as_ref())?;
            Some(store_key::derive_store_key(&master, &account)?)
        } else {
            None
        };
        Self::open_with_store_key(account, config, key.as_ref(), crypto, collaborators)
    }

    /// Open the account store, encrypted with `key` if given.
    pub fn open_with_store_key(
        account: BareJid,
        config: OmemoConfig,
        key: Option<&StoreKey>,
        crypto: Box<dyn CryptoProvider>,
        collaborators: Collaborators,
    ) -> Result<Self, OmemoError> {
        let path = config.account_dir(&account).join(DATABASE_FILE);
        let conn = storage::open_database(&path, key).inspect_err(|e| {
            tracing::error!(account = %account, error = %e, "omemo store unavailable");
        })?;
        Self::with_connection(account, config, conn, crypto, collaborators)
    }

    /// Build a context over an already opened and migrated connection.
    pub fn with_connection(
        account: BareJid,
        config: OmemoConfig,
        conn: Connection,
        crypto: Box<dyn CryptoProvider>,
        collaborators: Collaborators,
    ) -> Result<Self, OmemoError> {
        let identity = identity::load_or_generate(&conn, crypto.as_ref(), config.pre_key_count)
            .inspect_err(|e| {
                tracing::error!(account = %account, error = %e, "failed to load omemo identity");
            })?;
        tracing::info!(account = %account, device_id = %identity.device_id, "omemo ready");

        let sessions = SessionManager::new(config.trust_mode);
        Ok(Self {
            state: ReentrantMutex::new(OmemoState {
                account,
                config,
                conn,
                identity,
                crypto,
                collaborators,
                devices: RefCell::new(DeviceDirectory::new()),
                sessions,
                connected: Cell::new(false),
            }),
        })
    }

    /// Context over a fresh in-memory store.
    pub fn in_memory(
        account: BareJid,
        config: OmemoConfig,
        crypto: Box<dyn CryptoProvider>,
        collaborators: Collaborators,
    ) -> Result<Self, OmemoError> {
        let conn = storage::open_in_memory()?;
        Self::with_connection(account, config, conn, crypto, collaborators)
    }

    pub fn account(&self) -> BareJid {
        self.state.lock().account.clone()
    }

    pub fn device_id(&self) -> DeviceId {
        self.state.lock().identity.device_id
    }

    pub fn own_fingerprint(&self, formatted: bool) -> String {
        let state = self.state.lock();
        fingerprint::fingerprint(state.identity.key_pair.identity_key(), formatted)
    }

    /// The bundle this device publishes.
    pub fn own_bundle(&self) -> Result<OmemoBundle, OmemoError> {
        prekeys::build_bundle(&self.state.lock().conn)
    }

    /// Publish our bundle, ask for our own device list and start sessions
    /// with every contact.
    pub fn on_connect(&self) -> Result<(), OmemoError> {
        let state = self.state.lock();
        state.connected.set(true);

        let bundle = prekeys::build_bundle(&state.conn)?;
        state.collaborators.transport.publish_bundle(&bundle)?;
        state
            .sessions
            .request_device_list(state.collaborators.transport.as_ref(), &state.account)?;

        for contact in state.collaborators.roster.list_contacts() {
            if let Err(e) = self.start_session(&contact) {
                tracing::warn!(jid = %contact, error = %e, "could not start session");
            }
        }
        Ok(())
    }

    /// Forget in-memory device lists and outstanding requests. Later
    /// responses are ignored until the next `on_connect`.
    pub fn disconnect(&self) {
        let state = self.state.lock();
        state.connected.set(false);
        state.devices.borrow_mut().clear();
        state.sessions.clear();
        tracing::debug!(account = %state.account, "omemo disconnected");
    }

    /// Request bundles for every known device of `jid` without a session,
    /// fetching the device list first if none is cached.
    pub fn start_session(&self, jid: &BareJid) -> Result<(), OmemoError> {
        let state = self.state.lock();
        let cached = state.devices.borrow().get_devices(jid).cloned();
        let Some(ids) = cached else {
            return state
                .sessions
                .request_device_list(state.collaborators.transport.as_ref(), jid);
        };

        let skip = (*jid == state.account).then_some(state.identity.device_id);
        let missing = state
            .sessions
            .device_list_received(&state.conn, jid, &ids, skip)?;
        self.request_bundles(&state, jid, &missing);
        Ok(())
    }

    /// Request the device list of `jid` and get a receiver for the answer.
    /// A later request for the same JID cancels this receiver.
    pub fn fetch_device_list(
        &self,
        jid: &BareJid,
    ) -> Result<oneshot::Receiver<BTreeSet<DeviceId>>, OmemoError> {
        let state = self.state.lock();
        let rx = state.devices.borrow_mut().register_pending(jid);
        state
            .sessions
            .request_device_list(state.collaborators.transport.as_ref(), jid)?;
        Ok(rx)
    }

    pub fn devices(&self, jid: &BareJid) -> Option<BTreeSet<DeviceId>> {
        self.state.lock().devices.borrow().get_devices(jid).cloned()
    }

    /// A device list of `jid` arrived (push or response).
    pub fn on_device_list_received(
        &self,
        jid: &BareJid,
        mut ids: BTreeSet<DeviceId>,
    ) -> Result<(), OmemoError> {
        let state = self.state.lock();
        if !state.connected.get() {
            tracing::debug!(jid = %jid, "ignoring device list while disconnected");
            return Ok(());
        }

        let own = *jid == state.account;
        if own && ids.insert(state.identity.device_id) {
            tracing::info!(device_id = %state.identity.device_id, "own device missing from device list, republishing");
            state.collaborators.transport.publish_device_list(&ids)?;
        }

        state.devices.borrow_mut().set_devices(jid, ids.clone());
        let skip = own.then_some(state.identity.device_id);
        let missing = state
            .sessions
            .device_list_received(&state.conn, jid, &ids, skip)?;
        self.request_bundles(&state, jid, &missing);
        Ok(())
    }

    /// A bundle requested for `(jid, device_id)` arrived.
    pub fn on_bundle_received(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
        bundle: &OmemoBundle,
    ) -> Result<SessionState, OmemoError> {
        let state = self.state.lock();
        if !state.connected.get() {
            tracing::debug!(jid = %jid, device_id = %device_id, "ignoring bundle while disconnected");
            return Ok(SessionState::Unknown);
        }
        if *jid == state.account && device_id == state.identity.device_id {
            return Ok(SessionState::Unknown);
        }
        state.sessions.process_bundle(
            &state.conn,
            state.crypto.as_ref(),
            state.collaborators.ui.as_ref(),
            jid,
            device_id,
            bundle,
        )
    }

    fn request_bundles(&self, state: &OmemoState, jid: &BareJid, devices: &[DeviceId]) {
        for &device_id in devices {
            if let Err(e) = state.sessions.request_bundle(
                state.collaborators.transport.as_ref(),
                jid,
                device_id,
            ) {
                tracing::warn!(jid = %jid, device_id = %device_id, error = %e, "bundle request failed");
            }
        }
    }

    /// Every `(jid, device)` a message to `jids` should be wrapped for:
    /// all their known devices plus our own other devices. Devices without a
    /// session get a bundle request and are left to the codec to skip.
    fn recipients(
        &self,
        state: &OmemoState,
        jids: &[BareJid],
    ) -> Result<Vec<(BareJid, DeviceId)>, OmemoError> {
        let mut recipients = Vec::new();
        let mut targets: Vec<&BareJid> = jids.iter().collect();
        if !targets.contains(&&state.account) {
            targets.push(&state.account);
        }

        for jid in targets {
            let cached = state.devices.borrow().get_devices(jid).cloned();
            let ids: BTreeSet<DeviceId> = match cached {
                Some(ids) => ids,
                None => {
                    if let Err(e) = state
                        .sessions
                        .request_device_list(state.collaborators.transport.as_ref(), jid)
                    {
                        tracing::warn!(jid = %jid, error = %e, "device list request failed");
                    }
                    CryptoStore::new(&state.conn)
                        .session_devices(jid)?
                        .into_iter()
                        .collect()
                }
            };

            let store = CryptoStore::new(&state.conn);
            for device_id in ids {
                if *jid == state.account && device_id == state.identity.device_id {
                    continue;
                }
                if !store.contains_session(jid, device_id)? {
                    self.request_bundles(state, jid, &[device_id]);
                }
                recipients.push((jid.clone(), device_id));
            }
        }
        Ok(recipients)
    }

    /// Encrypt `plaintext` for `to` (a contact, or a room when `is_group`).
    pub fn encrypt_outgoing(
        &self,
        to: &BareJid,
        plaintext: &[u8],
        is_group: bool,
    ) -> Result<EncryptedEnvelope, OmemoError> {
        let state = self.state.lock();
        let jids = if is_group {
            state.collaborators.roster.group_members(to)
        } else {
            vec![to.clone()]
        };
        let recipients = self.recipients(&state, &jids)?;

        let codec = MessageCodec::new(
            state.crypto.as_ref(),
            &state.account,
            state.identity.device_id,
        );
        let cipher = SignalSessionCipher::new(
            &state.conn,
            state.crypto.as_ref(),
            state.config.trust_mode,
        );
        codec
            .encrypt(&cipher, plaintext, &recipients)
            .inspect_err(|e| {
                if matches!(e, OmemoError::NoRecipientKey) {
                    state.collaborators.ui.show_warning(&format!(
                        "Cannot send to {to}: no trusted device with an established session. \
                         Check the fingerprints and trust at least one device."
                    ));
                }
            })
    }

    /// Encrypt and hand the envelope to the transport. Returns the stanza id.
    pub fn send_message(
        &self,
        to: &BareJid,
        plaintext: &[u8],
        is_group: bool,
    ) -> Result<String, OmemoError> {
        let state = self.state.lock();
        let envelope = self.encrypt_outgoing(to, plaintext, is_group)?;
        state
            .collaborators
            .transport
            .send_encrypted_message(to, &envelope)
    }

    /// Decrypt an envelope from `from`. Returns the plaintext and whether
    /// the sending device is trusted.
    pub fn decrypt_incoming(
        &self,
        from: &BareJid,
        envelope: &EncryptedEnvelope,
    ) -> Result<(Vec<u8>, bool), OmemoError> {
        let state = self.state.lock();
        let sender_device = envelope.sender_device_id;
        let codec = MessageCodec::new(
            state.crypto.as_ref(),
            &state.account,
            state.identity.device_id,
        );
        let cipher = SignalSessionCipher::new(
            &state.conn,
            state.crypto.as_ref(),
            state.config.trust_mode,
        );

        let result = codec.decrypt(&cipher, from, envelope);

        let list_known = state.devices.borrow().get_devices(from).is_some();
        if !list_known && state.connected.get() {
            if let Err(e) = state
                .sessions
                .request_device_list(state.collaborators.transport.as_ref(), from)
            {
                tracing::warn!(jid = %from, error = %e, "device list request failed");
            }
        }

        let plaintext = match result {
            Ok(plaintext) => plaintext,
            Err(e) => {
                if let OmemoError::Untrusted { .. } = e {
                    self.warn_untrusted(&state, from, sender_device)?;
                } else if e.is_user_visible() {
                    tracing::warn!(jid = %from, device_id = %sender_device, error = %e, "failed to decrypt message");
                }
                return Err(e);
            }
        };

        let used_pre_key = envelope
            .key_for(state.identity.device_id)
            .is_some_and(|key| key.prekey);
        if used_pre_key {
            self.replenish_pre_keys(&state)?;
        }

        let trusted = state.sessions.is_trusted(&state.conn, from, sender_device)?;
        Ok((plaintext, trusted))
    }

    fn warn_untrusted(
        &self,
        state: &OmemoState,
        jid: &BareJid,
        device_id: DeviceId,
    ) -> Result<(), OmemoError> {
        let fp = CryptoStore::new(&state.conn)
            .known_fingerprint(jid, device_id)?
            .map(|raw| fingerprint::identity_key_bytes(&raw))
            .transpose()?
            .map(|key| fingerprint::fingerprint_bytes(&key, true))
            .unwrap_or_else(|| "unknown".to_string());
        state.collaborators.ui.show_warning(&format!(
            "Message from untrusted device {device_id} of {jid} (fingerprint {fp}). \
             Trust it to read its messages."
        ));
        Ok(())
    }

    fn replenish_pre_keys(&self, state: &OmemoState) -> Result<(), OmemoError> {
        let generated = prekeys::replenish(
            &state.conn,
            state.crypto.as_ref(),
            state.config.pre_key_count,
            state.config.pre_key_low_watermark,
        )?;
        if generated > 0 {
            let bundle = prekeys::build_bundle(&state.conn)?;
            state.collaborators.transport.publish_bundle(&bundle)?;
        }
        Ok(())
    }

    /// Trust the device of `jid` that presented `fingerprint` and fetch its
    /// bundle if no session exists yet.
    pub fn trust(&self, jid: &BareJid, fingerprint: &str) -> Result<DeviceId, OmemoError> {
        let state = self.state.lock();
        let device_id = state.sessions.trust(&state.conn, jid, fingerprint)?;
        let has_session = CryptoStore::new(&state.conn).contains_session(jid, device_id)?;
        if !has_session && state.connected.get() {
            self.request_bundles(&state, jid, &[device_id]);
        }
        Ok(device_id)
    }

    pub fn untrust(&self, jid: &BareJid, fingerprint: &str) -> Result<DeviceId, OmemoError> {
        let state = self.state.lock();
        state.sessions.untrust(&state.conn, jid, fingerprint)
    }

    pub fn is_trusted(&self, jid: &BareJid, device_id: DeviceId) -> Result<bool, OmemoError> {
        let state = self.state.lock();
        state.sessions.is_trusted(&state.conn, jid, device_id)
    }

    /// `(device, formatted fingerprint, trusted)` for every identity seen
    /// from a device of `jid`. A device that changed keys is listed once per
    /// key.
    pub fn known_fingerprints(
        &self,
        jid: &BareJid,
    ) -> Result<Vec<(DeviceId, String, bool)>, OmemoError> {
        let state = self.state.lock();
        let store = CryptoStore::new(&state.conn);
        store
            .known_devices(jid)?
            .into_iter()
            .map(|(device_id, raw)| {
                let key = fingerprint::identity_key_bytes(&raw)?;
                let trusted = store
                    .trusted_identity(jid, device_id)?
                    .is_some_and(|stored| stored == key);
                Ok((device_id, fingerprint::fingerprint_bytes(&key, true), trusted))
            })
            .collect()
    }

    pub fn session_state(
        &self,
        jid: &BareJid,
        device_id: DeviceId,
    ) -> Result<SessionState, OmemoError> {
        let state = self.state.lock();
        state.sessions.state(&state.conn, jid, device_id)
    }

    /// Delete all sessions with `jid`.
    pub fn end_session(&self, jid: &BareJid) -> Result<usize, OmemoError> {
        let state = self.state.lock();
        state.sessions.end_session(&state.conn, jid)
    }

    /// Delete one session; the next message to the device fetches a fresh bundle.
    pub fn delete_session(&self, jid: &BareJid, device_id: DeviceId) -> Result<bool, OmemoError> {
        let state = self.state.lock();
        state.sessions.delete_session(&state.conn, jid, device_id)
    }
}
