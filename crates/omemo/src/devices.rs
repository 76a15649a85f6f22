//! In-memory cache of contacts' device lists.
//!
//! Each JID has at most one pending device-list request. Registering a new
//! one drops the previous sender, so its receiver resolves with a
//! `RecvError` instead of a list.

use std::collections::{BTreeSet, HashMap};

use tern_shared::{BareJid, DeviceId};
use tokio::sync::oneshot;

#[derive(Debug, Default)]
pub struct DeviceDirectory {
    lists: HashMap<BareJid, BTreeSet<DeviceId>>,
    pending: HashMap<BareJid, oneshot::Sender<BTreeSet<DeviceId>>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached list and resolve the pending request, if any.
    pub fn set_devices(&mut self, jid: &BareJid, ids: BTreeSet<DeviceId>) {
        if let Some(waiter) = self.pending.remove(jid) {
            // The waiter may have given up; that is fine.
            let _ = waiter.send(ids.clone());
        }
        self.lists.insert(jid.clone(), ids);
    }

    pub fn get_devices(&self, jid: &BareJid) -> Option<&BTreeSet<DeviceId>> {
        self.lists.get(jid)
    }

    /// Wait for the next list of `jid`, cancelling any earlier waiter.
    pub fn register_pending(&mut self, jid: &BareJid) -> oneshot::Receiver<BTreeSet<DeviceId>> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(jid.clone(), tx).is_some() {
            tracing::debug!(jid = %jid, "replaced pending device-list request");
        }
        rx
    }

    /// Drop everything, e.g. on disconnect. Pending receivers are cancelled.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.lists.clear();
    }
}
