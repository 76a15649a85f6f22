//! Interfaces this subsystem consumes from the rest of the client.
//!
//! Requests are fire-and-forget: the transport answers later by calling
//! [`OmemoContext::on_device_list_received`] or
//! [`OmemoContext::on_bundle_received`]. An implementation may also answer
//! synchronously from inside the request call; the context lock is reentrant.
//!
//! [`OmemoContext::on_device_list_received`]: crate::context::OmemoContext::on_device_list_received
//! [`OmemoContext::on_bundle_received`]: crate::context::OmemoContext::on_bundle_received

use std::collections::BTreeSet;

use tern_shared::{BareJid, DeviceId};

use crate::error::OmemoError;
use crate::message::EncryptedEnvelope;
use crate::prekeys::OmemoBundle;

/// XMPP stanza layer.
pub trait Transport: Send {
    fn request_device_list(&self, jid: &BareJid) -> Result<(), OmemoError>;

    fn request_bundle(&self, jid: &BareJid, device_id: DeviceId) -> Result<(), OmemoError>;

    /// Publish this device's bundle.
    fn publish_bundle(&self, bundle: &OmemoBundle) -> Result<(), OmemoError>;

    /// Publish this account's device list.
    fn publish_device_list(&self, ids: &BTreeSet<DeviceId>) -> Result<(), OmemoError>;

    /// Send an encrypted message stanza. Returns the stanza id.
    fn send_encrypted_message(
        &self,
        to: &BareJid,
        envelope: &EncryptedEnvelope,
    ) -> Result<String, OmemoError>;
}

/// Terminal UI.
pub trait Ui: Send {
    /// Ask whether to trust a new identity. Only asked in manual mode.
    fn prompt_trust_decision(&self, jid: &BareJid, device_id: DeviceId, fingerprint: &str) -> bool;

    fn show_warning(&self, text: &str);
}

/// Contact list.
pub trait Roster: Send {
    fn list_contacts(&self) -> Vec<BareJid>;

    /// Real JIDs of the members of a group chat.
    fn group_members(&self, _room: &BareJid) -> Vec<BareJid> {
        Vec::new()
    }
}

/// The collaborators one context talks to.
pub struct Collaborators {
    pub transport: Box<dyn Transport>,
    pub ui: Box<dyn Ui>,
    pub roster: Box<dyn Roster>,
}
