//! Shared harness: recording collaborators and a loop that answers the
//! device-list and bundle requests contexts make of each other.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tern_omemo::{
    Collaborators, EncryptedEnvelope, OmemoBundle, OmemoConfig, OmemoContext, OmemoError, Roster,
    SeededCryptoProvider, Transport, TrustMode, Ui,
};
use tern_shared::{BareJid, DeviceId};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| OmemoConfig::default().log_level.into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn jid(s: &str) -> BareJid {
    BareJid::parse(s).unwrap()
}

#[derive(Default)]
pub struct Log {
    pub device_list_requests: Vec<BareJid>,
    pub bundle_requests: Vec<(BareJid, DeviceId)>,
    pub all_bundle_requests: Vec<(BareJid, DeviceId)>,
    pub published_bundles: usize,
    pub sent: Vec<(BareJid, EncryptedEnvelope)>,
    pub prompts: Vec<(BareJid, DeviceId, String)>,
    pub warnings: Vec<String>,
    pub accept_trust: bool,
}

#[derive(Clone, Default)]
pub struct Recorder(pub Arc<Mutex<Log>>);

impl Transport for Recorder {
    fn request_device_list(&self, jid: &BareJid) -> Result<(), OmemoError> {
        self.0.lock().device_list_requests.push(jid.clone());
        Ok(())
    }

    fn request_bundle(&self, jid: &BareJid, device_id: DeviceId) -> Result<(), OmemoError> {
        let mut log = self.0.lock();
        log.bundle_requests.push((jid.clone(), device_id));
        log.all_bundle_requests.push((jid.clone(), device_id));
        Ok(())
    }

    fn publish_bundle(&self, _bundle: &OmemoBundle) -> Result<(), OmemoError> {
        self.0.lock().published_bundles += 1;
        Ok(())
    }

    fn publish_device_list(&self, _ids: &BTreeSet<DeviceId>) -> Result<(), OmemoError> {
        Ok(())
    }

    fn send_encrypted_message(
        &self,
        to: &BareJid,
        envelope: &EncryptedEnvelope,
    ) -> Result<String, OmemoError> {
        let mut log = self.0.lock();
        log.sent.push((to.clone(), envelope.clone()));
        Ok(format!("msg-{}", log.sent.len()))
    }
}

impl Ui for Recorder {
    fn prompt_trust_decision(&self, jid: &BareJid, device_id: DeviceId, fingerprint: &str) -> bool {
        let mut log = self.0.lock();
        log.prompts
            .push((jid.clone(), device_id, fingerprint.to_string()));
        log.accept_trust
    }

    fn show_warning(&self, text: &str) {
        self.0.lock().warnings.push(text.to_string());
    }
}

pub struct Contacts(pub Vec<BareJid>);

impl Roster for Contacts {
    fn list_contacts(&self) -> Vec<BareJid> {
        self.0.clone()
    }
}

/// One device of one account.
pub struct Party {
    pub jid: BareJid,
    pub ctx: OmemoContext,
    pub log: Recorder,
}

impl Party {
    pub fn new(account: &str, seed: u64, trust_mode: TrustMode, contacts: &[&str]) -> Self {
        let log = Recorder::default();
        let config = OmemoConfig {
            trust_mode,
            pre_key_count: 5,
            pre_key_low_watermark: 2,
            ..OmemoConfig::default()
        };
        let ctx = OmemoContext::in_memory(
            jid(account),
            config,
            Box::new(SeededCryptoProvider::new(seed)),
            Collaborators {
                transport: Box::new(log.clone()),
                ui: Box::new(log.clone()),
                roster: Box::new(Contacts(contacts.iter().map(|c| jid(c)).collect())),
            },
        )
        .unwrap();
        Self {
            jid: jid(account),
            ctx,
            log,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.ctx.device_id()
    }

    pub fn last_sent(&self) -> EncryptedEnvelope {
        self.log.0.lock().sent.last().unwrap().1.clone()
    }
}

/// Answer outstanding requests until none are left. Device lists contain
/// every party of the requested account; bundles come from the party itself.
pub fn pump(parties: &[&Party]) {
    for _ in 0..32 {
        let mut progressed = false;
        for party in parties {
            let (lists, bundles) = {
                let mut log = party.log.0.lock();
                (
                    std::mem::take(&mut log.device_list_requests),
                    std::mem::take(&mut log.bundle_requests),
                )
            };

            for requested in lists {
                progressed = true;
                let ids: BTreeSet<DeviceId> = parties
                    .iter()
                    .filter(|p| p.jid == requested)
                    .map(|p| p.device())
                    .collect();
                party.ctx.on_device_list_received(&requested, ids).unwrap();
            }

            for (requested, device_id) in bundles {
                progressed = true;
                let Some(owner) = parties
                    .iter()
                    .find(|p| p.jid == requested && p.device() == device_id)
                else {
                    continue;
                };
                let bundle = owner.ctx.own_bundle().unwrap();
                // Rejections are part of the scenarios under test.
                let _ = party.ctx.on_bundle_received(&requested, device_id, &bundle);
            }
        }
        if !progressed {
            return;
        }
    }
    panic!("requests did not settle");
}
