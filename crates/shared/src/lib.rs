//! tern-shared: value types and contracts shared between the XMPP client
//! layers and the OMEMO encryption subsystem.

pub mod base64_serde;
pub mod constants;
pub mod error;
pub mod ids;
pub mod jid;

pub use ids::DeviceId;
pub use jid::BareJid;
