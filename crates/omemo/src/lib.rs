//! tern-omemo: OMEMO end-to-end encryption for the tern XMPP client.
//!
//! Provides device identity and pre-key management, per-device Signal
//! sessions with configurable trust, multi-device message encryption,
//! AES-256-GCM file encryption for media sharing, and key storage backed by
//! (optionally SQLCipher-encrypted) SQLite.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod crypto;
pub mod devices;
pub mod error;
pub mod file_codec;
pub mod fingerprint;
pub mod identity;
pub mod message;
pub mod prekeys;
pub mod session;
pub mod storage;
pub mod store_key;

pub use collaborators::{Collaborators, Roster, Transport, Ui};
pub use config::{OmemoConfig, TrustMode};
pub use context::OmemoContext;
pub use crypto::{CryptoProvider, RustCryptoProvider, SeededCryptoProvider};
pub use error::{CryptoError, OmemoError};
pub use message::{EncryptedEnvelope, RecipientKey};
pub use prekeys::OmemoBundle;
pub use session::SessionState;
