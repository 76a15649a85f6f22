/// Number of one-time pre-keys generated for a fresh identity.
pub const OMEMO_PRE_KEY_BATCH: u32 = 100;
/// Id of the signed pre-key generated with a fresh identity.
pub const OMEMO_SIGNED_PRE_KEY_ID: u32 = 1;
/// Registration ids are drawn from `1..=OMEMO_MAX_REGISTRATION_ID`.
pub const OMEMO_MAX_REGISTRATION_ID: u32 = 16380;

/// AES-128-GCM message payload key length.
pub const AES128_GCM_KEY_LENGTH: usize = 16;
/// AES-128-GCM message payload IV length.
pub const AES128_GCM_IV_LENGTH: usize = 12;
/// GCM authentication tag length.
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// AES-256-GCM file key length.
pub const AESGCM_FILE_KEY_LENGTH: usize = 32;
/// AES-256-GCM file nonce length.
pub const AESGCM_FILE_NONCE_LENGTH: usize = 12;
