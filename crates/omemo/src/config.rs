use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::OmemoError;

/// How identity keys of remote devices become trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum TrustMode {
    /// Only keys the user confirmed.
    #[default]
    Manual,
    /// Every new key is accepted and recorded at first contact.
    Blind,
    /// A device list from a contact with no trusted device promotes the
    /// listed devices whose keys were already seen.
    FirstUsage,
}

impl TrustMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustMode::Manual => "manual",
            TrustMode::Blind => "blind",
            TrustMode::FirstUsage => "firstusage",
        }
    }
}

impl fmt::Display for TrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustMode {
    type Err = OmemoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(TrustMode::Manual),
            "blind" => Ok(TrustMode::Blind),
            "firstusage" | "first-usage" | "first_usage" => Ok(TrustMode::FirstUsage),
            other => Err(OmemoError::Config(format!("unknown trust mode: {other}"))),
        }
    }
}

impl TryFrom<String> for TrustMode {
    type Error = OmemoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// OMEMO configuration loaded from the `[omemo]`-level TOML with env var overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct OmemoConfig {
    /// Root directory for per-account stores. Default: "./tern-data"
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Default: manual
    #[serde(default)]
    pub trust_mode: TrustMode,
    /// Pre-keys kept published. Default: 100
    #[serde(default = "default_pre_key_count")]
    pub pre_key_count: u32,
    /// Replenish once fewer than this many pre-keys remain. Default: 20
    #[serde(default = "default_pre_key_low_watermark")]
    pub pre_key_low_watermark: u32,
    /// Encrypt the account database with SQLCipher. Default: false
    #[serde(default)]
    pub encrypt_store: bool,
    /// Tracing filter directive. Default: "info"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tern-data")
}
fn default_pre_key_count() -> u32 {
    tern_shared::constants::OMEMO_PRE_KEY_BATCH
}
fn default_pre_key_low_watermark() -> u32 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OmemoConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            trust_mode: TrustMode::default(),
            pre_key_count: default_pre_key_count(),
            pre_key_low_watermark: default_pre_key_low_watermark(),
            encrypt_store: false,
            log_level: default_log_level(),
        }
    }
}

impl OmemoConfig {
    /// Load from a TOML file, then apply env var overrides.
    pub fn load(path: &Path) -> Result<Self, OmemoError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| OmemoError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Load from a TOML string, then apply env var overrides.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, OmemoError> {
        let mut config: OmemoConfig =
            toml::from_str(toml_str).map_err(|e| OmemoError::Config(e.to_string()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Returns an error if a variable is set but malformed (e.g. TERN_OMEMO_PREKEYS=abc).
    pub fn apply_env_overrides(&mut self) -> Result<(), OmemoError> {
        if let Ok(val) = std::env::var("TERN_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TERN_OMEMO_TRUST_MODE") {
            self.trust_mode = val.parse()?;
        }
        if let Ok(val) = std::env::var("TERN_OMEMO_PREKEYS") {
            self.pre_key_count = val
                .parse()
                .map_err(|_| OmemoError::Config(format!("invalid TERN_OMEMO_PREKEYS value: {val}")))?;
        }
        if let Ok(val) = std::env::var("TERN_LOG") {
            self.log_level = val;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), OmemoError> {
        if self.pre_key_count == 0 {
            return Err(OmemoError::Config("pre_key_count must be positive".into()));
        }
        if self.pre_key_low_watermark > self.pre_key_count {
            return Err(OmemoError::Config(format!(
                "pre_key_low_watermark ({}) exceeds pre_key_count ({})",
                self.pre_key_low_watermark, self.pre_key_count
            )));
        }
        Ok(())
    }

    /// Directory holding one account's store.
    pub fn account_dir(&self, account: &tern_shared::BareJid) -> PathBuf {
        self.data_dir.join(account.as_str())
    }
}
