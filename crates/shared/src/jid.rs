//! Bare JID handling.
//!
//! OMEMO state (device lists, sessions, trust) is keyed by the bare JID of an
//! account, so every full JID is reduced to `local@domain` before use.

/// A bare XMPP address (`local@domain` or `domain`), case-folded.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct BareJid(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JidError {
    #[error("empty jid")]
    Empty,
    #[error("jid has an empty domain: {0}")]
    EmptyDomain(String),
    #[error("jid has an empty localpart: {0}")]
    EmptyLocal(String),
    #[error("jid contains a forbidden character: {0}")]
    ForbiddenCharacter(String),
}

impl BareJid {
    /// Parse a bare or full JID, dropping any resource.
    pub fn parse(input: &str) -> Result<Self, JidError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(JidError::Empty);
        }

        let bare = match trimmed.split_once('/') {
            Some((bare, _resource)) => bare,
            None => trimmed,
        };

        if bare
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ':' | '"' | '<' | '>' | '\'' | '&'))
        {
            return Err(JidError::ForbiddenCharacter(input.to_string()));
        }

        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };

        if domain.is_empty() {
            return Err(JidError::EmptyDomain(input.to_string()));
        }
        if domain.contains('@') {
            return Err(JidError::ForbiddenCharacter(input.to_string()));
        }

        match local {
            Some("") => Err(JidError::EmptyLocal(input.to_string())),
            Some(local) => Ok(Self(format!(
                "{}@{}",
                local.to_lowercase(),
                domain.to_lowercase()
            ))),
            None => Ok(Self(domain.to_lowercase())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BareJid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for BareJid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BareJid {
    type Error = JidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BareJid> for String {
    fn from(jid: BareJid) -> Self {
        jid.0
    }
}

impl AsRef<str> for BareJid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
