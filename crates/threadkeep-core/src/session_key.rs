use crate::error::{ThreadkeepError, ThreadkeepResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const PRINCIPAL_SEPARATOR: char = ':';

/// Opaque identifier of one conversation thread.
///
/// Keys are either bare tokens or `principal:token` when a conversation is
/// scoped to an authenticated user. Generated tokens are UUID v4 so a key is
/// never reused after its session is deleted or expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionKey(String);

impl SessionKey {
    /// Wraps a caller-supplied key. Empty or whitespace-only keys are rejected.
    pub fn new(key: impl Into<String>) -> ThreadkeepResult<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ThreadkeepError::InvalidSessionKey(
                "session key must not be empty".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// A fresh anonymous key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// A fresh key namespaced by `principal`, e.g. `alice:0b6c...`.
    pub fn for_principal(principal: &str) -> ThreadkeepResult<Self> {
        let principal = principal.trim();
        if principal.is_empty() {
            return Err(ThreadkeepError::InvalidSessionKey(
                "principal must not be empty".to_string(),
            ));
        }
        if principal.contains(PRINCIPAL_SEPARATOR) {
            return Err(ThreadkeepError::InvalidSessionKey(format!(
                "principal '{principal}' must not contain '{PRINCIPAL_SEPARATOR}'"
            )));
        }
        Ok(Self(format!(
            "{principal}{PRINCIPAL_SEPARATOR}{}",
            Uuid::new_v4()
        )))
    }

    /// The principal namespace, if the key was composed as `principal:token`.
    pub fn principal(&self) -> Option<&str> {
        self.0
            .split_once(PRINCIPAL_SEPARATOR)
            .map(|(principal, _)| principal)
            .filter(|p| !p.is_empty())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionKey {
    type Error = ThreadkeepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for SessionKey {
    type Err = ThreadkeepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
