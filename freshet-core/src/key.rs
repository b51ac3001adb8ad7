//! Resource keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum encoded length of a resource key in bytes. Matches the largest
/// key a default LMDB build accepts.
pub const MAX_KEY_LEN: usize = 511;

/// Opaque identifier of a cacheable resource.
///
/// Keys are compared byte-wise and used unchanged as the LMDB key on the
/// client and as the subscription key on the server. The only way to build
/// one is through [`ResourceKey::new`] (or `FromStr`/serde, which call it),
/// so every key in the system has been validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Validate and wrap a key.
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ValidationError::InvalidResourceKey {
                key,
                reason: "must not be empty".to_string(),
            });
        }
        if key.len() > MAX_KEY_LEN {
            return Err(ValidationError::InvalidResourceKey {
                reason: format!("must be at most {} bytes, got {}", MAX_KEY_LEN, key.len()),
                key,
            });
        }
        if key.chars().any(char::is_control) {
            return Err(ValidationError::InvalidResourceKey {
                key,
                reason: "must not contain control characters".to_string(),
            });
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Rebuild a key from stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let key = std::str::from_utf8(bytes).map_err(|e| ValidationError::InvalidResourceKey {
            key: String::from_utf8_lossy(bytes).into_owned(),
            reason: e.to_string(),
        })?;
        Self::new(key)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.0
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
