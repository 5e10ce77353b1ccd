//! Namespaced record keys
//!
//! Keys live under an application path prefix such as `/myapp/`. They are
//! validated here, before any substrate call.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DhtError, Result};

/// Default application namespace
pub const DEFAULT_NAMESPACE: &str = "myapp";

/// Application key namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Create a namespace from a bare name (`myapp`) or a path (`/myapp/`)
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref().trim_matches('/');
        if name.is_empty() {
            return Err(DhtError::Configuration("namespace must not be empty".to_string()));
        }
        if name.chars().any(|c| c.is_whitespace()) {
            return Err(DhtError::Configuration(format!(
                "namespace {:?} must not contain whitespace",
                name
            )));
        }
        Ok(Self {
            prefix: format!("/{}/", name),
        })
    }

    /// Path prefix including both slashes, e.g. `/myapp/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a key by prefixing `name`
    pub fn key(&self, name: &str) -> Result<RecordKey> {
        self.validate(&format!("{}{}", self.prefix, name.trim_start_matches('/')))
    }

    /// Check that `raw` belongs to this namespace
    pub fn validate(&self, raw: &str) -> Result<RecordKey> {
        let rest = raw.strip_prefix(self.prefix.as_str()).ok_or_else(|| DhtError::InvalidKey {
            key: raw.to_string(),
            reason: format!("must start with {}", self.prefix),
        })?;
        if rest.is_empty() {
            return Err(DhtError::InvalidKey {
                key: raw.to_string(),
                reason: "missing name after namespace".to_string(),
            });
        }
        if rest.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DhtError::InvalidKey {
                key: raw.to_string(),
                reason: "must not contain whitespace or control characters".to_string(),
            });
        }
        Ok(RecordKey(raw.to_string()))
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            prefix: format!("/{}/", DEFAULT_NAMESPACE),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

impl TryFrom<String> for Namespace {
    type Error = DhtError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.prefix
    }
}

/// A key that passed namespace validation
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey(String);

impl RecordKey {
    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes handed to the substrate
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<[u8]> for RecordKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
