//! Shared secrets used to sign session tickets
//!
//! A [`SecretKeyRing`] holds the current key, used to mint new tickets, and an
//! ordered list of previous keys that are still accepted when parsing. Rotating
//! the secret is a matter of moving the current key to the previous list and
//! installing a new current key; tickets minted under the old key stay valid
//! until it is dropped from the ring.

use crate::error::ConfigError;
use base64::Engine;
use std::fmt::{Debug, Display};

/// Opaque secret bytes. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey {
    bytes: Vec<u8>,
}

impl SecretKey {
    /// Creates a key from raw bytes. Empty keys are rejected.
    pub fn new(bytes: Vec<u8>) -> Result<Self, ConfigError> {
        if bytes.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        Ok(Self { bytes })
    }

    /// Decodes a base64 (standard alphabet) encoded key, the form used in
    /// node configuration files.
    pub fn from_base64(encoded: &str) -> Result<Self, ConfigError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ConfigError::InvalidSecret(format!("{e}")))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Display for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<sensitive key>")
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(<sensitive key>)")
    }
}

/// The current signing key plus previous keys still accepted for validation.
#[derive(Clone, Debug)]
pub struct SecretKeyRing {
    current: SecretKey,
    previous: Vec<SecretKey>,
}

impl SecretKeyRing {
    /// A ring with a single key and no rotation history.
    pub fn new(current: SecretKey) -> Self {
        Self {
            current,
            previous: Vec::new(),
        }
    }

    /// Adds a previous key. Keys are tried in the order they are added, after
    /// the current key.
    pub fn with_previous(mut self, key: SecretKey) -> Self {
        self.previous.push(key);
        self
    }

    /// Builds a ring from base64 encoded keys: the current key and a comma
    /// separated list of previous keys (empty entries are skipped).
    pub fn from_base64(current: &str, previous: Option<&str>) -> Result<Self, ConfigError> {
        let mut ring = Self::new(SecretKey::from_base64(current)?);
        if let Some(previous) = previous {
            for encoded in previous.split(',').filter(|s| !s.trim().is_empty()) {
                ring = ring.with_previous(SecretKey::from_base64(encoded)?);
            }
        }
        Ok(ring)
    }

    /// Key used to mint new tickets.
    pub fn current(&self) -> &SecretKey {
        &self.current
    }

    /// Every accepted key, current first.
    pub fn accepted(&self) -> impl Iterator<Item = &SecretKey> {
        std::iter::once(&self.current).chain(self.previous.iter())
    }
}

impl From<SecretKey> for SecretKeyRing {
    fn from(key: SecretKey) -> Self {
        Self::new(key)
    }
}
