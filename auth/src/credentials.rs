//! OAuth2 client credentials per identity provider
//!
//! The credential file maps a provider host (`host` or `host:port`, as it
//! appears in the claimed OpenID URL) to the client key and secret registered
//! with that provider:
//!
//! ```json
//! {
//!     "esgf-node.llnl.gov": {"key": "client-id", "secret": "client-secret"}
//! }
//! ```

use crate::error::ConfigError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Debug;
use url::Url;

/// Client key and secret for one provider.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ClientCredential {
    pub key: String,
    pub secret: String,
}

impl Debug for ClientCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredential")
            .field("key", &self.key)
            .field("secret", &"<sensitive key>")
            .finish()
    }
}

/// Looks up the OAuth2 client credential registered for a provider host.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, provider_host: &str) -> Option<ClientCredential>;
}

/// Extracts the credential lookup key (`host` or `host:port`) from a claimed
/// identity URL.
///
/// The port is kept exactly as written, default ports included:
/// `https://idp:443/...` looks up `idp:443`. The host is lowercased.
pub fn host_of(claimed_identity: &str) -> Option<String> {
    let claimed_identity = claimed_identity.trim();
    let url = Url::parse(claimed_identity).ok()?;
    let host = url.host_str()?;

    // `Url` forgets default ports, so read the port from the authority text
    let authority = claimed_identity
        .split_once("://")?
        .1
        .split(['/', '?', '#'])
        .next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, hostport)| hostport);
    Some(match authority.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{host}:{port}")
        }
        _ => host.to_string(),
    })
}

#[derive(Deserialize)]
struct CredentialEntry {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

/// Credential store backed by a JSON document, loaded once.
#[derive(Debug, Default)]
pub struct JsonCredentialStore {
    credentials: HashMap<String, ClientCredential>,
}

impl JsonCredentialStore {
    /// Parses the credential document. Entries without a non-empty key and
    /// secret are skipped.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let entries: HashMap<String, CredentialEntry> = serde_json::from_str(json)?;
        let credentials = entries
            .into_iter()
            .filter_map(|(host, entry)| match (entry.key, entry.secret) {
                (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                    Some((host, ClientCredential { key, secret }))
                }
                _ => {
                    tracing::warn!("ignoring incomplete OAuth2 credential for {host}");
                    None
                }
            })
            .collect();
        Ok(Self { credentials })
    }

    /// Loads the credential file. A missing or unreadable file is a
    /// configuration error.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&json).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn lookup(&self, provider_host: &str) -> Option<ClientCredential> {
        self.credentials.get(provider_host).cloned()
    }
}
