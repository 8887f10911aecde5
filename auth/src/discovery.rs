//! Identity provider discovery
//!
//! Given a claimed identity (an OpenID URL such as
//! `https://esgf-node.llnl.gov/esgf-idp/openid/alice`), decide which protocol
//! its provider speaks:
//!
//! 1. OIDC discovery at the identity's origin
//!    (`/.well-known/openid-configuration`) means the OAuth2 branch.
//! 2. Otherwise the claimed identity document is fetched and checked for an
//!    OpenID 2.0 provider, either advertised in an XRDS document or through an
//!    `openid2.provider` link.

use async_trait::async_trait;
use openidconnect::IssuerUrl;
use openidconnect::core::CoreProviderMetadata;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const OPENID2_SIGNON_TYPE: &str = "http://specs.openid.net/auth/2.0/signon";
const OPENID2_SERVER_TYPE: &str = "http://specs.openid.net/auth/2.0/server";
const OPENID2_PROVIDER_REL: &str = "openid2.provider";

/// Authentication protocol spoken by an identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// OpenID 2.0
    OpenId,
    /// OAuth2 with OIDC discovery
    OAuth2,
}

/// Result of a successful discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub protocol: ProtocolKind,
    /// OIDC issuer URL for OAuth2, OpenID 2.0 provider endpoint for OpenId
    pub endpoint: String,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("claimed identity is not an http(s) URL: {0}")]
    InvalidIdentity(String),

    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("no OpenID/OAuth2 service advertised for {0}")]
    NotFound(String),
}

/// Discovers the protocol of the provider behind a claimed identity.
#[async_trait]
pub trait ProviderDiscovery: Send + Sync {
    async fn discover(&self, claimed_identity: &str) -> Result<Discovery, DiscoveryError>;
}

/// Discovery over HTTP
pub struct HttpProviderDiscovery {
    http_client: reqwest::Client,
}

impl HttpProviderDiscovery {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e:?}"))?;
        Ok(Self { http_client })
    }

    async fn discover_oidc(&self, issuer: &str) -> Option<Discovery> {
        let issuer_url = IssuerUrl::new(issuer.to_string()).ok()?;
        match CoreProviderMetadata::discover_async(issuer_url, &self.http_client).await {
            Ok(_) => Some(Discovery {
                protocol: ProtocolKind::OAuth2,
                endpoint: issuer.to_string(),
            }),
            Err(e) => {
                tracing::debug!("no OIDC metadata at {issuer}: {e:?}");
                None
            }
        }
    }

    async fn discover_openid2(&self, identity: &Url) -> Result<Discovery, DiscoveryError> {
        let fetch_error = |e: reqwest::Error| DiscoveryError::Fetch {
            url: identity.to_string(),
            reason: format!("{e}"),
        };
        let response = self
            .http_client
            .get(identity.as_str())
            .header(ACCEPT, "application/xrds+xml, text/html;q=0.9, */*;q=0.1")
            .send()
            .await
            .map_err(fetch_error)?;

        if !response.status().is_success() {
            return Err(DiscoveryError::NotFound(format!(
                "{identity} (HTTP {})",
                response.status()
            )));
        }

        let document = response.text().await.map_err(fetch_error)?;
        openid2_endpoint(&document)
            .map(|endpoint| Discovery {
                protocol: ProtocolKind::OpenId,
                endpoint: endpoint.unwrap_or_else(|| identity.to_string()),
            })
            .ok_or_else(|| DiscoveryError::NotFound(identity.to_string()))
    }
}

#[async_trait]
impl ProviderDiscovery for HttpProviderDiscovery {
    async fn discover(&self, claimed_identity: &str) -> Result<Discovery, DiscoveryError> {
        let identity = Url::parse(claimed_identity.trim())
            .map_err(|_| DiscoveryError::InvalidIdentity(claimed_identity.to_string()))?;
        if !matches!(identity.scheme(), "http" | "https") || identity.host_str().is_none() {
            return Err(DiscoveryError::InvalidIdentity(
                claimed_identity.to_string(),
            ));
        }

        let issuer = identity.origin().ascii_serialization();
        if let Some(discovery) = self.discover_oidc(&issuer).await {
            return Ok(discovery);
        }
        self.discover_openid2(&identity).await
    }
}

/// Looks for an OpenID 2.0 provider in an XRDS or HTML document.
///
/// Returns `None` when the document advertises no OpenID 2.0 service,
/// `Some(None)` when it does without a usable endpoint URI.
fn openid2_endpoint(document: &str) -> Option<Option<String>> {
    let service_type = document
        .find(OPENID2_SERVER_TYPE)
        .or_else(|| document.find(OPENID2_SIGNON_TYPE));
    if let Some(pos) = service_type {
        return Some(element_text(&document[pos..], "URI"));
    }

    let rel = document.find(OPENID2_PROVIDER_REL)?;
    let tag_start = document[..rel].rfind('<').unwrap_or(0);
    let tag_end = document[rel..]
        .find('>')
        .map(|end| rel + end)
        .unwrap_or(document.len());
    Some(attribute_value(&document[tag_start..tag_end], "href"))
}

/// Text of the first `<name>` (optionally namespace-prefixed) element.
fn element_text(fragment: &str, name: &str) -> Option<String> {
    let mut rest = fragment;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let tag_end = after.find('>')?;
        let tag_name = after[..tag_end].split_whitespace().next().unwrap_or("");
        if tag_name.rsplit(':').next() == Some(name) {
            let content = &after[tag_end + 1..];
            let close = content.find("</")?;
            let text = content[..close].trim();
            return (!text.is_empty()).then(|| text.to_string());
        }
        rest = &after[tag_end..];
    }
    None
}

/// Value of a quoted attribute inside a single tag.
fn attribute_value(tag: &str, name: &str) -> Option<String> {
    let start = tag.find(&format!("{name}="))? + name.len() + 1;
    let quoted = &tag[start..];
    let quote = quoted.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &quoted[1..];
    let end = value.find(quote)?;
    Some(value[..end].to_string())
}
