//! OAuth2 branch of the login: OIDC authorization code flow with PKCE
//!
//! The protocol work is done by `openidconnect`. This module only builds a
//! client per login from the discovered issuer and the client credential
//! registered for that provider, so the credential in use is always the one
//! belonging to the provider the user picked.

use crate::credentials::ClientCredential;
use crate::flow_state::{FlowState, sign_state};
use moka::future::Cache;
use openidconnect::core::{CoreProviderMetadata, CoreResponseType};
use openidconnect::{
    AuthenticationFlow, AuthorizationCode, ClientId, ClientSecret, CsrfToken, IssuerUrl, Nonce,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope, TokenResponse,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Type alias for the OIDC client with endpoints set from provider metadata
type ConfiguredCoreClient = openidconnect::Client<
    openidconnect::EmptyAdditionalClaims,
    openidconnect::core::CoreAuthDisplay,
    openidconnect::core::CoreGenderClaim,
    openidconnect::core::CoreJweContentEncryptionAlgorithm,
    openidconnect::core::CoreJsonWebKey,
    openidconnect::core::CoreAuthPrompt,
    openidconnect::StandardErrorResponse<openidconnect::core::CoreErrorResponseType>,
    openidconnect::core::CoreTokenResponse,
    openidconnect::core::CoreTokenIntrospectionResponse,
    openidconnect::core::CoreRevocableToken,
    openidconnect::core::CoreRevocationErrorResponse,
    openidconnect::EndpointSet,
    openidconnect::EndpointNotSet,
    openidconnect::EndpointNotSet,
    openidconnect::EndpointNotSet,
    openidconnect::EndpointMaybeSet,
    openidconnect::EndpointMaybeSet,
>;

const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("provider discovery failed: {0}")]
    Discovery(String),

    #[error("invalid login state: {0}")]
    InvalidState(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("provider returned no ID token")]
    MissingIdToken,

    #[error("ID token rejected: {0}")]
    IdToken(String),
}

/// OIDC authorization code login against discovered issuers
pub struct OidcHandshake {
    http_client: reqwest::Client,
    redirect_uri: RedirectUrl,
    metadata: Cache<String, Arc<CoreProviderMetadata>>,
}

impl OidcHandshake {
    /// `redirect_uri` is the public URL of the callback endpoint.
    pub fn new(redirect_uri: &str) -> Result<Self, HandshakeError> {
        // no redirects: token and discovery endpoints must answer directly
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                HandshakeError::Configuration(format!("Failed to create HTTP client: {e:?}"))
            })?;
        let redirect_uri = RedirectUrl::new(redirect_uri.to_string())
            .map_err(|e| HandshakeError::Configuration(format!("Invalid redirect URI: {e:?}")))?;
        let metadata = Cache::builder()
            .max_capacity(64)
            .time_to_live(DEFAULT_METADATA_TTL)
            .build();
        Ok(Self {
            http_client,
            redirect_uri,
            metadata,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        self.redirect_uri.as_str()
    }

    async fn provider_metadata(
        &self,
        issuer: &str,
    ) -> Result<Arc<CoreProviderMetadata>, HandshakeError> {
        let http_client = self.http_client.clone();
        let issuer_owned = issuer.to_string();
        self.metadata
            .try_get_with(issuer.to_string(), async move {
                let issuer_url = IssuerUrl::new(issuer_owned)
                    .map_err(|e| format!("Invalid issuer URL: {e:?}"))?;
                CoreProviderMetadata::discover_async(issuer_url, &http_client)
                    .await
                    .map(Arc::new)
                    .map_err(|e| format!("{e:?}"))
            })
            .await
            .map_err(|e: Arc<String>| HandshakeError::Discovery(format!("{issuer}: {e}")))
    }

    async fn client(
        &self,
        issuer: &str,
        credential: &ClientCredential,
    ) -> Result<ConfiguredCoreClient, HandshakeError> {
        let metadata = self.provider_metadata(issuer).await?;
        Ok(openidconnect::core::CoreClient::from_provider_metadata(
            (*metadata).clone(),
            ClientId::new(credential.key.clone()),
            Some(ClientSecret::new(credential.secret.clone())),
        )
        .set_redirect_uri(self.redirect_uri.clone()))
    }

    /// Builds the provider authorization URL.
    ///
    /// A fresh PKCE verifier and the issuer are stored in `state`; keep it in
    /// the browser-bound flow cookie. The copy signed with `state_secret` and
    /// sent as the OAuth2 `state` parameter leaves the verifier out. The flow
    /// state nonce doubles as the OIDC nonce.
    pub async fn authorization_url(
        &self,
        issuer: &str,
        credential: &ClientCredential,
        state: &mut FlowState,
        state_secret: &[u8],
    ) -> Result<Url, HandshakeError> {
        let client = self.client(issuer, credential).await?;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        state.pkce_verifier = Some(pkce_verifier.secret().to_string());
        state.issuer = Some(issuer.to_string());
        let public_state = FlowState {
            pkce_verifier: None,
            ..state.clone()
        };
        let signed_state = sign_state(&public_state, state_secret)
            .map_err(|e| HandshakeError::InvalidState(format!("{e}")))?;
        let nonce = state.nonce.clone();

        let (auth_url, _csrf_token, _nonce) = client
            .authorize_url(
                AuthenticationFlow::<CoreResponseType>::AuthorizationCode,
                move || CsrfToken::new(signed_state),
                move || Nonce::new(nonce),
            )
            .add_scope(Scope::new("openid".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .add_scope(Scope::new("email".to_string()))
            .set_pkce_challenge(pkce_challenge)
            .url();

        Ok(auth_url)
    }

    /// Exchanges the authorization code and returns the verified subject of
    /// the ID token. ESGF identity providers use the OpenID URL as subject.
    ///
    /// `state` is the flow state prepared by
    /// [`authorization_url`](Self::authorization_url), with the PKCE verifier.
    pub async fn complete(
        &self,
        credential: &ClientCredential,
        code: &str,
        state: &FlowState,
    ) -> Result<String, HandshakeError> {
        let issuer = state
            .issuer
            .as_deref()
            .ok_or_else(|| HandshakeError::InvalidState("missing issuer".to_string()))?;
        let pkce_verifier = state
            .pkce_verifier
            .clone()
            .ok_or_else(|| HandshakeError::InvalidState("missing PKCE verifier".to_string()))?;

        let client = self.client(issuer, credential).await?;
        let token_response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .map_err(|e| HandshakeError::Configuration(format!("{e:?}")))?
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
            .request_async(&self.http_client)
            .await
            .map_err(|e| HandshakeError::TokenExchange(format!("{e:?}")))?;

        let id_token = token_response
            .id_token()
            .ok_or(HandshakeError::MissingIdToken)?;
        let claims = id_token
            .claims(&client.id_token_verifier(), &Nonce::new(state.nonce.clone()))
            .map_err(|e| HandshakeError::IdToken(format!("{e:?}")))?;

        Ok(claims.subject().as_str().to_string())
    }
}
