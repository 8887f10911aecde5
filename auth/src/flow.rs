//! Login flow controller
//!
//! The controller sits between the HTTP layer and the session cookie layer:
//!
//! - `begin_login` turns a claimed identity into a decision about which
//!   federated protocol to use, with the per-provider OAuth2 credential
//!   attached. Credentials travel with the decision; nothing process-wide is
//!   modified, so concurrent logins against different providers cannot see
//!   each other's client secrets.
//! - `complete_login` mints the session cookie once the federated round trip
//!   has produced a verified subject.
//! - `authenticate` is the relying-party side: it turns a presented cookie into
//!   a session state. Every rejection reason collapses to `Unauthenticated`.

use crate::credentials::{ClientCredential, CredentialStore, host_of};
use crate::discovery::{ProtocolKind, ProviderDiscovery};
use crate::error::TicketError;
use crate::session_cookie::SessionCookieManager;
use crate::ticket::Ticket;
use crate::url_validation::validate_return_url;
use axum_extra::extract::cookie::Cookie;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Which federated login to start for a claimed identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginDecision {
    /// OAuth2/OIDC provider with a registered client credential
    OAuth2 {
        claimed_identity: String,
        issuer: String,
        credential: ClientCredential,
    },
    /// OpenID 2.0 provider, or OAuth2 provider without a registered credential
    OpenId {
        claimed_identity: String,
        endpoint: String,
    },
    /// No usable service was discovered
    NotRecognized { claimed_identity: String },
}

/// What to do once the user is authenticated
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Set the cookie and send the user back where they came from
    Redirect {
        location: String,
        cookie: Cookie<'static>,
    },
    /// Set the cookie and show the home page
    Home {
        subject: String,
        cookie: Cookie<'static>,
    },
}

/// Session state of an incoming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(Ticket),
}

impl SessionState {
    pub fn subject(&self) -> Option<&str> {
        match self {
            SessionState::Unauthenticated => None,
            SessionState::Authenticated(ticket) => Some(&ticket.subject),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }
}

pub struct AuthFlowController {
    discovery: Arc<dyn ProviderDiscovery>,
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<SessionCookieManager>,
    tokens: Vec<String>,
    allowed_redirect_hosts: Vec<String>,
}

impl AuthFlowController {
    pub fn new(
        discovery: Arc<dyn ProviderDiscovery>,
        credentials: Arc<dyn CredentialStore>,
        sessions: Arc<SessionCookieManager>,
    ) -> Self {
        Self {
            discovery,
            credentials,
            sessions,
            tokens: Vec::new(),
            allowed_redirect_hosts: Vec::new(),
        }
    }

    /// Tokens granted to every minted ticket.
    pub fn with_tokens(mut self, tokens: Vec<String>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Hosts accepted as absolute return URLs.
    pub fn with_allowed_redirect_hosts(mut self, hosts: Vec<String>) -> Self {
        self.allowed_redirect_hosts = hosts;
        self
    }

    pub fn sessions(&self) -> &SessionCookieManager {
        &self.sessions
    }

    /// Discovers the provider for a claimed identity and picks the branch.
    ///
    /// Discovery and credential lookup failures are logged and reported as
    /// `NotRecognized` or as a fallback to OpenID; they are never errors.
    #[tracing::instrument(skip(self))]
    pub async fn begin_login(&self, claimed_identity: &str) -> LoginDecision {
        let claimed_identity = claimed_identity.trim().to_string();

        let discovery = match self.discovery.discover(&claimed_identity).await {
            Ok(discovery) => discovery,
            Err(e) => {
                error!("could not discover authentication service for {claimed_identity}: {e}");
                return LoginDecision::NotRecognized { claimed_identity };
            }
        };

        if discovery.protocol == ProtocolKind::OpenId {
            return LoginDecision::OpenId {
                claimed_identity,
                endpoint: discovery.endpoint,
            };
        }

        let credential = self.credential_for(&claimed_identity).await;
        if credential.is_none() {
            error!("could not find an OAuth2 client key and secret for {claimed_identity}");
        }

        match credential {
            Some(credential) => LoginDecision::OAuth2 {
                claimed_identity,
                issuer: discovery.endpoint,
                credential,
            },
            None => LoginDecision::OpenId {
                claimed_identity,
                endpoint: discovery.endpoint,
            },
        }
    }

    /// Credential registered for the provider of a claimed identity.
    pub async fn credential_for(&self, claimed_identity: &str) -> Option<ClientCredential> {
        let host = host_of(claimed_identity)?;
        self.credentials.lookup(&host).await
    }

    /// Returns the return URL if it may be redirected to.
    pub fn accept_return_url(&self, candidate: Option<&str>) -> Option<String> {
        let candidate = candidate.map(str::trim).filter(|url| !url.is_empty())?;
        if validate_return_url(candidate, &self.allowed_redirect_hosts) {
            Some(candidate.to_string())
        } else {
            warn!("rejected return URL {candidate}");
            None
        }
    }

    /// Mints the session cookie for a verified subject.
    ///
    /// The return URL is passed through as given; validate it with
    /// [`accept_return_url`](Self::accept_return_url) before the login starts.
    pub fn complete_login(
        &self,
        subject: &str,
        client_address: &str,
        return_to: Option<&str>,
    ) -> Result<LoginOutcome, TicketError> {
        let tokens: Vec<&str> = self.tokens.iter().map(String::as_str).collect();
        let value = self.sessions.mint(
            subject,
            self.sessions.bound_address(client_address),
            &tokens,
            "",
        )?;
        let cookie = self.sessions.session_cookie(value);
        info!("user {subject} successfully authenticated");

        Ok(match return_to {
            Some(location) => LoginOutcome::Redirect {
                location: location.to_string(),
                cookie,
            },
            None => LoginOutcome::Home {
                subject: subject.to_string(),
                cookie,
            },
        })
    }

    /// Recovers the session from a presented cookie value.
    pub fn authenticate(&self, cookie_value: Option<&str>, client_address: &str) -> SessionState {
        let Some(value) = cookie_value.filter(|value| !value.is_empty()) else {
            return SessionState::Unauthenticated;
        };
        match self.sessions.validate(value, client_address) {
            Ok(ticket) => SessionState::Authenticated(ticket),
            Err(e) => {
                debug!("session cookie rejected: {e}");
                SessionState::Unauthenticated
            }
        }
    }
}
