use crate::views::Views;
use esgf_auth::flow::AuthFlowController;
use esgf_auth::handshake::OidcHandshake;
use esgf_auth::providers::KnownProviders;
use std::sync::Arc;

/// Server settings that are not owned by the library components
#[derive(Clone)]
pub struct ServerSettings {
    /// HMAC key for the login flow state
    pub state_secret: Vec<u8>,
    /// Query parameter carrying the return URL, as sent by the THREDDS filter
    pub return_query_name: String,
    pub secure_cookies: bool,
    pub cookie_domain: Option<String>,
    pub trust_forwarded_headers: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AuthFlowController>,
    pub handshake: Arc<OidcHandshake>,
    pub known_providers: Arc<dyn KnownProviders>,
    pub views: Arc<Views>,
    pub settings: Arc<ServerSettings>,
}
