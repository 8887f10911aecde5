use anyhow::{Context, Result};
use axum::ServiceExt;
use chrono::Duration;
use clap::Parser;
use esgf_auth::credentials::JsonCredentialStore;
use esgf_auth::discovery::HttpProviderDiscovery;
use esgf_auth::flow::AuthFlowController;
use esgf_auth::handshake::OidcHandshake;
use esgf_auth::providers::{JsonKnownProviders, KnownProviders};
use esgf_auth::secret::SecretKeyRing;
use esgf_auth::session_cookie::{
    AddressBinding, CookiePolicy, SessionConfig, SessionCookieManager,
};
use esgf_auth_srv::build_router;
use esgf_auth_srv::handlers::CALLBACK_PATH;
use esgf_auth_srv::state::{AppState, ServerSettings};
use esgf_auth_srv::views::Views;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Layer;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "8000", env = "ESGF_AUTH_PORT")]
    port: u16,

    /// Base64 secret shared with the THREDDS authentication filter
    #[arg(long, env = "ESGF_SECRET_KEY", hide_env_values = true)]
    secret_key: String,

    /// Comma-separated base64 secrets still accepted for validation
    #[arg(long, env = "ESGF_PREVIOUS_SECRET_KEYS", hide_env_values = true)]
    previous_secret_keys: Option<String>,

    #[arg(long, default_value = "esgf_session", env = "ESGF_SESSION_COOKIE_NAME")]
    session_cookie_name: String,

    /// Query parameter carrying the return URL
    #[arg(long, default_value = "redirect", env = "ESGF_RETURN_QUERY_NAME")]
    return_query_name: String,

    /// Reject session tickets older than this; also used as cookie Max-Age
    #[arg(long, env = "ESGF_SESSION_MAX_AGE_SECS")]
    session_max_age_secs: Option<u64>,

    /// Bind tickets to the client address that logged in
    #[arg(long, env = "ESGF_BIND_CLIENT_ADDRESS")]
    bind_client_address: bool,

    #[arg(long, env = "ESGF_COOKIE_DOMAIN")]
    cookie_domain: Option<String>,

    #[arg(long, env = "ESGF_SECURE_COOKIES")]
    secure_cookies: bool,

    /// Use X-Forwarded-For / X-Real-IP as the client address (behind a proxy)
    #[arg(long, env = "ESGF_TRUST_FORWARDED_HEADERS")]
    trust_forwarded_headers: bool,

    /// JSON file mapping provider hosts to OAuth2 client key and secret
    #[arg(long, env = "ESGF_OAUTH2_SECRET_FILE")]
    oauth2_secret_file: String,

    /// JSON list of known identity providers for the login page
    #[arg(long, env = "ESGF_KNOWN_PROVIDERS")]
    known_providers_file: Option<String>,

    /// Hosts accepted in absolute return URLs
    #[arg(long, env = "ESGF_ALLOWED_REDIRECT_HOSTS", value_delimiter = ',')]
    allowed_redirect_hosts: Vec<String>,

    /// Tokens granted to every session ticket
    #[arg(long, env = "ESGF_SESSION_TOKENS", value_delimiter = ',')]
    session_tokens: Vec<String>,

    /// Public base URL of this service, used for the OAuth2 redirect URI
    #[arg(long, default_value = "http://localhost:8000", env = "ESGF_PUBLIC_URL")]
    public_url: String,

    /// Timeout for identity provider discovery requests
    #[arg(long, default_value = "10", env = "ESGF_DISCOVERY_TIMEOUT_SECS")]
    discovery_timeout_secs: u64,
}

fn session_max_age(secs: Option<u64>) -> Result<Option<Duration>> {
    secs.map(|secs| {
        i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .with_context(|| format!("ESGF_SESSION_MAX_AGE_SECS out of range: {secs}"))
    })
    .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let keys = SecretKeyRing::from_base64(&args.secret_key, args.previous_secret_keys.as_deref())
        .context("Invalid ESGF_SECRET_KEY / ESGF_PREVIOUS_SECRET_KEYS")?;
    let state_secret = keys.current().as_bytes().to_vec();

    let max_age = session_max_age(args.session_max_age_secs)?;
    let session_config = SessionConfig {
        keys,
        cookie: CookiePolicy {
            name: args.session_cookie_name.clone(),
            domain: args.cookie_domain.clone(),
            secure: args.secure_cookies,
            max_age,
            ..Default::default()
        },
        max_age,
        address_binding: if args.bind_client_address {
            AddressBinding::Enforced
        } else {
            AddressBinding::Disabled
        },
    };
    let sessions = Arc::new(SessionCookieManager::new(session_config));

    let credentials = JsonCredentialStore::from_file(&args.oauth2_secret_file)
        .context("Failed to load OAuth2 client credentials")?;
    info!(
        "loaded OAuth2 credentials for {} providers",
        credentials.len()
    );

    let known_providers: Arc<dyn KnownProviders> = Arc::new(match &args.known_providers_file {
        Some(path) => JsonKnownProviders::from_file_or_empty(path),
        None => JsonKnownProviders::default(),
    });

    let public_url = url::Url::parse(&args.public_url).context("Invalid ESGF_PUBLIC_URL")?;
    let mut allowed_redirect_hosts = args.allowed_redirect_hosts.clone();
    if let Some(host) = public_url.host_str() {
        allowed_redirect_hosts.push(host.to_string());
    }

    let discovery = HttpProviderDiscovery::new(std::time::Duration::from_secs(
        args.discovery_timeout_secs,
    ))?;
    let controller = AuthFlowController::new(Arc::new(discovery), Arc::new(credentials), sessions)
        .with_tokens(args.session_tokens.clone())
        .with_allowed_redirect_hosts(allowed_redirect_hosts);

    let redirect_uri = format!(
        "{}{CALLBACK_PATH}",
        args.public_url.trim_end_matches('/')
    );
    let handshake = OidcHandshake::new(&redirect_uri)
        .map_err(|e| anyhow::anyhow!("Failed to configure OAuth2 login: {e}"))?;

    let state = AppState {
        controller: Arc::new(controller),
        handshake: Arc::new(handshake),
        known_providers,
        views: Arc::new(Views::new()?),
        settings: Arc::new(ServerSettings {
            state_secret,
            return_query_name: args.return_query_name.clone(),
            secure_cookies: args.secure_cookies,
            cookie_domain: args.cookie_domain.clone(),
            trust_forwarded_headers: args.trust_forwarded_headers,
        }),
    };

    let app = build_router(state).layer(TimeoutLayer::new(std::time::Duration::from_secs(60)));
    let app = NormalizePathLayer::trim_trailing_slash().layer(app);

    let addr = format!("0.0.0.0:{}", args.port);
    info!("ESGF auth server starting on {addr}");
    info!("OAuth2 redirect URI: {redirect_uri}");
    if !args.secure_cookies {
        tracing::warn!("session cookies are sent without the Secure attribute");
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service_with_connect_info::<SocketAddr>(
            app,
        ),
    )
    .await?;

    Ok(())
}
