use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use chrono::{Duration, Utc};
use esgf_auth::credentials::{ClientCredential, CredentialStore};
use esgf_auth::discovery::{Discovery, DiscoveryError, ProtocolKind, ProviderDiscovery};
use esgf_auth::flow::AuthFlowController;
use esgf_auth::flow_state::{FlowState, sign_state};
use esgf_auth::handshake::OidcHandshake;
use esgf_auth::providers::{JsonKnownProviders, KnownProvider};
use esgf_auth::secret::{SecretKey, SecretKeyRing};
use esgf_auth::session_cookie::{SessionConfig, SessionCookieManager};
use esgf_auth_srv::build_router;
use esgf_auth_srv::handlers::FLOW_COOKIE;
use esgf_auth_srv::state::{AppState, ServerSettings};
use esgf_auth_srv::views::Views;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STATE_SECRET: &[u8] = b"route-test-state-secret";
const OAUTH_IDENTITY: &str = "https://oauth.example/esgf-idp/openid/alice";
const OPENID_IDENTITY: &str = "https://openid.example/esgf-idp/openid/bob";

struct StaticDiscovery {
    results: HashMap<String, Discovery>,
}

#[async_trait]
impl ProviderDiscovery for StaticDiscovery {
    async fn discover(&self, claimed_identity: &str) -> Result<Discovery, DiscoveryError> {
        self.results
            .get(claimed_identity)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(claimed_identity.to_string()))
    }
}

struct StaticCredentials;

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn lookup(&self, provider_host: &str) -> Option<ClientCredential> {
        (provider_host == "oauth.example").then(|| ClientCredential {
            key: "client-id".to_string(),
            secret: "client-secret".to_string(),
        })
    }
}

struct TestApp {
    router: Router,
    sessions: Arc<SessionCookieManager>,
}

fn test_app(oauth_issuer: &str) -> TestApp {
    let mut results = HashMap::new();
    results.insert(
        OAUTH_IDENTITY.to_string(),
        Discovery {
            protocol: ProtocolKind::OAuth2,
            endpoint: oauth_issuer.to_string(),
        },
    );
    results.insert(
        OPENID_IDENTITY.to_string(),
        Discovery {
            protocol: ProtocolKind::OpenId,
            endpoint: "https://openid.example/esgf-idp/idp/openidServer.htm".to_string(),
        },
    );

    let keys = SecretKeyRing::new(SecretKey::new(b"route-test-secret".to_vec()).unwrap());
    let sessions = Arc::new(SessionCookieManager::new(SessionConfig::new(keys)));
    let controller = AuthFlowController::new(
        Arc::new(StaticDiscovery { results }),
        Arc::new(StaticCredentials),
        sessions.clone(),
    )
    .with_allowed_redirect_hosts(vec!["data.example.org".to_string()]);

    let state = AppState {
        controller: Arc::new(controller),
        handshake: Arc::new(
            OidcHandshake::new("http://localhost:8000/esg-orp/callback").unwrap(),
        ),
        known_providers: Arc::new(JsonKnownProviders::new(vec![KnownProvider {
            name: "Example IdP".to_string(),
            url: "https://oauth.example/esgf-idp/openid/".to_string(),
        }])),
        views: Arc::new(Views::new().unwrap()),
        settings: Arc::new(ServerSettings {
            state_secret: STATE_SECRET.to_vec(),
            return_query_name: "redirect".to_string(),
            secure_cookies: false,
            cookie_domain: None,
            trust_forwarded_headers: false,
        }),
    };

    TestApp {
        router: build_router(state),
        sessions,
    }
}

fn session_cookie_header(app: &TestApp, subject: &str) -> String {
    let value = app.sessions.mint(subject, "", &[], "").unwrap();
    format!("{}={value}", app.sessions.cookie_name())
}

fn set_cookies(response: &axum::response::Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|value| value.to_str().unwrap().to_string())
        .collect()
}

/// `name=value` of the cookie set by the response, without attributes.
fn set_cookie_pair(response: &axum::response::Response, name: &str) -> Option<String> {
    set_cookies(response)
        .into_iter()
        .find(|c| c.starts_with(&format!("{name}=")))
        .map(|c| c.split(';').next().unwrap_or_default().to_string())
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

/// RSA key signing the ID tokens of the mock provider
struct TestKeyPair {
    encoding_key: EncodingKey,
    jwk: serde_json::Value,
}

const TEST_KEY_ID: &str = "test-key";

impl TestKeyPair {
    fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let private_key =
            RsaPrivateKey::new(&mut rng, 2048).expect("failed to generate RSA private key");
        let private_pem = private_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .expect("failed to encode private key as PEM");
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .expect("failed to create encoding key");

        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let jwk = serde_json::json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": TEST_KEY_ID,
            "n": b64.encode(private_key.n().to_bytes_be()),
            "e": b64.encode(private_key.e().to_bytes_be()),
        });

        Self { encoding_key, jwk }
    }

    fn id_token(&self, issuer: &str, subject: &str, nonce: &str) -> String {
        let now = Utc::now();
        let claims = serde_json::json!({
            "iss": issuer,
            "sub": subject,
            "aud": "client-id",
            "nonce": nonce,
            "iat": now.timestamp(),
            "exp": (now + Duration::hours(1)).timestamp(),
        });
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(TEST_KEY_ID.to_string());
        encode(&header, &claims, &self.encoding_key).expect("failed to encode token")
    }
}

/// Serves OIDC discovery metadata and the given key set.
async fn mount_provider(server: &MockServer, keys: Vec<serde_json::Value>) {
    let issuer = server.uri();
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/jwks"),
            "response_types_supported": ["code"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"keys": keys})))
        .mount(server)
        .await;
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn login_post(identity: &str, cookie: Option<&str>) -> Request<Body> {
    let body: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("openid_identifier", identity)
        .finish();
    let mut request = Request::builder()
        .method("POST")
        .uri("/esg-orp/home.htm")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    request.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("healthy"));
}

#[tokio::test]
async fn test_home_shows_login_page_and_sets_flow_cookie() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(
            Request::get("/esg-orp/home.htm?redirect=%2Fthredds%2FfileServer%2Fa.nc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookies = set_cookies(&response);
    assert!(
        cookies
            .iter()
            .any(|c| c.starts_with(&format!("{FLOW_COOKIE}=")))
    );
    let html = body_string(response).await;
    assert!(html.contains("name=\"openid_identifier\""));
    assert!(html.contains("Example IdP"));
    assert!(html.contains("/thredds/fileServer/a.nc"));
}

#[tokio::test]
async fn test_home_with_session_and_return_url_redirects() {
    let app = test_app("https://oauth.example");
    let cookie = session_cookie_header(&app, OAUTH_IDENTITY);
    let response = app
        .router
        .oneshot(
            Request::get("/esg-orp/home.htm?redirect=%2Fthredds%2FfileServer%2Fa.nc")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/thredds/fileServer/a.nc"
    );
    let cookies = set_cookies(&response);
    assert!(cookies.iter().any(|c| c.starts_with("esgf_session=")));
}

#[tokio::test]
async fn test_home_with_session_ignores_foreign_return_url() {
    let app = test_app("https://oauth.example");
    let cookie = session_cookie_header(&app, OAUTH_IDENTITY);
    let response = app
        .router
        .oneshot(
            Request::get("/esg-orp/home.htm?redirect=https%3A%2F%2Fevil.example%2F")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert!(html.contains("You are logged in as"));
    assert!(html.contains("https://oauth.example/esgf-idp/openid/alice"));
}

#[tokio::test]
async fn test_home_with_tampered_session_shows_login() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(
            Request::get("/esg-orp/home.htm")
                .header(header::COOKIE, "esgf_session=AAAA")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("name=\"openid_identifier\""));
}

#[tokio::test]
async fn test_login_not_recognized() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(login_post("https://nowhere.example/openid/dave", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert!(html.contains("Unable to process claimed identity"));
    assert!(html.contains("https://nowhere.example/openid/dave"));
}

#[tokio::test]
async fn test_login_openid2_is_unsupported() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(login_post(OPENID_IDENTITY, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("does not support"));
}

#[tokio::test]
async fn test_login_empty_identity() {
    let app = test_app("https://oauth.example");
    let response = app.router.oneshot(login_post("   ", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("Please enter your OpenID"));
}

#[tokio::test]
async fn test_login_oauth2_redirects_to_provider() {
    let server = MockServer::start().await;
    let issuer = server.uri();
    mount_provider(&server, vec![]).await;

    let app = test_app(&issuer);
    let response = app
        .router
        .oneshot(login_post(OAUTH_IDENTITY, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = location(&response);
    assert!(location.starts_with(&format!("{issuer}/authorize?")));
    assert!(location.contains("client_id=client-id"));
    assert!(location.contains("code_challenge="));
    assert!(location.contains("state="));
    assert!(set_cookie_pair(&response, FLOW_COOKIE).is_some());
}

#[tokio::test]
async fn test_oauth2_login_returns_to_thredds_with_session() {
    let server = MockServer::start().await;
    let issuer = server.uri();
    let keypair = TestKeyPair::generate();
    mount_provider(&server, vec![keypair.jwk.clone()]).await;
    let app = test_app(&issuer);

    // redirected here by the THREDDS filter
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/esg-orp/home.htm?redirect=%2Fthredds%2FfileServer%2Fx.nc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let flow_cookie = set_cookie_pair(&response, FLOW_COOKIE).expect("flow cookie");

    // identity submitted on the login page
    let response = app
        .router
        .clone()
        .oneshot(login_post(OAUTH_IDENTITY, Some(&flow_cookie)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let flow_cookie = set_cookie_pair(&response, FLOW_COOKIE).expect("flow cookie");
    let authorize = url::Url::parse(&location(&response)).unwrap();
    let params: HashMap<String, String> = authorize.query_pairs().into_owned().collect();
    let returned_state = params.get("state").expect("state parameter");
    let nonce = params.get("nonce").expect("nonce parameter");

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "id_token": keypair.id_token(&issuer, OAUTH_IDENTITY, nonce),
        })))
        .expect(1)
        .mount(&server)
        .await;

    // provider sends the browser back
    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("code", "authorization-code")
        .append_pair("state", returned_state)
        .finish();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/esg-orp/callback?{query}"))
                .header(header::COOKIE, &flow_cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), "/thredds/fileServer/x.nc");

    let session = set_cookie_pair(&response, app.sessions.cookie_name()).expect("session cookie");
    let value = session
        .strip_prefix(&format!("{}=", app.sessions.cookie_name()))
        .unwrap();
    let ticket = app.sessions.parse(value, None, None).expect("valid ticket");
    assert_eq!(ticket.subject, OAUTH_IDENTITY);

    assert!(
        set_cookies(&response)
            .iter()
            .any(|c| c.starts_with(&format!("{FLOW_COOKIE}=;")) && c.contains("Max-Age=0")),
        "flow cookie should be cleared"
    );
}

#[tokio::test]
async fn test_callback_with_unknown_signing_key_is_rejected() {
    let server = MockServer::start().await;
    let issuer = server.uri();
    let keypair = TestKeyPair::generate();
    mount_provider(&server, vec![]).await;
    let app = test_app(&issuer);

    let response = app
        .router
        .clone()
        .oneshot(login_post(OAUTH_IDENTITY, None))
        .await
        .unwrap();
    let flow_cookie = set_cookie_pair(&response, FLOW_COOKIE).expect("flow cookie");
    let authorize = url::Url::parse(&location(&response)).unwrap();
    let params: HashMap<String, String> = authorize.query_pairs().into_owned().collect();

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-token",
            "token_type": "Bearer",
            "id_token": keypair.id_token(&issuer, OAUTH_IDENTITY, &params["nonce"]),
        })))
        .mount(&server)
        .await;

    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("code", "authorization-code")
        .append_pair("state", &params["state"])
        .finish();
    let response = app
        .router
        .oneshot(
            Request::get(format!("/esg-orp/callback?{query}"))
                .header(header::COOKIE, &flow_cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookie_pair(&response, app.sessions.cookie_name()).is_none());
}

#[tokio::test]
async fn test_callback_without_state_is_rejected() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(
            Request::get("/esg-orp/callback?code=abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_with_provider_error() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(
            Request::get("/esg-orp/callback?error=access_denied")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_callback_with_forged_state_is_rejected() {
    let app = test_app("https://oauth.example");
    let forged = FlowState {
        nonce: "nonce".to_string(),
        claimed_identity: OAUTH_IDENTITY.to_string(),
        return_to: None,
        issuer: None,
        pkce_verifier: None,
    };
    let forged = sign_state(&forged, b"some-other-secret").unwrap();
    let response = app
        .router
        .oneshot(
            Request::get(format!("/esg-orp/callback?code=abc&state={forged}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_requires_matching_flow_cookie() {
    let app = test_app("https://oauth.example");
    let returned = FlowState {
        nonce: "nonce-a".to_string(),
        claimed_identity: OAUTH_IDENTITY.to_string(),
        return_to: None,
        issuer: Some("https://oauth.example".to_string()),
        pkce_verifier: None,
    };
    let cookie_flow = FlowState {
        nonce: "nonce-b".to_string(),
        pkce_verifier: Some("verifier".to_string()),
        ..returned.clone()
    };
    let returned = sign_state(&returned, STATE_SECRET).unwrap();
    let cookie_flow = sign_state(&cookie_flow, STATE_SECRET).unwrap();

    let response = app
        .router
        .oneshot(
            Request::get(format!("/esg-orp/callback?code=abc&state={returned}"))
                .header(header::COOKIE, format!("{FLOW_COOKIE}={cookie_flow}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_thredds_without_session_links_to_login() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(
            Request::get("/thredds/fileServer/cmip5/clt.nc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert!(html.contains("Authenticate"));
    assert!(html.contains("%2Fthredds%2FfileServer%2Fcmip5%2Fclt.nc"));
}

#[tokio::test]
async fn test_thredds_login_link_keeps_query_string() {
    let app = test_app("https://oauth.example");
    let response = app
        .router
        .oneshot(
            Request::get("/thredds/fileServer/cmip5/clt.nc?service=dap&var=clt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert!(html.contains("%2Fthredds%2FfileServer%2Fcmip5%2Fclt.nc%3Fservice%3Ddap%26var%3Dclt"));
}

#[tokio::test]
async fn test_thredds_with_session_shows_ticket() {
    let app = test_app("https://oauth.example");
    let cookie = session_cookie_header(&app, OAUTH_IDENTITY);
    let response = app
        .router
        .oneshot(
            Request::get("/thredds/fileServer/cmip5/clt.nc")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    assert!(html.contains(OAUTH_IDENTITY));
    assert!(!html.contains("Authenticate"));
}
