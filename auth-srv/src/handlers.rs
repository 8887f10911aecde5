//! Login, callback and relying-party test routes

use crate::errors::AuthApiError;
use crate::observability::client_ip;
use crate::state::AppState;
use crate::views::{HomePage, ThreddsPage, TicketView};
use axum::Form;
use axum::Json;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::Uri;
use axum::http::request::Parts;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use esgf_auth::flow::{LoginDecision, LoginOutcome, SessionState};
use esgf_auth::flow_state::{FlowState, generate_nonce, nonce_matches, sign_state, verify_state};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use tracing::{info, warn};

pub const HOME_PATH: &str = "/esg-orp/home.htm";
pub const CALLBACK_PATH: &str = "/esg-orp/callback";

/// Signed login flow state, kept for the duration of one login
pub const FLOW_COOKIE: &str = "esgf_login_flow";
const FLOW_COOKIE_MAX_AGE_SECS: i64 = 600;

/// Address of the client, as used for ticket binding
pub struct ClientAddress(pub String);

impl FromRequestParts<AppState> for ClientAddress {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(ClientAddress(client_ip(
            &parts.headers,
            &parts.extensions,
            state.settings.trust_forwarded_headers,
        )))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub openid_identifier: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

fn flow_cookie(value: String, state: &AppState) -> Cookie<'static> {
    let mut cookie = Cookie::build((FLOW_COOKIE, value))
        .http_only(true)
        .secure(state.settings.secure_cookies)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(FLOW_COOKIE_MAX_AGE_SECS));

    if let Some(domain) = &state.settings.cookie_domain {
        cookie = cookie.domain(domain.clone());
    }

    cookie.build()
}

fn clear_flow_cookie(state: &AppState) -> Cookie<'static> {
    let mut cookie = Cookie::build((FLOW_COOKIE, ""))
        .http_only(true)
        .secure(state.settings.secure_cookies)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(0));

    if let Some(domain) = &state.settings.cookie_domain {
        cookie = cookie.domain(domain.clone());
    }

    cookie.build()
}

fn new_flow_state(return_to: Option<String>) -> FlowState {
    FlowState {
        nonce: generate_nonce(),
        claimed_identity: String::new(),
        return_to,
        issuer: None,
        pkce_verifier: None,
    }
}

fn read_flow_state(jar: &CookieJar, state: &AppState) -> Option<FlowState> {
    let cookie = jar.get(FLOW_COOKIE)?;
    match verify_state(cookie.value(), &state.settings.state_secret) {
        Ok(flow) => Some(flow),
        Err(e) => {
            warn!("login flow cookie rejected: {e}");
            None
        }
    }
}

fn signed_flow_cookie(flow: &FlowState, state: &AppState) -> Result<Cookie<'static>, AuthApiError> {
    let signed = sign_state(flow, &state.settings.state_secret)
        .map_err(|e| AuthApiError::Internal(format!("Failed to sign flow state: {e}")))?;
    Ok(flow_cookie(signed, state))
}

fn render_home(state: &AppState, page: HomePage) -> Result<Html<String>, AuthApiError> {
    state
        .views
        .home(&page)
        .map(Html)
        .map_err(|e| AuthApiError::Internal(format!("{e}")))
}

/// Login page, keeping the flow state (and its return URL) in the flow cookie.
fn login_page(
    state: &AppState,
    jar: CookieJar,
    flow: &FlowState,
    message: Option<String>,
) -> Result<Response, AuthApiError> {
    let cookie = signed_flow_cookie(flow, state)?;
    let html = render_home(
        state,
        HomePage {
            known_providers: state.known_providers.list(),
            redirect: flow.return_to.clone(),
            message,
            ..Default::default()
        },
    )?;
    Ok((jar.add(cookie), html).into_response())
}

fn login_response(
    state: &AppState,
    jar: CookieJar,
    outcome: LoginOutcome,
) -> Result<Response, AuthApiError> {
    match outcome {
        LoginOutcome::Redirect { location, cookie } => Ok((
            jar.add(cookie).add(clear_flow_cookie(state)),
            Redirect::temporary(&location),
        )
            .into_response()),
        LoginOutcome::Home { subject, cookie } => {
            let html = render_home(
                state,
                HomePage {
                    openid_identifier: Some(subject),
                    ..Default::default()
                },
            )?;
            Ok((jar.add(cookie).add(clear_flow_cookie(state)), html).into_response())
        }
    }
}

/// GET /esg-orp/home.htm
///
/// Requested directly, or redirected here by the THREDDS authentication filter
/// with the return URL in the configured query parameter.
#[tracing::instrument(skip_all)]
pub async fn home_get(
    State(state): State<AppState>,
    ClientAddress(client_address): ClientAddress,
    jar: CookieJar,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AuthApiError> {
    let requested = params.get(&state.settings.return_query_name);
    let return_to = state
        .controller
        .accept_return_url(requested.map(String::as_str));

    let session_cookie = jar
        .get(state.controller.sessions().cookie_name())
        .map(|cookie| cookie.value().to_string());

    match state
        .controller
        .authenticate(session_cookie.as_deref(), &client_address)
    {
        SessionState::Authenticated(ticket) => match return_to {
            Some(return_to) => {
                let outcome = state
                    .controller
                    .complete_login(&ticket.subject, &client_address, Some(&return_to))
                    .map_err(|e| AuthApiError::Internal(format!("{e}")))?;
                login_response(&state, jar, outcome)
            }
            None => {
                let html = render_home(
                    &state,
                    HomePage {
                        openid_identifier: Some(ticket.subject),
                        ..Default::default()
                    },
                )?;
                Ok(html.into_response())
            }
        },
        SessionState::Unauthenticated => {
            let flow = new_flow_state(return_to);
            login_page(&state, jar, &flow, None)
        }
    }
}

/// POST /esg-orp/home.htm - start a login for the submitted identity
#[tracing::instrument(skip_all)]
pub async fn home_post(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response, AuthApiError> {
    let mut flow = read_flow_state(&jar, &state).unwrap_or_else(|| new_flow_state(None));
    let identity = form.openid_identifier.trim().to_string();
    if identity.is_empty() {
        return login_page(
            &state,
            jar,
            &flow,
            Some("Please enter your OpenID.".to_string()),
        );
    }
    flow.claimed_identity = identity.clone();

    match state.controller.begin_login(&identity).await {
        LoginDecision::OAuth2 {
            issuer, credential, ..
        } => {
            let auth_url = match state
                .handshake
                .authorization_url(&issuer, &credential, &mut flow, &state.settings.state_secret)
                .await
            {
                Ok(auth_url) => auth_url,
                Err(e) => {
                    warn!("could not start OAuth2 login for {identity}: {e}");
                    let message = format!(
                        "ERROR: Unable to contact the identity provider of '{identity}'. \
                         Please try again later."
                    );
                    return login_page(&state, jar, &flow, Some(message));
                }
            };
            info!("redirecting {identity} to {issuer}");
            let cookie = signed_flow_cookie(&flow, &state)?;
            Ok((jar.add(cookie), Redirect::to(auth_url.as_str())).into_response())
        }
        LoginDecision::OpenId { endpoint, .. } => {
            warn!("OpenID 2.0 login requested for {identity} at {endpoint}");
            let message = format!(
                "ERROR: '{identity}' uses OpenID 2.0, which this server does not support. \
                 Please use an OAuth2 identity provider."
            );
            login_page(&state, jar, &flow, Some(message))
        }
        LoginDecision::NotRecognized { .. } => {
            let message = format!(
                "ERROR: Unable to process claimed identity '{identity}'. \
                 No OpenID/OAuth2/OIDC service discovered. \
                 Please contact the administrator."
            );
            login_page(&state, jar, &flow, Some(message))
        }
    }
}

/// GET /esg-orp/callback - OAuth2 authorization code callback
#[tracing::instrument(skip_all)]
pub async fn callback(
    State(state): State<AppState>,
    ClientAddress(client_address): ClientAddress,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, AuthApiError> {
    if let Some(error) = query.error {
        return Err(AuthApiError::ProviderError(format!(
            "{error}: {}",
            query.error_description.unwrap_or_default()
        )));
    }
    let (Some(code), Some(returned_state)) = (query.code, query.state) else {
        return Err(AuthApiError::InvalidState);
    };

    let returned = verify_state(&returned_state, &state.settings.state_secret).map_err(|e| {
        warn!("callback state rejected: {e}");
        AuthApiError::InvalidState
    })?;
    let flow = read_flow_state(&jar, &state).ok_or(AuthApiError::InvalidState)?;
    if !nonce_matches(&flow, &returned.nonce) || flow.claimed_identity != returned.claimed_identity
    {
        warn!("callback state does not match the login flow cookie");
        return Err(AuthApiError::InvalidState);
    }

    let credential = state
        .controller
        .credential_for(&flow.claimed_identity)
        .await
        .ok_or_else(|| {
            AuthApiError::Internal(format!(
                "no OAuth2 credential for {}",
                flow.claimed_identity
            ))
        })?;

    let subject = state
        .handshake
        .complete(&credential, &code, &flow)
        .await
        .map_err(|e| {
            warn!("OAuth2 login failed for {}: {e}", flow.claimed_identity);
            AuthApiError::TokenExchangeFailed
        })?;

    // ESGF identity providers issue the user's OpenID URL as `sub`, which is
    // the identity THREDDS authorizes on. The typed identity is never trusted.
    let outcome = state
        .controller
        .complete_login(&subject, &client_address, flow.return_to.as_deref())
        .map_err(|e| AuthApiError::Internal(format!("{e}")))?;
    login_response(&state, jar, outcome)
}

/// GET /thredds/{*path}
///
/// Behaves like the THREDDS authentication filter: shows the ticket carried by
/// the session cookie, or a link to log in and come back here.
#[tracing::instrument(skip_all)]
pub async fn thredds(
    State(state): State<AppState>,
    ClientAddress(client_address): ClientAddress,
    jar: CookieJar,
    uri: Uri,
) -> Result<Html<String>, AuthApiError> {
    let redirect = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |pq| pq.as_str())
        .to_string();
    let login_url = format!(
        "{HOME_PATH}?{}={}",
        state.settings.return_query_name,
        url::form_urlencoded::byte_serialize(redirect.as_bytes()).collect::<String>()
    );

    let session_cookie_name = state.controller.sessions().cookie_name().to_string();
    let session_cookie = jar
        .get(&session_cookie_name)
        .map(|cookie| cookie.value().to_string());
    let ticket = match state
        .controller
        .authenticate(session_cookie.as_deref(), &client_address)
    {
        SessionState::Authenticated(ticket) => Some(TicketView::from(&ticket)),
        SessionState::Unauthenticated => None,
    };

    state
        .views
        .thredds(&ThreddsPage {
            session_cookie_name,
            redirect,
            login_url,
            session_cookie,
            ticket,
        })
        .map(Html)
        .map_err(|e| AuthApiError::Internal(format!("{e}")))
}

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}
