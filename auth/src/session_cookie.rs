//! Session cookies carrying signed tickets
//!
//! The cookie value is the base64url encoding (no padding) of the ticket wire
//! bytes. Cookie attributes are configuration: deployments behind a
//! TLS-terminating reverse proxy and direct deployments need different
//! `Secure` and `Domain` settings.

use crate::error::TicketError;
use crate::secret::SecretKeyRing;
use crate::ticket::{Ticket, TicketCodec};
use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::Engine;
use chrono::Duration;

/// Cookie name used when none is configured.
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "esgf_session";

/// Longest cookie value accepted for decoding.
pub const MAX_COOKIE_VALUE_LEN: usize = 4096;

/// Whether tickets are bound to the address of the client that logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressBinding {
    /// Tickets carry the client address and are rejected from other addresses
    Enforced,
    /// Tickets carry an empty address and address checks are skipped
    Disabled,
}

/// Attributes of the `Set-Cookie` header
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    pub name: String,
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// `Max-Age` attribute; `None` makes it a browser-session cookie
    pub max_age: Option<Duration>,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self {
            name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
            domain: None,
            path: "/".to_string(),
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            max_age: None,
        }
    }
}

/// Everything the session layer needs, passed explicitly at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub keys: SecretKeyRing,
    pub cookie: CookiePolicy,
    /// Tickets older than this are rejected by [`SessionCookieManager::validate`]
    pub max_age: Option<Duration>,
    pub address_binding: AddressBinding,
}

impl SessionConfig {
    pub fn new(keys: SecretKeyRing) -> Self {
        Self {
            keys,
            cookie: CookiePolicy::default(),
            max_age: None,
            address_binding: AddressBinding::Disabled,
        }
    }
}

/// Mints and validates session cookie values.
#[derive(Debug, Clone)]
pub struct SessionCookieManager {
    codec: TicketCodec,
    cookie: CookiePolicy,
    max_age: Option<Duration>,
    address_binding: AddressBinding,
}

impl SessionCookieManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            codec: TicketCodec::new(config.keys),
            cookie: config.cookie,
            max_age: config.max_age,
            address_binding: config.address_binding,
        }
    }

    pub fn codec(&self) -> &TicketCodec {
        &self.codec
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie.name
    }

    pub fn address_binding(&self) -> AddressBinding {
        self.address_binding
    }

    /// Address to bind a new ticket to under the configured policy.
    pub fn bound_address<'a>(&self, client_address: &'a str) -> &'a str {
        match self.address_binding {
            AddressBinding::Enforced => client_address,
            AddressBinding::Disabled => "",
        }
    }

    /// Mints a ticket and returns it as a cookie value.
    pub fn mint(
        &self,
        subject: &str,
        client_address: &str,
        tokens: &[&str],
        user_data: &str,
    ) -> Result<String, TicketError> {
        let wire = self
            .codec
            .mint(subject, client_address, tokens, user_data)?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(wire))
    }

    /// Decodes a cookie value and validates the ticket it carries.
    ///
    /// Ticket failures are propagated unchanged; malformed base64url yields
    /// [`TicketError::DecodeError`].
    pub fn parse(
        &self,
        cookie_value: &str,
        expected_client_address: Option<&str>,
        max_age: Option<Duration>,
    ) -> Result<Ticket, TicketError> {
        let wire = decode_cookie_value(cookie_value)?;
        self.codec.parse(&wire, expected_client_address, max_age)
    }

    /// Same as [`parse`](Self::parse) with an explicit current time.
    pub fn parse_at(
        &self,
        cookie_value: &str,
        expected_client_address: Option<&str>,
        max_age: Option<Duration>,
        now: i64,
    ) -> Result<Ticket, TicketError> {
        let wire = decode_cookie_value(cookie_value)?;
        self.codec
            .parse_at(&wire, expected_client_address, max_age, now)
    }

    /// Validates a cookie presented by `client_address` with the configured
    /// max age and binding policy.
    pub fn validate(&self, cookie_value: &str, client_address: &str) -> Result<Ticket, TicketError> {
        let expected = match self.address_binding {
            AddressBinding::Enforced => Some(client_address),
            AddressBinding::Disabled => None,
        };
        self.parse(cookie_value, expected, self.max_age)
    }

    /// Builds the session cookie for a minted value.
    pub fn session_cookie(&self, value: String) -> Cookie<'static> {
        let max_age = self
            .cookie
            .max_age
            .map(|max_age| time::Duration::seconds(max_age.num_seconds()));
        self.build_cookie(value, max_age)
    }

    /// Builds an expired cookie that clears the session.
    pub fn removal_cookie(&self) -> Cookie<'static> {
        self.build_cookie(String::new(), Some(time::Duration::seconds(0)))
    }

    fn build_cookie(&self, value: String, max_age: Option<time::Duration>) -> Cookie<'static> {
        let mut cookie = Cookie::build((self.cookie.name.clone(), value))
            .http_only(self.cookie.http_only)
            .secure(self.cookie.secure)
            .same_site(self.cookie.same_site)
            .path(self.cookie.path.clone());

        if let Some(max_age) = max_age {
            cookie = cookie.max_age(max_age);
        }
        if let Some(domain) = &self.cookie.domain {
            cookie = cookie.domain(domain.clone());
        }

        cookie.build()
    }
}

fn decode_cookie_value(cookie_value: &str) -> Result<Vec<u8>, TicketError> {
    if cookie_value.len() > MAX_COOKIE_VALUE_LEN {
        return Err(TicketError::DecodeError(format!(
            "cookie value exceeds {MAX_COOKIE_VALUE_LEN} bytes"
        )));
    }
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cookie_value.as_bytes())
        .map_err(|e| TicketError::DecodeError(format!("{e}")))
}
