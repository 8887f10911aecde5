//! Session tickets and federated login for ESGF data nodes
//!
//! A user logs in against their home identity provider (OpenID 2.0 or
//! OAuth2/OIDC). Once the provider vouches for them, this crate mints a signed
//! session ticket and hands it to the browser as a cookie. The THREDDS
//! authentication filter, or any reverse proxy sharing the secret, validates
//! that cookie on every download without keeping server-side sessions.
//!
//! # Example: minting and validating a session cookie
//!
//! ```rust
//! use esgf_auth::secret::{SecretKey, SecretKeyRing};
//! use esgf_auth::session_cookie::{AddressBinding, SessionConfig, SessionCookieManager};
//!
//! # fn example() -> anyhow::Result<()> {
//! let keys = SecretKeyRing::new(SecretKey::new(b"shared-secret".to_vec())?);
//! let mut config = SessionConfig::new(keys);
//! config.address_binding = AddressBinding::Enforced;
//! let sessions = SessionCookieManager::new(config);
//!
//! let value = sessions.mint("https://idp.example/esgf-idp/openid/alice", "203.0.113.5", &[], "")?;
//! let ticket = sessions.validate(&value, "203.0.113.5")?;
//! assert_eq!(ticket.subject, "https://idp.example/esgf-idp/openid/alice");
//! assert!(sessions.validate(&value, "198.51.100.7").is_err());
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

/// Typed errors
pub mod error;

/// Shared secrets and key rotation
pub mod secret;

/// Signed ticket wire format
pub mod ticket;

/// Session cookie values and attributes
pub mod session_cookie;

/// OAuth2 client credentials per provider
pub mod credentials;

/// Known identity providers list
pub mod providers;

/// Identity provider discovery
pub mod discovery;

/// Signed state carried through the login round trip
pub mod flow_state;

/// Return URL validation
pub mod url_validation;

/// OIDC authorization code login
pub mod handshake;

/// Login flow controller
pub mod flow;
