//! Login flow state signing and verification
//!
//! The state that must survive the federated round trip (claimed identity,
//! return URL, PKCE verifier, nonce) travels with the browser instead of in a
//! server-side session. It is signed with HMAC-SHA256 so that a user cannot
//! swap the return URL or the PKCE verifier between the start of the login and
//! the callback.
//!
//! # Format
//!
//! Signed state: `base64url(state_json).base64url(hmac_signature)`
//!
//! # Example
//!
//! ```rust
//! use esgf_auth::flow_state::{FlowState, sign_state, verify_state};
//!
//! let state = FlowState {
//!     nonce: "random-nonce".to_string(),
//!     claimed_identity: "https://idp.example/esgf-idp/openid/alice".to_string(),
//!     return_to: Some("https://data.example/thredds/fileServer/a.nc".to_string()),
//!     issuer: None,
//!     pkce_verifier: None,
//! };
//!
//! let secret = b"your-32-byte-secret-key-here!!!";
//! let signed = sign_state(&state, secret).expect("signing failed");
//!
//! let verified = verify_state(&signed, secret).expect("verification failed");
//! assert_eq!(verified.return_to, state.return_to);
//! ```

use anyhow::{Result, anyhow};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Domain separation between flow state signatures and session tickets, which
/// may share a secret.
const FLOW_STATE_CONTEXT: &[u8] = b"esgf-auth flow state v1\0";

/// State carried through the federated login round trip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowState {
    /// CSRF nonce, also stored in a short-lived cookie
    pub nonce: String,
    /// Identity the user typed on the login page
    pub claimed_identity: String,
    /// Where to send the user once the session cookie is set
    pub return_to: Option<String>,
    /// OIDC issuer selected by discovery, for the OAuth2 branch
    pub issuer: Option<String>,
    /// PKCE code verifier for the OAuth2 branch
    pub pkce_verifier: Option<String>,
}

/// Generates a random 32-byte nonce, base64url encoded.
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.r#gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Compares the nonce echoed by the browser cookie with the signed one.
pub fn nonce_matches(state: &FlowState, cookie_nonce: &str) -> bool {
    state.nonce.as_bytes().ct_eq(cookie_nonce.as_bytes()).into()
}

fn mac_for(secret: &[u8]) -> Result<HmacSha256> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| anyhow!("Failed to create HMAC: {e}"))?;
    mac.update(FLOW_STATE_CONTEXT);
    Ok(mac)
}

/// Sign flow state with HMAC-SHA256 to prevent tampering
///
/// Returns: base64url(state_json).base64url(hmac_signature)
pub fn sign_state(state: &FlowState, secret: &[u8]) -> Result<String> {
    let state_json = serde_json::to_string(state)?;

    let mut mac = mac_for(secret)?;
    mac.update(state_json.as_bytes());
    let signature = mac.finalize().into_bytes();

    let signed = format!(
        "{}.{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&state_json),
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(signature)
    );
    Ok(signed)
}

/// Verify and decode signed flow state
///
/// Validates the HMAC signature and returns the decoded state
pub fn verify_state(signed_state: &str, secret: &[u8]) -> Result<FlowState> {
    let parts: Vec<&str> = signed_state.split('.').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid state format: expected 2 parts, got {}",
            parts.len()
        ));
    }

    let state_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(parts[0])?;
    let signature_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(parts[1])?;

    let mut mac = mac_for(secret)?;
    mac.update(&state_bytes);
    mac.verify_slice(&signature_bytes)
        .map_err(|_| anyhow!("HMAC signature verification failed"))?;

    Ok(serde_json::from_slice(&state_bytes)?)
}
