//! Signed session tickets
//!
//! A ticket binds a verified subject to an issue time, a client address, a set
//! of tokens and an opaque user data string. It is authenticated with
//! HMAC-SHA256 under the shared secret.
//!
//! # Format
//!
//! ```text
//! wire  = mac[32] || body
//! body  = version:u8 || issued_at:u64be
//!      || field(client_address) || field(subject)
//!      || token_count:u16be || field(token)*
//!      || field(user_data)
//! field = len:u32be || utf8 bytes
//! mac   = HMAC-SHA256(secret, body)
//! ```
//!
//! Every variable-length field is length-prefixed, so no field value can move
//! a field boundary: a subject containing `!` or `,` stays a subject.
//!
//! # Example
//!
//! ```rust
//! use esgf_auth::secret::SecretKey;
//! use esgf_auth::ticket::TicketCodec;
//!
//! let codec = TicketCodec::new(SecretKey::new(b"k1".to_vec()).unwrap());
//! let wire = codec
//!     .mint("https://idp.example/alice", "203.0.113.5", &["read"], "")
//!     .expect("mint failed");
//! let ticket = codec
//!     .parse(&wire, Some("203.0.113.5"), None)
//!     .expect("parse failed");
//! assert_eq!(ticket.subject, "https://idp.example/alice");
//! assert_eq!(ticket.tokens, vec!["read".to_string()]);
//! ```

use crate::error::TicketError;
use crate::secret::{SecretKey, SecretKeyRing};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashSet;

type HmacSha256 = Hmac<Sha256>;

/// Length of the HMAC-SHA256 tag at the start of the wire bytes.
pub const MAC_LEN: usize = 32;

/// Largest accepted field, in bytes.
pub const MAX_FIELD_LEN: usize = 2048;

/// Largest accepted ticket, in bytes. Its base64url form fits in a 4KB cookie.
pub const MAX_TICKET_LEN: usize = 3072;

/// Largest number of tokens in a ticket.
pub const MAX_TOKENS: usize = 64;

const TICKET_VERSION: u8 = 1;

// version + issued_at
const HEADER_LEN: usize = 1 + 8;

/// An authenticated session record recovered from a valid ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Authenticated user, usually a provider-qualified OpenID URL
    pub subject: String,
    /// Issue time, seconds since the Unix epoch
    pub issued_at: i64,
    /// Address the ticket is bound to, empty when unbound
    pub client_address: String,
    /// Capability or role tokens, in mint order
    pub tokens: Vec<String>,
    /// Application-defined payload
    pub user_data: String,
    /// HMAC-SHA256 tag that authenticated the fields above
    pub mac: [u8; MAC_LEN],
}

impl Ticket {
    /// Tokens joined with `,`, the form relying parties expect in headers.
    pub fn tokens_string(&self) -> String {
        self.tokens.join(",")
    }

    /// Whether the ticket is bound to a client address.
    pub fn is_bound(&self) -> bool {
        !self.client_address.is_empty()
    }

    /// Age of the ticket at `now` (seconds since the Unix epoch).
    pub fn age_at(&self, now: i64) -> Duration {
        Duration::seconds(now.saturating_sub(self.issued_at))
    }
}

/// Mints and parses tickets with a fixed key ring.
///
/// The codec holds no mutable state and can be shared freely between request
/// handlers.
#[derive(Clone, Debug)]
pub struct TicketCodec {
    keys: SecretKeyRing,
}

impl TicketCodec {
    pub fn new(keys: impl Into<SecretKeyRing>) -> Self {
        Self { keys: keys.into() }
    }

    pub fn keys(&self) -> &SecretKeyRing {
        &self.keys
    }

    /// Mints a ticket issued now.
    pub fn mint(
        &self,
        subject: &str,
        client_address: &str,
        tokens: &[&str],
        user_data: &str,
    ) -> Result<Vec<u8>, TicketError> {
        self.mint_at(
            subject,
            client_address,
            tokens,
            user_data,
            Utc::now().timestamp(),
        )
    }

    /// Mints a ticket with an explicit issue time.
    pub fn mint_at(
        &self,
        subject: &str,
        client_address: &str,
        tokens: &[&str],
        user_data: &str,
        issued_at: i64,
    ) -> Result<Vec<u8>, TicketError> {
        if subject.is_empty() {
            return Err(TicketError::InvalidField("subject is empty".to_string()));
        }
        let issued_at = u64::try_from(issued_at).map_err(|_| {
            TicketError::InvalidField(format!("issue time {issued_at} is before the epoch"))
        })?;
        validate_tokens(tokens)?;

        let body = encode_body(issued_at, client_address, subject, tokens, user_data)?;
        if MAC_LEN + body.len() > MAX_TICKET_LEN {
            return Err(TicketError::InvalidField(format!(
                "ticket exceeds {MAX_TICKET_LEN} bytes"
            )));
        }

        let tag = compute_mac(self.keys.current(), &body)
            .ok_or_else(|| TicketError::InvalidField("secret key rejected by HMAC".to_string()))?;

        let mut wire = Vec::with_capacity(MAC_LEN + body.len());
        wire.extend_from_slice(&tag);
        wire.extend_from_slice(&body);
        Ok(wire)
    }

    /// Parses and validates a ticket against the current time.
    pub fn parse(
        &self,
        wire: &[u8],
        expected_client_address: Option<&str>,
        max_age: Option<Duration>,
    ) -> Result<Ticket, TicketError> {
        self.parse_at(
            wire,
            expected_client_address,
            max_age,
            Utc::now().timestamp(),
        )
    }

    /// Parses and validates a ticket as of `now` (seconds since the Unix epoch).
    ///
    /// Checks run in this order: framing, signature, field decoding, address
    /// binding, age. No field is decoded before the signature is verified.
    pub fn parse_at(
        &self,
        wire: &[u8],
        expected_client_address: Option<&str>,
        max_age: Option<Duration>,
        now: i64,
    ) -> Result<Ticket, TicketError> {
        if wire.len() < MAC_LEN + HEADER_LEN {
            return Err(malformed(format!(
                "ticket is {} bytes, expected at least {}",
                wire.len(),
                MAC_LEN + HEADER_LEN
            )));
        }
        if wire.len() > MAX_TICKET_LEN {
            return Err(malformed(format!("ticket exceeds {MAX_TICKET_LEN} bytes")));
        }

        let (tag, body) = wire.split_at(MAC_LEN);
        if !self.keys.accepted().any(|key| verify_mac(key, body, tag)) {
            return Err(TicketError::BadSignature);
        }

        let mut reader = Reader::new(body);
        let version = reader.u8()?;
        if version != TICKET_VERSION {
            return Err(malformed(format!("unsupported ticket version {version}")));
        }
        let issued_at = i64::try_from(reader.u64()?)
            .map_err(|_| malformed("issue time out of range".to_string()))?;
        let client_address = reader.field("client address")?;
        let subject = reader.field("subject")?;
        let token_count = reader.u16()? as usize;
        if token_count > MAX_TOKENS {
            return Err(malformed(format!("{token_count} tokens, at most {MAX_TOKENS}")));
        }
        let mut tokens = Vec::with_capacity(token_count);
        for _ in 0..token_count {
            tokens.push(reader.field("token")?);
        }
        let user_data = reader.field("user data")?;
        reader.finish()?;

        if let Some(expected) = expected_client_address
            && expected != client_address
        {
            return Err(TicketError::AddressMismatch {
                expected: expected.to_string(),
                bound: client_address,
            });
        }

        if let Some(max_age) = max_age
            && now.saturating_sub(issued_at) > max_age.num_seconds()
        {
            return Err(TicketError::Expired {
                issued_at,
                max_age: max_age.num_seconds(),
            });
        }

        let mac: [u8; MAC_LEN] = tag
            .try_into()
            .map_err(|_| malformed("truncated signature".to_string()))?;

        Ok(Ticket {
            subject,
            issued_at,
            client_address,
            tokens,
            user_data,
            mac,
        })
    }
}

fn malformed(reason: String) -> TicketError {
    TicketError::MalformedTicket(reason)
}

/// Tokens form an ordered set of simple identifiers.
fn validate_tokens(tokens: &[&str]) -> Result<(), TicketError> {
    if tokens.len() > MAX_TOKENS {
        return Err(TicketError::InvalidField(format!(
            "{} tokens, at most {MAX_TOKENS}",
            tokens.len()
        )));
    }
    let mut seen = HashSet::with_capacity(tokens.len());
    for token in tokens {
        if token.is_empty() {
            return Err(TicketError::InvalidField("empty token".to_string()));
        }
        if token
            .chars()
            .any(|c| c == ',' || c.is_whitespace() || c.is_control())
        {
            return Err(TicketError::InvalidField(format!(
                "token '{}' contains a separator, whitespace or control character",
                token.escape_debug()
            )));
        }
        if !seen.insert(*token) {
            return Err(TicketError::InvalidField(format!(
                "duplicate token '{token}'"
            )));
        }
    }
    Ok(())
}

fn encode_body(
    issued_at: u64,
    client_address: &str,
    subject: &str,
    tokens: &[&str],
    user_data: &str,
) -> Result<Vec<u8>, TicketError> {
    let mut body = Vec::with_capacity(
        HEADER_LEN
            + 2
            + 4 * (3 + tokens.len())
            + client_address.len()
            + subject.len()
            + user_data.len()
            + tokens.iter().map(|t| t.len()).sum::<usize>(),
    );
    body.push(TICKET_VERSION);
    body.extend_from_slice(&issued_at.to_be_bytes());
    put_field(&mut body, "client address", client_address)?;
    put_field(&mut body, "subject", subject)?;
    // bounded by MAX_TOKENS
    body.extend_from_slice(&(tokens.len() as u16).to_be_bytes());
    for token in tokens {
        put_field(&mut body, "token", token)?;
    }
    put_field(&mut body, "user data", user_data)?;
    Ok(body)
}

fn put_field(buf: &mut Vec<u8>, name: &str, value: &str) -> Result<(), TicketError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(TicketError::InvalidField(format!(
            "{name} exceeds {MAX_FIELD_LEN} bytes"
        )));
    }
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn compute_mac(key: &SecretKey, body: &[u8]) -> Option<[u8; MAC_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(body);
    let mut tag = [0u8; MAC_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Some(tag)
}

/// Constant-time tag comparison (`verify_slice` compares with `subtle`).
fn verify_mac(key: &SecretKey, body: &[u8], tag: &[u8]) -> bool {
    match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            mac.verify_slice(tag).is_ok()
        }
        Err(_) => false,
    }
}

/// Bounds-checked cursor over an authenticated ticket body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TicketError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed("truncated ticket".to_string()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], TicketError> {
        self.take(N)?
            .try_into()
            .map_err(|_| malformed("truncated ticket".to_string()))
    }

    fn u8(&mut self) -> Result<u8, TicketError> {
        Ok(u8::from_be_bytes(self.take_array()?))
    }

    fn u16(&mut self) -> Result<u16, TicketError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    fn u32(&mut self) -> Result<u32, TicketError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    fn u64(&mut self) -> Result<u64, TicketError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    fn field(&mut self, name: &str) -> Result<String, TicketError> {
        let len = self.u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(malformed(format!("{name} exceeds {MAX_FIELD_LEN} bytes")));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed(format!("{name} is not UTF-8")))
    }

    fn finish(self) -> Result<(), TicketError> {
        if self.pos != self.buf.len() {
            return Err(malformed(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
