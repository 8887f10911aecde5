use thiserror::Error;

/// Reasons a session ticket is rejected or cannot be minted.
///
/// Every variant is recoverable: callers treat a rejected ticket as an
/// unauthenticated request. The variants exist for logging and tests, and must
/// not be surfaced to end users.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TicketError {
    #[error("malformed ticket: {0}")]
    MalformedTicket(String),

    #[error("ticket signature verification failed")]
    BadSignature,

    #[error("ticket issued at {issued_at} is older than {max_age} seconds")]
    Expired { issued_at: i64, max_age: i64 },

    #[error("ticket bound to address '{bound}', request from '{expected}'")]
    AddressMismatch { expected: String, bound: String },

    #[error("cookie value is not valid base64url: {0}")]
    DecodeError(String),

    #[error("invalid ticket field: {0}")]
    InvalidField(String),
}

/// Startup configuration errors. These are fatal: the process should refuse to
/// serve requests rather than run without a usable secret or credential store.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("secret key is empty")]
    EmptySecret,

    #[error("secret key is not valid base64: {0}")]
    InvalidSecret(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
