use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Login service errors
///
/// Responses carry a generic message only; the detail goes to the log.
#[derive(Debug)]
pub enum AuthApiError {
    InvalidState,
    ProviderError(String),
    TokenExchangeFailed,
    Internal(String),
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthApiError::InvalidState => (StatusCode::BAD_REQUEST, "Invalid login state"),
            AuthApiError::ProviderError(msg) => {
                tracing::warn!("identity provider returned an error: {msg}");
                (StatusCode::UNAUTHORIZED, "Login was not completed")
            }
            AuthApiError::TokenExchangeFailed => {
                (StatusCode::UNAUTHORIZED, "Token exchange failed")
            }
            AuthApiError::Internal(msg) => {
                tracing::error!("auth internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, message).into_response()
    }
}
