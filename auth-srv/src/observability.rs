//! Request logging and client address extraction

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

pub async fn observability_middleware(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let uri = parts.uri.clone();
    info!("request method={} uri={uri}", parts.method);
    let begin = Instant::now();
    let response = next.run(Request::from_parts(parts, body)).await;
    info!(
        "response status={} uri={uri} duration_ms={}",
        response.status(),
        begin.elapsed().as_millis()
    );
    response
}

/// Extracts the client IP address of a request.
///
/// `X-Forwarded-For` (leftmost entry) and `X-Real-IP` are only consulted when
/// `trust_forwarded_headers` is set, i.e. behind a reverse proxy that
/// overwrites them. Otherwise the socket address is used. Returns an empty
/// string when no address is known.
pub fn client_ip(
    headers: &http::HeaderMap,
    extensions: &http::Extensions,
    trust_forwarded_headers: bool,
) -> String {
    if trust_forwarded_headers {
        if let Some(forwarded_for) = headers.get("x-forwarded-for")
            && let Ok(value) = forwarded_for.to_str()
            && let Some(client_ip) = value.split(',').next()
            && !client_ip.trim().is_empty()
        {
            return client_ip.trim().to_string();
        }

        if let Some(real_ip) = headers.get("x-real-ip")
            && let Ok(value) = real_ip.to_str()
        {
            return value.trim().to_string();
        }
    }

    if let Some(connect_info) = extensions.get::<ConnectInfo<SocketAddr>>() {
        return connect_info.0.ip().to_string();
    }

    String::new()
}
