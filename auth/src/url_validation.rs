//! Return URL validation for the login flow
//!
//! After login the user is redirected to the URL handed over by the THREDDS
//! authentication filter. Left unchecked, that parameter is an open redirect:
//! anyone could craft a login link that ends on a phishing site with a fresh
//! session cookie in hand. Only relative paths and absolute URLs on configured
//! data node hosts are accepted.

use url::Url;

/// Validate that a return URL is a safe relative path
///
/// This function prevents open redirect attacks by ensuring the URL:
/// 1. Is URL-decoded to prevent encoding bypasses
/// 2. Is a relative path starting with exactly one /
/// 3. Does not contain protocol-relative URLs (//) or absolute URLs
/// 4. Does not contain backslashes (which some browsers treat as forward slashes)
/// 5. Parses correctly as a relative URL
///
/// # Examples
///
/// ```
/// use esgf_auth::url_validation::is_safe_relative_path;
///
/// assert!(is_safe_relative_path("/thredds/fileServer/cmip5/a.nc"));
/// assert!(is_safe_relative_path("/path%20with%20spaces"));
///
/// assert!(!is_safe_relative_path("https://evil.com"));
/// assert!(!is_safe_relative_path("//evil.com"));
/// assert!(!is_safe_relative_path("/%2F/evil.com"));
/// assert!(!is_safe_relative_path("/\\evil.com"));
/// ```
pub fn is_safe_relative_path(url: &str) -> bool {
    // Decode first so /%2F/evil.com is seen as //evil.com
    let decoded = match percent_encoding::percent_decode_str(url).decode_utf8() {
        Ok(s) => s.to_string(),
        Err(_) => return false,
    };

    if !decoded.starts_with('/') || decoded.starts_with("//") {
        return false;
    }

    if decoded.contains("://") {
        return false;
    }

    // some browsers normalize \ to /
    if decoded.contains('\\') {
        return false;
    }

    Url::options()
        .base_url(Some(
            &Url::parse("http://localhost").expect("base URL should parse"),
        ))
        .parse(&decoded)
        .is_ok()
}

/// Validate an absolute `http`/`https` return URL against a host allow-list.
///
/// Entries are compared case-insensitively, either as `host` (any port) or as
/// `host:port`. URLs carrying credentials are rejected.
pub fn is_allowed_absolute_url(url: &str, allowed_hosts: &[String]) -> bool {
    if url.contains('\\') {
        return false;
    }
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return false;
    }
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let host_port = parsed
        .port_or_known_default()
        .map(|port| format!("{host}:{port}"));

    allowed_hosts.iter().any(|allowed| {
        let allowed = allowed.trim().to_ascii_lowercase();
        allowed == host || Some(&allowed) == host_port.as_ref()
    })
}

/// Validate a return URL: a safe relative path, or an absolute URL on one of
/// the allowed hosts.
///
/// ```
/// use esgf_auth::url_validation::validate_return_url;
///
/// let allowed = vec!["data.example.org".to_string()];
/// assert!(validate_return_url("/thredds/catalog.html", &allowed));
/// assert!(validate_return_url("https://data.example.org/thredds/a.nc", &allowed));
/// assert!(!validate_return_url("https://evil.com/thredds/a.nc", &allowed));
/// ```
pub fn validate_return_url(url: &str, allowed_hosts: &[String]) -> bool {
    if url.starts_with('/') {
        is_safe_relative_path(url)
    } else {
        is_allowed_absolute_url(url, allowed_hosts)
    }
}
