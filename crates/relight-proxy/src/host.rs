//! Routing key extraction.

use axum::http::{HeaderMap, Uri, header};

/// Strip an optional port from a `Host` value.
///
/// Bracketed IPv6 literals keep their brackets. Returns `None` when nothing
/// is left.
pub fn host_key(host: &str) -> Option<&str> {
    let host = host.trim();
    let key = match host.rfind(':') {
        Some(idx) if host.rfind(']').is_none_or(|close| close < idx) => &host[..idx],
        _ => host,
    };
    (!key.is_empty()).then_some(key)
}

/// Key for a request: the `Host` header, falling back to the URI authority.
pub fn request_key<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .and_then(host_key)
}
