//! Bearer-token extraction for agent and adapter calls.

use axum::http::{header::AUTHORIZATION, HeaderMap};

/// Pull the bearer token out of an Authorization header, tolerating case on
/// the scheme only.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Constant adapter-token check for the chat-adapter surface. An unset
/// expected token disables that surface entirely rather than opening it up.
pub fn adapter_authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    match expected {
        Some(expected) => bearer_token(headers) == Some(expected),
        None => false,
    }
}
