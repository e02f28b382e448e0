//! Error responses for the signing proxy. Every message passes through
//! `redact` before it reaches a response body: the agent subprocess must
//! never be able to read key material out of an error string.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Redact any `0x`-prefixed 64-hex-character substring (a private key or
/// raw signing digest) from a message before it is ever logged or returned.
pub fn redact(message: &str) -> String {
    let chars: Vec<char> = message.chars().collect();
    let mut out = String::with_capacity(message.len());
    let mut i = 0;
    while i < chars.len() {
        if is_hex64_at(&chars, i) {
            out.push_str("0x[redacted]");
            i += 66;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

fn is_hex64_at(chars: &[char], start: usize) -> bool {
    if start + 66 > chars.len() {
        return false;
    }
    if chars[start] != '0' || chars[start + 1] != 'x' {
        return false;
    }
    chars[start + 2..start + 66].iter().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug)]
pub enum ProxyError {
    Unauthorized,
    BadRequest(String),
    Timeout,
    NotFound(String),
    Internal(String),
}

impl ProxyError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ProxyError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ProxyError::Timeout => (StatusCode::REQUEST_TIMEOUT, "TIMEOUT"),
            ProxyError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ProxyError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    fn message(&self) -> String {
        match self {
            ProxyError::Unauthorized => "unauthorized".to_string(),
            ProxyError::BadRequest(m) => m.clone(),
            ProxyError::Timeout => "timed out reading request body".to_string(),
            ProxyError::NotFound(m) => m.clone(),
            ProxyError::Internal(m) => m.clone(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = redact(&self.message());
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_a_64_hex_char_private_key() {
        let key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
        let message = format!("invalid private key: {key}");
        let redacted = redact(&message);
        assert!(!redacted.contains(&key[2..]));
        assert!(redacted.contains("[redacted]"));
    }

    #[test]
    fn leaves_short_hex_untouched() {
        let message = "selector 0xdeadbeef not allowed";
        assert_eq!(redact(message), message);
    }
}
