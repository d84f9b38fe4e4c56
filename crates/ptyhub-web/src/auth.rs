//! Bearer-token authentication.
//!
//! One 24-byte random token is generated per server start and carried in
//! every advertised URL. Browser WebSocket upgrades cannot set headers, so
//! a `?token=` query parameter is accepted alongside the standard
//! `Authorization: Bearer` header. Comparisons are constant-time.

use axum::http::{HeaderMap, header};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use subtle::ConstantTimeEq;

/// Raw entropy per token.
pub const TOKEN_BYTES: usize = 24;

/// Query parameters recognized on authenticated routes.
#[derive(Deserialize, Debug, Default)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Process-unique access token. Lives exactly as long as the server.
#[derive(Clone)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn generate() -> Self {
        let mut raw = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut raw);
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    /// The url-safe token string, for embedding in advertised URLs.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a candidate.
    pub fn verify(&self, candidate: &str) -> bool {
        self.0.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// A request is authorized iff it carries the token in the `Authorization`
/// header or the `token` query parameter. Nothing else is accepted.
pub fn request_authorized(
    token: &AuthToken,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> bool {
    if let Some(candidate) = bearer_token(headers)
        && token.verify(candidate)
    {
        return true;
    }
    if let Some(candidate) = query_token
        && token.verify(candidate)
    {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn generated_tokens_are_url_safe_and_unique() {
        let a = AuthToken::generate();
        let b = AuthToken::generate();
        assert_ne!(a.expose(), b.expose());
        // 24 bytes -> 32 unpadded base64url characters.
        assert_eq!(a.expose().len(), 32);
        assert!(
            a.expose()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn verify_accepts_only_the_exact_token() {
        let token = AuthToken::generate();
        assert!(token.verify(token.expose()));
        assert!(!token.verify(""));
        assert!(!token.verify("WRONG"));
        let mut near_miss = token.expose().to_string();
        near_miss.pop();
        assert!(!token.verify(&near_miss));
    }

    #[test]
    fn bearer_header_is_recognized() {
        let token = AuthToken::generate();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token.expose())).unwrap(),
        );
        assert!(request_authorized(&token, &headers, None));
    }

    #[test]
    fn query_token_is_recognized() {
        let token = AuthToken::generate();
        let headers = HeaderMap::new();
        assert!(request_authorized(&token, &headers, Some(token.expose())));
    }

    #[test]
    fn malformed_credentials_are_rejected() {
        let token = AuthToken::generate();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            // Missing the Bearer prefix.
            HeaderValue::from_str(token.expose()).unwrap(),
        );
        assert!(!request_authorized(&token, &headers, None));
        assert!(!request_authorized(&token, &HeaderMap::new(), None));
        assert!(!request_authorized(&token, &HeaderMap::new(), Some("bogus")));
    }
}
