use axum::http::HeaderMap;

/// Resolved ingress auth configuration.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    /// Shared secret for internal publish endpoints. `None` accepts any
    /// caller (development only).
    pub service_token: Option<String>,
}

/// Token comparison that never short-circuits on the first differing byte,
/// so response timing leaks nothing about the secret's contents.
fn safe_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

impl ResolvedAuth {
    /// Authorize an internal service call from its bearer token.
    pub fn authorize_service(&self, provided: Option<&str>) -> bool {
        match self.service_token.as_deref() {
            None => true,
            Some(expected) => provided.is_some_and(|given| safe_equal(given, expected)),
        }
    }
}

/// Pull the bearer token out of an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// The user identity resolved by the upstream auth gateway. The core
/// trusts this header; minting and verifying tokens happens upstream.
pub fn user_identity(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
