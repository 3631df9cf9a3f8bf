use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;

use crate::{
    error_payload::ApiError,
    state::{AppState, Credentials},
};

const REALM: &str = "Basic realm=\"MiniMC\", charset=\"UTF-8\"";

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn is_authorized(headers: &HeaderMap, expected: &Credentials) -> bool {
    let Some((user, pass)) = basic_credentials(headers) else {
        return false;
    };
    // Both halves are always compared.
    let user_ok = constant_time_eq(user.as_bytes(), expected.username.as_bytes());
    let pass_ok = constant_time_eq(pass.as_bytes(), expected.password.as_bytes());
    user_ok & pass_ok
}

pub async fn require_basic_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if is_authorized(req.headers(), &state.credentials) {
        return next.run(req).await;
    }

    tracing::debug!(path = %req.uri().path(), "rejected unauthenticated request");
    let mut resp =
        ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "authentication required")
            .into_response();
    resp.headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    fn creds() -> Credentials {
        Credentials {
            username: "admin".to_string(),
            password: "pa:ss".to_string(),
        }
    }

    #[test]
    fn accepts_matching_credentials() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:pa:ss");
        assert!(is_authorized(&headers_with(&format!("Basic {encoded}")), &creds()));
        assert!(is_authorized(&headers_with(&format!("basic {encoded}")), &creds()));
    }

    #[test]
    fn rejects_wrong_or_malformed_credentials() {
        let wrong = base64::engine::general_purpose::STANDARD.encode("admin:nope");
        assert!(!is_authorized(&headers_with(&format!("Basic {wrong}")), &creds()));
        assert!(!is_authorized(&headers_with("Bearer abc"), &creds()));
        assert!(!is_authorized(&headers_with("Basic !!!"), &creds()));
        assert!(!is_authorized(&HeaderMap::new(), &creds()));
    }
}
