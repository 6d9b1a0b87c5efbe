//! Admin endpoint authentication.
//!
//! The admin surface accepts either the configured bearer token or HTTP
//! Basic credentials. The comparison never reveals which part failed.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;

use crate::AppState;

/// Axum middleware guarding the `/admin` routes.
pub async fn admin_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let config = &state.config;

    if let Some(token) = bearer_token(req.headers()) {
        if !config.admin_token.is_empty() && constant_time_eq(token, &config.admin_token) {
            return next.run(req).await;
        }
    }

    if let Some((user, pass)) = basic_credentials(req.headers()) {
        if !config.admin_user.is_empty()
            && constant_time_eq(&user, &config.admin_user)
            && constant_time_eq(&pass, &config.admin_pass)
        {
            return next.run(req).await;
        }
    }

    let challenge = if config.admin_user.is_empty() { "Bearer" } else { "Basic realm=\"hookline\"" };
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        "unauthorized",
    )
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = auth.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim())
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = auth.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD.decode(rest.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer admin-tok"));
        assert_eq!(bearer_token(&headers), Some("admin-tok"));

        headers.insert("authorization", HeaderValue::from_static("bearer lower"));
        assert_eq!(bearer_token(&headers), Some("lower"));
    }

    #[test]
    fn basic_credentials_decoded() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("ops:pa:ss");
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );

        // Password may itself contain a colon; only the first splits.
        assert_eq!(
            basic_credentials(&headers),
            Some(("ops".to_string(), "pa:ss".to_string()))
        );
    }

    #[test]
    fn comparison_rejects_near_misses() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secre"));
    }
}
