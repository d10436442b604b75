//! HTTP Basic Authentication stage.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tracing::warn;

const CHALLENGE: &str = r#"Basic realm="wtty""#;

/// Expected `user:password` credential.
#[derive(Clone)]
pub struct BasicAuth {
    credential: String,
}

impl BasicAuth {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
        }
    }

    /// True when the `Authorization` header carries the expected credential.
    /// Missing, malformed and wrong credentials all fail.
    pub fn check(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some((scheme, encoded)) = value.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        match STANDARD.decode(encoded.trim()) {
            Ok(decoded) => decoded == self.credential.as_bytes(),
            Err(_) => false,
        }
    }
}

/// Middleware: pass authenticated requests, challenge the rest.
pub async fn require_basic_auth(
    State(auth): State<Arc<BasicAuth>>,
    request: Request,
    next: Next,
) -> Response {
    if auth.check(request.headers()) {
        return next.run(request).await;
    }
    warn!(path = %request.uri().path(), "basic authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, HeaderValue::from_static(CHALLENGE))],
        "authorization failed",
    )
        .into_response()
}
