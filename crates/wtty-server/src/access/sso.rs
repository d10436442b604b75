//! SSO token gate.
//!
//! The index page requires a token query parameter; visitors without one
//! are sent to the SSO provider, which is expected to come back through
//! `/sso-login/...?<key>=<token>`.

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;
use wtty_core::{WttyError, WttyResult};

#[derive(Debug, Clone)]
pub struct SsoGate {
    url: String,
    token_key: String,
    base_path: String,
}

impl SsoGate {
    /// `url` must be an absolute URI or an absolute path.
    pub fn new(url: &str, token_key: &str, base_path: &str) -> WttyResult<Self> {
        let parsed: Uri = url
            .parse()
            .map_err(|e| WttyError::Config(format!("invalid SSO URL `{url}`: {e}")))?;
        if parsed.scheme().is_none() && !url.starts_with('/') {
            return Err(WttyError::Config(format!(
                "invalid SSO URL `{url}`: expected an absolute URL or path"
            )));
        }
        Ok(Self {
            url: url.to_string(),
            token_key: token_key.to_string(),
            base_path: base_path.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// True when the first `token_key` value in the query is non-empty.
    pub fn has_token(&self, uri: &Uri) -> bool {
        Query::<Vec<(String, String)>>::try_from_uri(uri)
            .ok()
            .and_then(|Query(pairs)| {
                pairs
                    .into_iter()
                    .find(|(key, _)| *key == self.token_key)
                    .map(|(_, value)| !value.is_empty())
            })
            .unwrap_or(false)
    }

    /// Response for the SSO callback: back to the index, keeping the query.
    pub fn callback(&self, uri: &Uri) -> Response {
        if !self.has_token(uri) {
            return (
                StatusCode::BAD_REQUEST,
                format!("Missing or empty {}", self.token_key),
            )
                .into_response();
        }
        let location = match uri.query() {
            Some(query) => format!("{}?{query}", self.base_path),
            None => self.base_path.clone(),
        };
        see_other(&location)
    }
}

fn see_other(location: &str) -> Response {
    (StatusCode::SEE_OTHER, [(header::LOCATION, location.to_string())]).into_response()
}

/// Middleware: redirect index requests without a token to the SSO URL.
pub async fn require_sso_token(
    State(gate): State<Arc<SsoGate>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == gate.base_path && !gate.has_token(request.uri()) {
        debug!(sso = %gate.url, "no SSO token, redirecting");
        return see_other(&gate.url);
    }
    next.run(request).await
}

/// Handler for `/sso-login/...`. See [`SsoGate::callback`].
pub async fn sso_callback(State(gate): State<Arc<SsoGate>>, uri: Uri) -> Response {
    gate.callback(&uri)
}
