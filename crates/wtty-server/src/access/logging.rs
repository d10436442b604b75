//! Request logging stage and peer-address extraction.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use tracing::info;

/// Peer address inserted by the accept loop; absent when a router is
/// driven directly (tests).
#[derive(Debug, Clone, Copy)]
pub struct RemoteAddr(pub Option<SocketAddr>);

impl RemoteAddr {
    fn from_extensions(extensions: &axum::http::Extensions) -> Self {
        RemoteAddr(
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        )
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("-"),
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RemoteAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_extensions(&parts.extensions))
    }
}

/// Middleware: one line per request with peer, status, method and path.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let remote = RemoteAddr::from_extensions(request.extensions());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = next.run(request).await;

    info!(
        %remote,
        status = response.status().as_u16(),
        %method,
        %path,
        "request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn remote_addr_comes_from_connect_info() {
        let app = Router::new()
            .route("/", get(|remote: RemoteAddr| async move { remote.to_string() }))
            .layer(middleware::from_fn(log_requests));

        let peer: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        let response = app.clone().oneshot(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"10.1.2.3:4567");

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"-");
    }
}
