//! Access-control pipeline for site traffic.
//!
//! Stages, outermost first: request logging, SSO gate (when configured),
//! compression, security headers, Basic Authentication (when configured).
//! The WebSocket endpoint sits outside these and relies on
//! [`OriginMatcher`] plus the init-message token instead.

pub mod basic_auth;
pub mod headers;
pub mod logging;
pub mod origin;
pub mod sso;

pub use basic_auth::BasicAuth;
pub use logging::RemoteAddr;
pub use origin::OriginMatcher;
pub use sso::SsoGate;
