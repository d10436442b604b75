//! wtty-server: share a local command as a browser terminal.
//!
//! The [`Gateway`] serves an index page and a WebSocket endpoint under a
//! base path; each WebSocket becomes a session created by a
//! [`SessionFactory`](session::SessionFactory) and bridged with the webtty
//! protocol.

pub mod access;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod router;
pub mod serve;
pub mod session;
pub mod tls;
pub mod tracker;
pub mod ws;

pub use config::{ConfigOverrides, ServerConfig};
pub use gateway::{BoundGateway, Gateway, Phase, StopReason};
pub use tracker::{ConnectionTracker, SessionGuard, TrackerSignal};
