//! Terminal sessions behind the WebSocket endpoint.
//!
//! A [`SessionFactory`] turns an accepted upgrade into a running [`Slave`]
//! (normally a command on a PTY); the webtty bridge then pumps bytes
//! between the slave and the browser.

pub mod pty;
pub mod webtty;

pub use pty::{CommandFactory, CommandOptions};
pub use webtty::{run_bridge, BridgeOptions};

use std::collections::HashMap;
use std::io::{Read, Write};
use wtty_core::WttyResult;

/// Everything a factory may use to customize a new session.
#[derive(Debug, Clone, Default)]
pub struct SpawnParams {
    /// Query parameters from the client's init message. Empty unless
    /// arguments are permitted.
    pub query: HashMap<String, Vec<String>>,
    /// Upgrade request headers, present only when header passing is on.
    pub headers: Option<HashMap<String, Vec<String>>>,
}

impl SpawnParams {
    /// Parse a `?a=1&b=2` (leading `?` optional) argument string.
    pub fn parse_query(arguments: &str) -> HashMap<String, Vec<String>> {
        let mut query: HashMap<String, Vec<String>> = HashMap::new();
        let raw = arguments.strip_prefix('?').unwrap_or(arguments);
        if raw.is_empty() {
            return query;
        }
        let uri = match format!("/?{raw}").parse::<axum::http::Uri>() {
            Ok(uri) => uri,
            Err(_) => return query,
        };
        if let Ok(axum::extract::Query(pairs)) =
            axum::extract::Query::<Vec<(String, String)>>::try_from_uri(&uri)
        {
            for (key, value) in pairs {
                query.entry(key).or_default().push(value);
            }
        }
        query
    }
}

/// Creates sessions. One instance serves every connection.
pub trait SessionFactory: Send + Sync + 'static {
    /// Short name used as the `command` title variable.
    fn name(&self) -> &str;

    /// Start a new session. Called from a blocking context.
    fn spawn(&self, params: SpawnParams) -> WttyResult<Box<dyn Slave>>;
}

/// One running session.
///
/// The reader and writer halves are blocking and are each taken exactly
/// once by the bridge, which drives them from dedicated threads.
pub trait Slave: Send {
    fn take_reader(&mut self) -> WttyResult<Box<dyn Read + Send>>;

    fn take_writer(&mut self) -> WttyResult<Box<dyn Write + Send>>;

    fn resize(&mut self, cols: u16, rows: u16) -> WttyResult<()>;

    /// Extra variables for the window title (e.g. `pid`, `argv`).
    fn title_variables(&self) -> HashMap<String, String>;

    /// Terminate the session. Must unblock a pending read on the reader.
    fn close(&mut self) -> WttyResult<()>;
}
