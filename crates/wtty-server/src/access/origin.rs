//! WebSocket `Origin` validation.

use axum::http::{header, HeaderMap};
use regex::Regex;
use wtty_core::{WttyError, WttyResult};

/// Decides which `Origin` values may open a terminal session.
#[derive(Debug, Clone)]
pub enum OriginMatcher {
    AllowAll,
    Pattern(Regex),
}

impl OriginMatcher {
    /// `None` or an empty pattern allows every origin.
    pub fn new(pattern: Option<&str>) -> WttyResult<Self> {
        match pattern {
            None | Some("") => Ok(OriginMatcher::AllowAll),
            Some(pattern) => Regex::new(pattern).map(OriginMatcher::Pattern).map_err(|e| {
                WttyError::Config(format!(
                    "failed to compile regular expression of WebSocket origin `{pattern}`: {e}"
                ))
            }),
        }
    }

    /// A missing header is matched as the empty string.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match self {
            OriginMatcher::AllowAll => true,
            OriginMatcher::Pattern(re) => re.is_match(origin.unwrap_or("")),
        }
    }

    pub fn allows_request(&self, headers: &HeaderMap) -> bool {
        self.allows(headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()))
    }
}
