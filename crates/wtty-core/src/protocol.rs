//! webtty wire messages.
//!
//! Every WebSocket text frame starts with a one-byte message type followed
//! by its payload. Terminal output travels base64-encoded so arbitrary
//! bytes survive text frames.
//!
//! ```text
//! client → server   '1' input   '2' ping   '3' resize {"columns","rows"}
//! server → client   '1' output  '2' pong   '3' title  '4' preferences
//!                   '5' reconnect delay    '6' buffer size
//! ```

use crate::error::{WttyError, WttyResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// WebSocket subprotocols advertised by the upgrade endpoint.
pub const PROTOCOLS: &[&str] = &["webtty"];

const INPUT: char = '1';
const PING: char = '2';
const RESIZE_TERMINAL: char = '3';

const OUTPUT: char = '1';
const PONG: char = '2';
const SET_WINDOW_TITLE: char = '3';
const SET_PREFERENCES: char = '4';
const SET_RECONNECT: char = '5';
const SET_BUFFER_SIZE: char = '6';

/// First message a client sends after the upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    /// Query string (`?a=b`) the client wants forwarded to the session.
    #[serde(rename = "Arguments", default)]
    pub arguments: String,
    /// Token bootstrapped through `auth_token.js`.
    #[serde(rename = "AuthToken", default)]
    pub auth_token: String,
}

impl InitMessage {
    pub fn parse(text: &str) -> WttyResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| WttyError::Protocol(format!("invalid init message: {e}")))
    }
}

/// Terminal size requested by the client. Browsers send floats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub columns: f64,
    pub rows: f64,
}

impl ResizeRequest {
    /// Size clamped to the `u16` range a PTY accepts.
    pub fn size(&self) -> (u16, u16) {
        (clamp_dimension(self.columns), clamp_dimension(self.rows))
    }
}

fn clamp_dimension(v: f64) -> u16 {
    if v.is_nan() || v < 1.0 {
        1
    } else if v > u16::MAX as f64 {
        u16::MAX
    } else {
        v as u16
    }
}

/// Messages received from the browser.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Input(Vec<u8>),
    Ping,
    Resize(ResizeRequest),
}

impl ClientMessage {
    pub fn decode(frame: &str) -> WttyResult<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| WttyError::Protocol("empty message".into()))?;
        let payload = chars.as_str();
        match kind {
            INPUT => Ok(ClientMessage::Input(payload.as_bytes().to_vec())),
            PING => Ok(ClientMessage::Ping),
            RESIZE_TERMINAL => {
                let size: ResizeRequest = serde_json::from_str(payload)
                    .map_err(|e| WttyError::Protocol(format!("invalid resize request: {e}")))?;
                Ok(ClientMessage::Resize(size))
            }
            other => Err(WttyError::Protocol(format!("unknown message type `{other}`"))),
        }
    }
}

/// Messages sent to the browser.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Output(Vec<u8>),
    Pong,
    WindowTitle(String),
    Preferences(serde_json::Value),
    Reconnect(u64),
    BufferSize(usize),
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        match self {
            ServerMessage::Output(data) => format!("{OUTPUT}{}", STANDARD.encode(data)),
            ServerMessage::Pong => PONG.to_string(),
            ServerMessage::WindowTitle(title) => format!("{SET_WINDOW_TITLE}{title}"),
            ServerMessage::Preferences(prefs) => format!("{SET_PREFERENCES}{prefs}"),
            ServerMessage::Reconnect(secs) => format!("{SET_RECONNECT}{secs}"),
            ServerMessage::BufferSize(size) => format!("{SET_BUFFER_SIZE}{size}"),
        }
    }
}
