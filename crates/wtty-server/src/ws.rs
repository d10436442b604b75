//! WebSocket upgrade endpoint.
//!
//! Admission happens before the upgrade (once mode, connection limit,
//! origin); authentication happens after it, through the token in the
//! client's first message.

use crate::access::RemoteAddr;
use crate::router::AppState;
use crate::session::{run_bridge, BridgeOptions, SpawnParams};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use wtty_core::{InitMessage, WttyError, WttyResult, PROTOCOLS};

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    remote: RemoteAddr,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.config.once && state.once_claimed.swap(true, Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }

    let guard = state.tracker.register();
    let max = state.config.max_connections;
    if max > 0 && guard.number() > max {
        warn!(%remote, max, "reached max connections");
        return (StatusCode::SERVICE_UNAVAILABLE, "Reached the maximum connections")
            .into_response();
    }

    if !state.site.origin.allows_request(&headers) {
        warn!(%remote, origin = ?headers.get(axum::http::header::ORIGIN), "websocket origin rejected");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let span = info_span!(parent: &state.span, "session", %remote, n = guard.number());
    ws.protocols(PROTOCOLS.iter().copied())
        .on_upgrade(move |socket| {
            async move {
                info!(active = state.tracker.count(), "new client connected");
                match serve_session(&state, socket, remote, &headers).await {
                    Ok(()) => info!("connection closed"),
                    Err(e) => warn!(error = %e, "connection closed with error"),
                }
                // Unregister only after the session is fully torn down.
                drop(guard);
            }
            .instrument(span)
        })
}

async fn serve_session(
    state: &AppState,
    mut socket: WebSocket,
    remote: RemoteAddr,
    headers: &HeaderMap,
) -> WttyResult<()> {
    let init = tokio::select! {
        _ = state.hard_cancel.cancelled() => return Ok(()),
        init = read_init(&mut socket) => init?,
    };
    if init.auth_token != state.config.auth_token() {
        let _ = socket.send(Message::Close(None)).await;
        return Err(WttyError::Protocol(
            "failed to authenticate websocket connection".into(),
        ));
    }

    let params = SpawnParams {
        query: if state.config.permit_arguments {
            SpawnParams::parse_query(&init.arguments)
        } else {
            HashMap::new()
        },
        headers: state.config.pass_headers.then(|| header_map(headers)),
    };
    let factory = state.factory.clone();
    let slave = tokio::task::spawn_blocking(move || factory.spawn(params))
        .await
        .map_err(|e| WttyError::Session(format!("spawn task failed: {e}")))??;

    let mut title_vars = state.title_variables(remote);
    title_vars.extend(slave.title_variables());
    let options = BridgeOptions {
        permit_write: state.config.permit_write,
        title: state.site.title.render(&title_vars),
        preferences: state.config.preferences.clone(),
        reconnect: state
            .config
            .enable_reconnect
            .then_some(state.config.reconnect_time),
        fixed_size: (state.config.width, state.config.height),
    };
    debug!(title = %options.title, "session started");

    run_bridge(socket, slave, options, state.hard_cancel.clone()).await
}

async fn read_init(socket: &mut WebSocket) -> WttyResult<InitMessage> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => return InitMessage::parse(text.as_str()),
            Some(Ok(Message::Binary(data))) => {
                let text = std::str::from_utf8(&data)
                    .map_err(|_| WttyError::Protocol("non UTF-8 init message".into()))?;
                return InitMessage::parse(text);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(WttyError::Protocol("closed before init message".into()))
            }
            Some(Err(e)) => return Err(WttyError::Session(format!("websocket read failed: {e}"))),
        }
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}
