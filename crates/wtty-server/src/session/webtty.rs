//! Bridge between a browser WebSocket and a [`Slave`].

use super::Slave;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wtty_core::{ClientMessage, ServerMessage, WttyError, WttyResult};

/// Max bytes per output frame; also advertised to the client.
const BUFFER_SIZE: usize = 1024;

/// Per-session behaviour of the bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Forward client input to the slave. Otherwise input is dropped.
    pub permit_write: bool,
    pub title: String,
    pub preferences: serde_json::Value,
    /// Seconds the client waits before reconnecting, if enabled.
    pub reconnect: Option<u64>,
    /// Fixed `(cols, rows)`. A zero dimension follows the client.
    pub fixed_size: (u16, u16),
}

impl BridgeOptions {
    fn effective_size(&self, requested: (u16, u16)) -> (u16, u16) {
        let (fixed_cols, fixed_rows) = self.fixed_size;
        (
            if fixed_cols > 0 { fixed_cols } else { requested.0 },
            if fixed_rows > 0 { fixed_rows } else { requested.1 },
        )
    }
}

/// Run one session until the client leaves, the slave's output ends or
/// `cancel` fires. The slave is closed on every exit path.
pub async fn run_bridge(
    socket: WebSocket,
    mut slave: Box<dyn Slave>,
    options: BridgeOptions,
    cancel: CancellationToken,
) -> WttyResult<()> {
    let (mut sink, mut stream) = socket.split();

    let result: WttyResult<()> = async {
        let mut output_rx = spawn_reader(slave.take_reader()?)?;
        let input_tx = spawn_writer(slave.take_writer()?)?;

        send(&mut sink, ServerMessage::WindowTitle(options.title.clone())).await?;
        send(&mut sink, ServerMessage::BufferSize(BUFFER_SIZE)).await?;
        if let Some(delay) = options.reconnect {
            send(&mut sink, ServerMessage::Reconnect(delay)).await?;
        }
        send(&mut sink, ServerMessage::Preferences(options.preferences.clone())).await?;

        let (fixed_cols, fixed_rows) = options.fixed_size;
        if fixed_cols > 0 && fixed_rows > 0 {
            slave.resize(fixed_cols, fixed_rows)?;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("session cancelled");
                    return Ok(());
                }
                output = output_rx.recv() => match output {
                    Some(data) => send(&mut sink, ServerMessage::Output(data)).await?,
                    None => {
                        debug!("session output ended");
                        return Ok(());
                    }
                },
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => String::from_utf8(data.to_vec())
                            .map_err(|_| WttyError::Protocol("non UTF-8 frame".into()))?,
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("client closed the connection");
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(WttyError::Session(format!("websocket read failed: {e}")));
                        }
                    };
                    match ClientMessage::decode(&text)? {
                        ClientMessage::Input(data) => {
                            if options.permit_write && input_tx.send(data).is_err() {
                                debug!("session input closed");
                                return Ok(());
                            }
                        }
                        ClientMessage::Ping => send(&mut sink, ServerMessage::Pong).await?,
                        ClientMessage::Resize(request) => {
                            let (cols, rows) = options.effective_size(request.size());
                            slave.resize(cols, rows)?;
                        }
                    }
                }
            }
        }
    }
    .await;

    let _ = sink.send(Message::Close(None)).await;
    match tokio::task::spawn_blocking(move || slave.close()).await {
        Ok(Err(e)) => warn!(error = %e, "failed to close session"),
        Err(e) => warn!(error = %e, "session close task failed"),
        Ok(Ok(())) => {}
    }
    result
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, message: ServerMessage) -> WttyResult<()> {
    sink.send(Message::Text(message.encode().into()))
        .await
        .map_err(|e| WttyError::Session(format!("websocket write failed: {e}")))
}

/// Pump slave output into a channel from a dedicated thread. The reader may
/// block indefinitely, so it stays off the runtime's blocking pool.
fn spawn_reader(mut reader: Box<dyn Read + Send>) -> WttyResult<mpsc::Receiver<Vec<u8>>> {
    let (tx, rx) = mpsc::channel(32);
    std::thread::Builder::new()
        .name("wtty-reader".into())
        .spawn(move || {
            let mut buf = [0u8; BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(error = %e, "session read ended");
                        break;
                    }
                }
            }
        })
        .map_err(|e| WttyError::Session(format!("failed to start reader thread: {e}")))?;
    Ok(rx)
}

fn spawn_writer(mut writer: Box<dyn Write + Send>) -> WttyResult<std::sync::mpsc::Sender<Vec<u8>>> {
    let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
    std::thread::Builder::new()
        .name("wtty-writer".into())
        .spawn(move || {
            while let Ok(data) = rx.recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    debug!(error = %e, "session write failed");
                    break;
                }
            }
        })
        .map_err(|e| WttyError::Session(format!("failed to start writer thread: {e}")))?;
    Ok(tx)
}
