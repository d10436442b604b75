//! Accept loop: plain TCP or TLS, one task per connection.

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, warn, Instrument, Span};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Source of incoming connections.
pub trait Accept: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    type Io = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Serve `app` on `listener` until `stop` fires, then wait for in-flight
/// connections to finish. Upgraded WebSocket connections are detached from
/// the HTTP connection and are not waited for here.
///
/// Running out of file descriptors or buffers is retried with backoff; only
/// errors that leave the listener unusable are returned.
///
/// Dropping the returned future aborts every connection task.
pub async fn serve<L: Accept>(
    mut listener: L,
    app: Router,
    tls: Option<TlsAcceptor>,
    stop: CancellationToken,
) -> io::Result<()> {
    let builder = auto::Builder::new(TokioExecutor::new());
    let mut connections = JoinSet::new();
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    accepted
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "accept failed for one connection");
                    continue;
                }
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(error = %e, retry_in = ?backoff, "accept failed, retrying");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
                Err(e) => return Err(e),
            },
        };

        let app = app.clone();
        let builder = builder.clone();
        let tls = tls.clone();
        let stop = stop.clone();
        let span = Span::current();
        connections.spawn(
            async move {
                match tls {
                    Some(acceptor) => {
                        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                            .await
                        {
                            Ok(Ok(stream)) => serve_connection(stream, peer, app, builder, stop).await,
                            Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
                            Err(_) => debug!(%peer, "TLS handshake timed out"),
                        }
                    }
                    None => serve_connection(stream, peer, app, builder, stop).await,
                }
            }
            .instrument(span),
        );
    }

    drop(listener);
    if !connections.is_empty() {
        debug!(open = connections.len(), "waiting for in-flight connections");
    }
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn serve_connection<I>(
    io: I,
    peer: SocketAddr,
    app: Router,
    builder: auto::Builder<TokioExecutor>,
    stop: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = app.map_request(move |mut request: axum::http::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    });
    let connection =
        builder.serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(service));
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = stop.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        debug!(%peer, error = %e, "connection ended with error");
    }
}

/// Errors that concern a single connection, not the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Process or system limits that clear once connections close.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory || e.raw_os_error().is_some_and(is_exhausted_errno)
}

#[cfg(unix)]
fn is_exhausted_errno(code: i32) -> bool {
    use nix::errno::Errno;
    matches!(
        Errno::from_i32(code),
        Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM
    )
}

#[cfg(not(unix))]
fn is_exhausted_errno(_code: i32) -> bool {
    false
}

/// Listener wrapper that fails `accept` on demand.
#[cfg(test)]
pub(crate) struct ScriptedListener {
    inner: TcpListener,
    failures: tokio::sync::mpsc::UnboundedReceiver<io::Error>,
}

#[cfg(test)]
impl ScriptedListener {
    pub(crate) fn new(
        inner: TcpListener,
    ) -> (Self, tokio::sync::mpsc::UnboundedSender<io::Error>) {
        let (tx, failures) = tokio::sync::mpsc::unbounded_channel();
        (Self { inner, failures }, tx)
    }
}

#[cfg(test)]
impl Accept for ScriptedListener {
    type Io = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        async move {
            tokio::select! {
                biased;
                Some(e) = self.failures.recv() => Err(e),
                accepted = self.inner.accept() => accepted,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get_root(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_until_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/",
            get(|ConnectInfo(peer): ConnectInfo<SocketAddr>| async move { peer.ip().to_string() }),
        );
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve(listener, app, None, stop.clone()));

        let response = get_root(addr).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("127.0.0.1"), "{response}");

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("serve should return after stop")
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "slow"
            }),
        );
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve(listener, app, None, stop.clone()));

        let request = tokio::spawn(get_root(addr));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();

        let response = request.await.unwrap();
        assert!(response.ends_with("slow"), "{response}");
        server.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn descriptor_exhaustion_is_retried() {
        use nix::errno::Errno;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (listener, failures) = ScriptedListener::new(listener);
        for errno in [Errno::EMFILE, Errno::ENFILE, Errno::EMFILE] {
            failures.send(io::Error::from(errno)).unwrap();
        }
        let app = Router::new().route("/", get(|| async { "up" }));
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve(listener, app, None, stop.clone()));

        let response = tokio::time::timeout(Duration::from_secs(5), get_root(addr))
            .await
            .expect("request should be served after the backoff");
        assert!(response.ends_with("up"), "{response}");
        assert!(!server.is_finished());

        stop.cancel();
        server.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_interrupts_the_backoff() {
        use nix::errno::Errno;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (listener, failures) = ScriptedListener::new(listener);
        for _ in 0..20 {
            failures.send(io::Error::from(Errno::EMFILE)).unwrap();
        }
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Router::new(), None, stop.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_millis(500), server)
            .await
            .expect("stop should not wait for the backoff")
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn broken_listener_is_fatal() {
        use nix::errno::Errno;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (listener, failures) = ScriptedListener::new(listener);
        failures.send(io::Error::from(Errno::EBADF)).unwrap();
        let stop = CancellationToken::new();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            serve(listener, Router::new(), None, stop),
        )
        .await
        .expect("serve should fail")
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::EBADF as i32));
    }

    #[test]
    fn error_classification() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_resource_exhaustion(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(is_resource_exhaustion(&io::Error::from(io::ErrorKind::OutOfMemory)));
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            assert!(is_resource_exhaustion(&io::Error::from(Errno::EMFILE)));
            assert!(is_resource_exhaustion(&io::Error::from(Errno::ENFILE)));
            assert!(!is_resource_exhaustion(&io::Error::from(Errno::EBADF)));
        }
    }
}
