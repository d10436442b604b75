//! Gateway lifecycle: prepare, bind, serve, shut down, drain.
//!
//! A run ends on the first of:
//! - hard cancellation (the caller's token): the listener and every HTTP
//!   connection are dropped at once and sessions are told to stop;
//! - graceful shutdown (the caller's second token), an idle timeout, or
//!   the end of the single session in once mode: the gateway stops
//!   accepting and lets in-flight requests finish;
//! - a fatal accept error, which escalates to hard cancellation.
//!
//! In every case the run then waits for all sessions to unregister.

use crate::config::ServerConfig;
use crate::router::{self, AppState, Site};
use crate::serve::{self, Accept};
use crate::session::SessionFactory;
use crate::tls;
use crate::tracker::{ConnectionTracker, TrackerSignal};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::Networks;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument, Span};
use wtty_core::{WttyError, WttyResult};

/// Lifecycle phase, observable through [`BoundGateway::phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Running,
    Draining,
    Stopped,
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Graceful,
    IdleTimeout,
    SessionCompleted,
}

/// A validated gateway, ready to bind.
pub struct Gateway {
    config: Arc<ServerConfig>,
    factory: Arc<dyn SessionFactory>,
    site: Site,
    tls: Option<TlsAcceptor>,
    span: Span,
}

impl Gateway {
    /// Compile everything derived from `config`. Fails before any socket is
    /// opened.
    pub fn new(config: ServerConfig, factory: Arc<dyn SessionFactory>) -> WttyResult<Self> {
        config.validate()?;
        let site = Site::prepare(&config)?;

        let tls = if config.enable_tls {
            info!(cert = %config.tls_cert.display(), key = %config.tls_key.display(), "loading TLS material");
            let server_config = tls::build_server_config(
                &config.tls_cert,
                &config.tls_key,
                config.tls_client_ca.as_deref(),
            )?;
            Some(tls::acceptor(server_config))
        } else {
            None
        };

        let span = info_span!("gateway", command = %factory.name());
        Ok(Self {
            config: Arc::new(config),
            factory,
            site,
            tls,
            span,
        })
    }

    pub fn base_path(&self) -> &str {
        &self.site.base_path
    }

    /// Open the listening socket. Port 0 picks an ephemeral port.
    pub async fn bind(self) -> WttyResult<BoundGateway> {
        let addr = join_host_port(&self.config.address, self.config.port);
        if self.config.port == 0 {
            info!("port number configured to `0`, choosing a random port");
        }
        let listener = TcpListener::bind((self.config.address.as_str(), self.config.port))
            .await
            .map_err(|source| WttyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| WttyError::Bind { addr, source })?;

        let (phase_tx, _) = watch::channel(Phase::Running);
        Ok(BoundGateway {
            gateway: self,
            listener,
            local_addr,
            phase_tx,
        })
    }

    /// Bind, then run. See [`BoundGateway::run`].
    pub async fn run(
        self,
        cancel: CancellationToken,
        graceful: CancellationToken,
    ) -> WttyResult<StopReason> {
        self.bind().await?.run(cancel, graceful).await
    }
}

/// A gateway holding its listening socket.
pub struct BoundGateway {
    gateway: Gateway,
    listener: TcpListener,
    local_addr: SocketAddr,
    phase_tx: watch::Sender<Phase>,
}

impl BoundGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_path(&self) -> &str {
        &self.gateway.site.base_path
    }

    /// Full URL of the index page.
    pub fn url(&self) -> String {
        let scheme = if self.gateway.tls.is_some() { "https" } else { "http" };
        format!("{scheme}://{}{}", self.local_addr, self.base_path())
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Serve until shut down. `cancel` is the hard cancellation, `graceful`
    /// the graceful one.
    ///
    /// Returns `Ok` for graceful, idle-timeout and once-mode shutdowns,
    /// `Err(WttyError::Cancelled)` when `cancel` fired, and the serve error
    /// when accepting failed.
    pub async fn run(
        self,
        cancel: CancellationToken,
        graceful: CancellationToken,
    ) -> WttyResult<StopReason> {
        let BoundGateway {
            gateway,
            listener,
            local_addr,
            phase_tx,
        } = self;
        let span = gateway.span.clone();
        drive(gateway, listener, local_addr, phase_tx, cancel, graceful)
            .instrument(span)
            .await
    }
}

async fn drive<L: Accept>(
    gateway: Gateway,
    listener: L,
    local_addr: SocketAddr,
    phase_tx: watch::Sender<Phase>,
    cancel: CancellationToken,
    graceful: CancellationToken,
) -> WttyResult<StopReason> {
    let config = gateway.config.clone();

    if config.permit_write {
        info!("permitting clients to write input to the PTY");
    }
    if config.once {
        info!("once option is provided, accepting only one client");
    }

    let (tracker, mut signals) =
        ConnectionTracker::new(Duration::from_secs(config.timeout), config.once);
    // Child of the caller's token so a serve failure can escalate
    // without cancelling the caller.
    let hard = cancel.child_token();
    let stop_accepting = CancellationToken::new();

    let state = Arc::new(AppState {
        config: config.clone(),
        site: gateway.site.clone(),
        factory: gateway.factory.clone(),
        tracker: tracker.clone(),
        once_claimed: AtomicBool::new(false),
        hard_cancel: hard.clone(),
        span: gateway.span.clone(),
    });
    let app = router::build(state);

    let scheme = if gateway.tls.is_some() { "https" } else { "http" };
    let base_path = &gateway.site.base_path;
    info!(
        url = %format!("{scheme}://{local_addr}{base_path}"),
        "HTTP server is listening"
    );
    if local_addr.ip().is_unspecified() {
        for ip in alternative_addresses(local_addr.ip().is_ipv6()) {
            let host = join_host_port(&ip.to_string(), local_addr.port());
            info!(url = %format!("{scheme}://{host}{base_path}"), "alternative URL");
        }
    }

    let mut serve_task = tokio::spawn(
        serve::serve(listener, app, gateway.tls.clone(), stop_accepting.clone())
            .instrument(Span::current()),
    );

    let mut stopping: Option<StopReason> = None;
    let outcome = loop {
        tokio::select! {
            biased;
            _ = hard.cancelled() => {
                info!("hard cancellation, closing all connections");
                break Err(WttyError::Cancelled);
            }
            joined = &mut serve_task => {
                let result = joined.map_err(|e| std::io::Error::other(e.to_string()));
                match result.and_then(|r| r) {
                    Ok(()) => break Ok(stopping.unwrap_or(StopReason::Graceful)),
                    Err(e) => {
                        error!(error = %e, "server error, cancelling");
                        break Err(WttyError::Serve(e));
                    }
                }
            }
            _ = graceful.cancelled(), if stopping.is_none() => {
                info!("graceful shutdown requested, no longer accepting connections");
                stopping = Some(StopReason::Graceful);
                stop_accepting.cancel();
                advance(&phase_tx, Phase::Draining);
            }
            Some(signal) = signals.recv(), if stopping.is_none() => {
                let reason = match signal {
                    TrackerSignal::IdleTimeout => StopReason::IdleTimeout,
                    TrackerSignal::SessionCompleted => StopReason::SessionCompleted,
                };
                info!(?reason, "shutting down");
                stopping = Some(reason);
                stop_accepting.cancel();
                advance(&phase_tx, Phase::Draining);
            }
        }
    };

    if outcome.is_err() {
        serve_task.abort();
        hard.cancel();
    }
    advance(&phase_tx, Phase::Draining);

    let active = tracker.count();
    if active > 0 {
        info!(active, "waiting for connections to be closed");
    }
    tracker.wait().await;
    advance(&phase_tx, Phase::Stopped);
    info!("gateway stopped");

    outcome
}

/// Phases only move forward; repeated or backward transitions are no-ops.
fn advance(phase_tx: &watch::Sender<Phase>, next: Phase) {
    phase_tx.send_if_modified(|phase| {
        if next > *phase {
            *phase = next;
            true
        } else {
            false
        }
    });
}

/// Interface addresses a wildcard listener is reachable on. IPv6
/// addresses are listed only for an IPv6 wildcard.
fn alternative_addresses(include_v6: bool) -> Vec<IpAddr> {
    let networks = Networks::new_with_refreshed_list();
    let mut addresses: Vec<IpAddr> = networks
        .iter()
        .flat_map(|(_, data)| data.ip_networks().iter().map(|network| network.addr))
        .filter(|ip| !ip.is_unspecified() && (ip.is_ipv4() || include_v6))
        .collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
