//! wtty: share a terminal command over HTTP and WebSocket.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wtty_core::WttyError;
use wtty_server::config::expand_tilde;
use wtty_server::session::{CommandFactory, CommandOptions};
use wtty_server::{ConfigOverrides, Gateway, ServerConfig};

/// wtty: share your terminal as a web application
#[derive(Parser, Debug)]
#[command(name = "wtty", version, about = "Share your terminal as a web application")]
struct Cli {
    /// IP address to listen on
    #[arg(short, long)]
    address: Option<String>,

    /// Port number to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Base path of the site
    #[arg(long)]
    path: Option<String>,

    /// Add a random string to the URL
    #[arg(short, long)]
    random_url: bool,

    /// Length of the random string in the URL
    #[arg(long)]
    random_url_length: Option<usize>,

    /// Credential for Basic Authentication (user:password)
    #[arg(short, long)]
    credential: Option<String>,

    /// Enable TLS/SSL
    #[arg(short, long)]
    tls: bool,

    /// TLS/SSL certificate file path
    #[arg(long)]
    tls_crt: Option<String>,

    /// TLS/SSL key file path
    #[arg(long)]
    tls_key: Option<String>,

    /// CA certificate file for client certificates (enables mutual TLS)
    #[arg(long)]
    tls_ca_crt: Option<String>,

    /// Generate a self-signed certificate under ~/.wtty and use it
    #[arg(long)]
    generate_cert: bool,

    /// Redirect to this SSO URL when the index has no token
    #[arg(long)]
    sso_url: Option<String>,

    /// Query parameter carrying the SSO token
    #[arg(long)]
    sso_token_key: Option<String>,

    /// Regular expression matching allowed WebSocket origins
    #[arg(long)]
    ws_origin: Option<String>,

    /// Exit when no client connects for this many seconds (0 disables)
    #[arg(long)]
    timeout: Option<u64>,

    /// Accept only one client and exit when it disconnects
    #[arg(long)]
    once: bool,

    /// Maximum concurrent connections (0 is unlimited)
    #[arg(long)]
    max_connection: Option<usize>,

    /// Permit clients to write to the TTY
    #[arg(short = 'w', long)]
    permit_write: bool,

    /// Permit clients to append command line arguments with `?arg=...`
    #[arg(long)]
    permit_arguments: bool,

    /// Pass HTTP request headers to the command as HTTP_* environment variables
    #[arg(long)]
    pass_headers: bool,

    /// Enable reconnection
    #[arg(long)]
    reconnect: bool,

    /// Seconds to wait before reconnecting
    #[arg(long)]
    reconnect_time: Option<u64>,

    /// Fixed terminal width in columns (0 follows the browser)
    #[arg(long)]
    width: Option<u16>,

    /// Fixed terminal height in rows (0 follows the browser)
    #[arg(long)]
    height: Option<u16>,

    /// Terminal type reported to the browser client
    #[arg(long)]
    term: Option<String>,

    /// Query string the browser client appends to the WebSocket URL
    #[arg(long)]
    ws_query_args: Option<String>,

    /// Window title format
    #[arg(long)]
    title_format: Option<String>,

    /// Custom index.html file
    #[arg(long)]
    index: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.wtty/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command to run for each session
    #[arg(required = true)]
    command: String,

    /// Arguments for the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            address: self.address.clone(),
            port: self.port,
            path: self.path.clone(),
            random_url: self.random_url,
            random_url_length: self.random_url_length,
            credential: self.credential.clone(),
            tls: self.tls,
            tls_cert: self.tls_crt.clone(),
            tls_key: self.tls_key.clone(),
            tls_client_ca: self.tls_ca_crt.clone(),
            sso_url: self.sso_url.clone(),
            sso_token_key: self.sso_token_key.clone(),
            ws_origin: self.ws_origin.clone(),
            timeout: self.timeout,
            once: self.once,
            max_connections: self.max_connection,
            permit_write: self.permit_write,
            permit_arguments: self.permit_arguments,
            pass_headers: self.pass_headers,
            reconnect: self.reconnect,
            reconnect_time: self.reconnect_time,
            width: self.width,
            height: self.height,
            term: self.term.clone(),
            ws_query_args: self.ws_query_args.clone(),
            title_format: self.title_format.clone(),
            index_file: self.index.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), command = %cli.command, "starting wtty");

    let mut overrides = cli.overrides();
    if cli.generate_cert {
        let dir = expand_tilde(&PathBuf::from("~/.wtty"));
        match wtty_server::tls::generate_self_signed_cert(&dir) {
            Ok((cert, key)) => {
                info!(cert = %cert.display(), key = %key.display(), "generated self-signed certificate");
                overrides.tls = true;
                overrides.tls_cert = Some(cert.to_string_lossy().into_owned());
                overrides.tls_key = Some(key.to_string_lossy().into_owned());
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    }

    let config = match ServerConfig::load(Some(&PathBuf::from(&cli.config)), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let factory = match CommandFactory::new(CommandOptions {
        command: cli.command.clone(),
        args: cli.args.clone(),
        permit_arguments: config.permit_arguments,
    }) {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "invalid command");
            std::process::exit(1);
        }
    };

    let gateway = match Gateway::new(config, Arc::new(factory)) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let graceful = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone(), graceful.clone()));

    match gateway.run(cancel, graceful).await {
        Ok(reason) => info!(?reason, "wtty stopped"),
        Err(WttyError::Cancelled) => {
            warn!("wtty stopped by hard cancellation");
        }
        Err(e) => {
            error!(error = %e, "server error");
            std::process::exit(1);
        }
    }
}

/// First SIGINT/SIGTERM starts a graceful shutdown, the second one cancels
/// everything.
async fn watch_signals(cancel: CancellationToken, graceful: CancellationToken) {
    if shutdown_signal().await.is_err() {
        return;
    }
    info!("received shutdown signal, draining (send again to force)");
    graceful.cancel();

    if shutdown_signal().await.is_err() {
        return;
    }
    warn!("received second shutdown signal, closing all connections");
    cancel.cancel();
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
