//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use wtty_core::{WttyError, WttyResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    /// Passed through to the browser terminal untouched.
    #[serde(default)]
    pub preferences: toml::Table,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub random_url: bool,
    #[serde(default = "default_random_url_length")]
    pub random_url_length: usize,
    /// Seconds without any connected client before the server exits. 0 disables.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub once: bool,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub index_file: Option<String>,
    #[serde(default = "default_title_format")]
    pub title_format: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            path: default_path(),
            random_url: false,
            random_url_length: default_random_url_length(),
            timeout: 0,
            once: false,
            max_connections: 0,
            index_file: None,
            title_format: default_title_format(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// `user:password` for Basic Authentication.
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub sso_url: Option<String>,
    #[serde(default = "default_sso_token_key")]
    pub sso_token_key: String,
    /// Regular expression the WebSocket `Origin` header must match.
    #[serde(default)]
    pub ws_origin: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            credential: None,
            sso_url: None,
            sso_token_key: default_sso_token_key(),
            ws_origin: None,
        }
    }
}

/// `[tls]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
    /// CA bundle for client certificates. Enables mutual TLS.
    #[serde(default)]
    pub client_ca: Option<String>,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: default_cert_path(),
            key: default_key_path(),
            client_ca: None,
        }
    }
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default)]
    pub permit_write: bool,
    #[serde(default)]
    pub permit_arguments: bool,
    #[serde(default)]
    pub pass_headers: bool,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default = "default_reconnect_time")]
    pub reconnect_time: u64,
    /// Fixed column count, 0 follows the browser window.
    #[serde(default)]
    pub width: u16,
    #[serde(default)]
    pub height: u16,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default)]
    pub ws_query_args: String,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            permit_write: false,
            permit_arguments: false,
            pass_headers: false,
            reconnect: false,
            reconnect_time: default_reconnect_time(),
            width: 0,
            height: 0,
            term: default_term(),
            ws_query_args: String::new(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/".to_string()
}
fn default_random_url_length() -> usize {
    8
}
fn default_title_format() -> String {
    "{{ .command }}@{{ .hostname }}".to_string()
}
fn default_sso_token_key() -> String {
    "token".to_string()
}
fn default_cert_path() -> String {
    "~/.wtty/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.wtty/key.pem".to_string()
}
fn default_reconnect_time() -> u64 {
    10
}
fn default_term() -> String {
    "xterm".to_string()
}

/// Values given on the command line. `None`/`false` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub random_url: bool,
    pub random_url_length: Option<usize>,
    pub credential: Option<String>,
    pub tls: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_client_ca: Option<String>,
    pub sso_url: Option<String>,
    pub sso_token_key: Option<String>,
    pub ws_origin: Option<String>,
    pub timeout: Option<u64>,
    pub once: bool,
    pub max_connections: Option<usize>,
    pub permit_write: bool,
    pub permit_arguments: bool,
    pub pass_headers: bool,
    pub reconnect: bool,
    pub reconnect_time: Option<u64>,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub term: Option<String>,
    pub ws_query_args: Option<String>,
    pub title_format: Option<String>,
    pub index_file: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub path: String,
    pub random_url: bool,
    pub random_url_length: usize,
    pub credential: Option<String>,
    pub enable_tls: bool,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub tls_client_ca: Option<PathBuf>,
    pub sso_url: Option<String>,
    pub sso_token_key: String,
    pub ws_origin: Option<String>,
    pub timeout: u64,
    pub once: bool,
    pub max_connections: usize,
    pub permit_write: bool,
    pub permit_arguments: bool,
    pub pass_headers: bool,
    pub enable_reconnect: bool,
    pub reconnect_time: u64,
    pub width: u16,
    pub height: u16,
    pub term: String,
    pub ws_query_args: String,
    pub title_format: String,
    pub index_file: Option<PathBuf>,
    pub preferences: serde_json::Value,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> WttyResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content).map_err(|e| {
                        WttyError::Config(format!(
                            "failed to parse config file `{}`: {e}",
                            expanded.display()
                        ))
                    })?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config);
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile) -> Self {
        let preferences = serde_json::to_value(&file.preferences)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
        Self {
            address: file.server.address,
            port: file.server.port,
            path: file.server.path,
            random_url: file.server.random_url,
            random_url_length: file.server.random_url_length,
            credential: file.auth.credential,
            enable_tls: file.tls.enabled,
            tls_cert: expand_tilde_str(&file.tls.cert),
            tls_key: expand_tilde_str(&file.tls.key),
            tls_client_ca: file.tls.client_ca.as_deref().map(expand_tilde_str),
            sso_url: file.auth.sso_url,
            sso_token_key: file.auth.sso_token_key,
            ws_origin: file.auth.ws_origin,
            timeout: file.server.timeout,
            once: file.server.once,
            max_connections: file.server.max_connections,
            permit_write: file.terminal.permit_write,
            permit_arguments: file.terminal.permit_arguments,
            pass_headers: file.terminal.pass_headers,
            enable_reconnect: file.terminal.reconnect,
            reconnect_time: file.terminal.reconnect_time,
            width: file.terminal.width,
            height: file.terminal.height,
            term: file.terminal.term,
            ws_query_args: file.terminal.ws_query_args,
            title_format: file.server.title_format,
            index_file: file.server.index_file.as_deref().map(expand_tilde_str),
            preferences,
        }
    }

    fn apply(&mut self, o: ConfigOverrides) {
        if let Some(v) = o.address {
            self.address = v;
        }
        if let Some(v) = o.port {
            self.port = v;
        }
        if let Some(v) = o.path {
            self.path = v;
        }
        self.random_url |= o.random_url;
        if let Some(v) = o.random_url_length {
            self.random_url_length = v;
        }
        if o.credential.is_some() {
            self.credential = o.credential;
        }
        self.enable_tls |= o.tls;
        if let Some(v) = o.tls_cert {
            self.tls_cert = expand_tilde_str(&v);
        }
        if let Some(v) = o.tls_key {
            self.tls_key = expand_tilde_str(&v);
        }
        if let Some(v) = o.tls_client_ca {
            self.tls_client_ca = Some(expand_tilde_str(&v));
        }
        if o.sso_url.is_some() {
            self.sso_url = o.sso_url;
        }
        if let Some(v) = o.sso_token_key {
            self.sso_token_key = v;
        }
        if o.ws_origin.is_some() {
            self.ws_origin = o.ws_origin;
        }
        if let Some(v) = o.timeout {
            self.timeout = v;
        }
        self.once |= o.once;
        if let Some(v) = o.max_connections {
            self.max_connections = v;
        }
        self.permit_write |= o.permit_write;
        self.permit_arguments |= o.permit_arguments;
        self.pass_headers |= o.pass_headers;
        self.enable_reconnect |= o.reconnect;
        if let Some(v) = o.reconnect_time {
            self.reconnect_time = v;
        }
        if let Some(v) = o.width {
            self.width = v;
        }
        if let Some(v) = o.height {
            self.height = v;
        }
        if let Some(v) = o.term {
            self.term = v;
        }
        if let Some(v) = o.ws_query_args {
            self.ws_query_args = v;
        }
        if let Some(v) = o.title_format {
            self.title_format = v;
        }
        if let Some(v) = o.index_file {
            self.index_file = Some(expand_tilde_str(&v));
        }
    }

    /// Reject combinations that cannot produce a working server.
    pub fn validate(&self) -> WttyResult<()> {
        if self.tls_client_ca.is_some() && !self.enable_tls {
            return Err(WttyError::Config(
                "TLS client authentication is enabled, but TLS is not enabled".into(),
            ));
        }
        if self.random_url && self.random_url_length == 0 {
            return Err(WttyError::Config(
                "random URL length must be greater than zero".into(),
            ));
        }
        if let Some(ref credential) = self.credential {
            if !credential.contains(':') {
                return Err(WttyError::Config(
                    "credential must be in the form `user:password`".into(),
                ));
            }
        }
        if !self.random_url {
            validate_base_path(&self.path)?;
        }
        if self.sso_token_key.is_empty() {
            return Err(WttyError::Config("SSO token key must not be empty".into()));
        }
        Ok(())
    }

    /// Credential clients must echo back in the WebSocket init message.
    pub fn auth_token(&self) -> &str {
        self.credential.as_deref().unwrap_or("")
    }
}

/// The base path becomes a literal route prefix, so router pattern syntax
/// is not allowed in it.
fn validate_base_path(path: &str) -> WttyResult<()> {
    let pattern_like = path.contains(['{', '}'])
        || path
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.starts_with('*'));
    if pattern_like {
        return Err(WttyError::Config(format!(
            "base path `{path}` must not contain `{{`, `}}` or segments starting with `:` or `*`"
        )));
    }
    Ok(())
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
