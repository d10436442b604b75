//! Route table and shared request state.

use crate::access::{basic_auth, headers, logging, sso, BasicAuth, OriginMatcher, RemoteAddr, SsoGate};
use crate::config::ServerConfig;
use crate::handlers;
use crate::session::SessionFactory;
use crate::tracker::ConnectionTracker;
use crate::ws;
use axum::{middleware, routing::get, Router};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tracing::{info, Span};
use wtty_core::{random_string, Template, WttyError, WttyResult};

/// Make `path` start and end with `/`.
pub fn normalize_base_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 2);
    if !path.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(path);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Base path for this run: the configured path, or a fresh random one.
pub fn base_path(config: &ServerConfig) -> String {
    if config.random_url {
        normalize_base_path(&random_string(config.random_url_length))
    } else {
        normalize_base_path(&config.path)
    }
}

/// Everything compiled from the configuration before binding.
#[derive(Debug, Clone)]
pub struct Site {
    pub base_path: String,
    pub index: Template,
    pub manifest: Template,
    pub title: Template,
    pub origin: OriginMatcher,
    pub sso: Option<Arc<SsoGate>>,
    pub hostname: String,
}

impl Site {
    pub fn prepare(config: &ServerConfig) -> WttyResult<Self> {
        let base_path = base_path(config);

        let index_source = match config.index_file {
            Some(ref path) => std::fs::read_to_string(path).map_err(|e| {
                WttyError::Config(format!(
                    "failed to read custom index file at `{}`: {e}",
                    path.display()
                ))
            })?,
            None => handlers::embedded_text("index.html")?,
        };
        let index = Template::parse("index", &index_source)?;
        let manifest = Template::parse("manifest", &handlers::embedded_text("manifest.json")?)?;
        let title = Template::parse("title", &config.title_format)?;

        let origin = OriginMatcher::new(config.ws_origin.as_deref())?;
        let sso = match config.sso_url {
            Some(ref url) if !url.is_empty() => Some(Arc::new(SsoGate::new(
                url,
                &config.sso_token_key,
                &base_path,
            )?)),
            _ => None,
        };

        let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());

        Ok(Self {
            base_path,
            index,
            manifest,
            title,
            origin,
            sso,
            hostname,
        })
    }
}

/// State shared by every handler of one run.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub site: Site,
    pub factory: Arc<dyn SessionFactory>,
    pub tracker: Arc<ConnectionTracker>,
    /// Set by the first upgrade in once mode.
    pub once_claimed: AtomicBool,
    /// Fires on hard cancellation; sessions end when it does.
    pub hard_cancel: CancellationToken,
    /// Parent span for spawned session tasks.
    pub span: Span,
}

impl AppState {
    /// `command`, `hostname` and `remote_addr` for the title template.
    pub fn title_variables(&self, remote: RemoteAddr) -> HashMap<String, String> {
        HashMap::from([
            ("command".to_string(), self.factory.name().to_string()),
            ("hostname".to_string(), self.site.hostname.clone()),
            ("remote_addr".to_string(), remote.to_string()),
        ])
    }
}

/// Build the complete router for one run.
pub fn build(state: Arc<AppState>) -> Router {
    let base = state.site.base_path.clone();

    let mut site = Router::new()
        .route(&base, get(handlers::index))
        .route(&format!("{base}js/{{*path}}"), get(handlers::static_asset))
        .route(&format!("{base}css/{{*path}}"), get(handlers::static_asset))
        .route(&format!("{base}favicon.ico"), get(handlers::static_asset))
        .route(&format!("{base}icon.svg"), get(handlers::static_asset))
        .route(&format!("{base}icon_192.png"), get(handlers::static_asset))
        .route(&format!("{base}manifest.json"), get(handlers::manifest))
        .route(&format!("{base}auth_token.js"), get(handlers::auth_token_js))
        .route(&format!("{base}config.js"), get(handlers::config_js));

    if let Some(ref credential) = state.config.credential {
        info!("using basic authentication");
        site = site.layer(middleware::from_fn_with_state(
            Arc::new(BasicAuth::new(credential.clone())),
            basic_auth::require_basic_auth,
        ));
    }

    site = headers::with_security_headers(site).layer(CompressionLayer::new());

    if let Some(ref gate) = state.site.sso {
        info!(url = %gate.url(), "using SSO redirect");
        let callback = get(sso::sso_callback).with_state(gate.clone());
        site = site
            .route_service("/sso-login", callback.clone())
            .route_service("/sso-login/", callback.clone())
            .route_service("/sso-login/{*rest}", callback)
            .layer(middleware::from_fn_with_state(
                gate.clone(),
                sso::require_sso_token,
            ));
    }

    site.layer(middleware::from_fn(logging::log_requests))
        .route(&format!("{base}ws"), get(ws::upgrade))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Slave, SpawnParams};
    use axum::{
        body::Body,
        extract::Request,
        http::{header, StatusCode},
        response::Response,
    };
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoSessions;

    impl SessionFactory for NoSessions {
        fn name(&self) -> &str {
            "fake-cmd"
        }

        fn spawn(&self, _params: SpawnParams) -> WttyResult<Box<dyn Slave>> {
            Err(WttyError::Session("not in router tests".into()))
        }
    }

    fn app(config: ServerConfig) -> Router {
        let site = Site::prepare(&config).unwrap();
        let (tracker, _signals) = ConnectionTracker::new(Duration::ZERO, false);
        build(Arc::new(AppState {
            config: Arc::new(config),
            site,
            factory: Arc::new(NoSessions),
            tracker,
            once_claimed: AtomicBool::new(false),
            hard_cancel: CancellationToken::new(),
            span: Span::none(),
        }))
    }

    async fn get_uri(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn base_path_always_starts_and_ends_with_slash() {
        for (input, expected) in [
            ("", "/"),
            ("/", "/"),
            ("term", "/term/"),
            ("/term", "/term/"),
            ("term/", "/term/"),
            ("/a/b/", "/a/b/"),
        ] {
            assert_eq!(normalize_base_path(input), expected, "{input:?}");
        }
    }

    #[test]
    fn random_base_paths_differ_and_have_configured_length() {
        let config = ServerConfig {
            random_url: true,
            random_url_length: 12,
            ..ServerConfig::default()
        };
        let first = base_path(&config);
        let second = base_path(&config);
        assert_ne!(first, second);
        for path in [&first, &second] {
            assert!(path.starts_with('/') && path.ends_with('/'));
            let token = path.trim_matches('/');
            assert_eq!(token.len(), 12);
            assert!(token.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn bad_title_format_fails_preparation() {
        let config = ServerConfig {
            title_format: "{{ .command".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(Site::prepare(&config), Err(WttyError::Template(_))));
    }

    #[test]
    fn missing_index_file_names_the_path() {
        let config = ServerConfig {
            index_file: Some("/nonexistent/wtty/index.html".into()),
            ..ServerConfig::default()
        };
        let err = Site::prepare(&config).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/wtty/index.html"));
    }

    #[tokio::test]
    async fn index_renders_escaped_title() {
        let app = app(ServerConfig {
            title_format: "<{{ .command }}>".into(),
            ..ServerConfig::default()
        });
        let response = get_uri(&app, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::SERVER], "wtty");
        let body = body_text(response).await;
        assert!(body.contains("&lt;fake-cmd&gt;"), "{body}");
    }

    #[tokio::test]
    async fn routes_live_under_the_base_path() {
        let app = app(ServerConfig {
            path: "term".into(),
            ..ServerConfig::default()
        });
        assert_eq!(get_uri(&app, "/term/").await.status(), StatusCode::OK);
        assert_eq!(get_uri(&app, "/").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get_uri(&app, "/config.js").await.status(), StatusCode::NOT_FOUND);

        let manifest = body_text(get_uri(&app, "/term/manifest.json").await).await;
        let manifest: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(manifest["start_url"], "/term/");
    }

    #[tokio::test]
    async fn bootstrap_scripts_carry_configuration() {
        let app = app(ServerConfig {
            credential: Some("alice:secret".into()),
            ws_query_args: "x=1".into(),
            ..ServerConfig::default()
        });
        let auth = format!("Basic {}", STANDARD.encode("alice:secret"));
        let request = |uri: &str| {
            Request::builder()
                .uri(uri)
                .header(header::AUTHORIZATION, auth.clone())
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(request("/auth_token.js")).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/javascript");
        assert_eq!(
            body_text(response).await,
            "var gotty_auth_token = 'alice:secret';"
        );

        let response = app.clone().oneshot(request("/config.js")).await.unwrap();
        assert_eq!(
            body_text(response).await,
            "var gotty_term = 'xterm';\nvar gotty_ws_query_args = 'x=1';\n"
        );
    }

    #[tokio::test]
    async fn static_assets_have_content_types() {
        let app = app(ServerConfig::default());
        let response = get_uri(&app, "/js/wtty.js").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .contains("javascript"));

        let response = get_uri(&app, "/css/index.css").await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");

        assert_eq!(get_uri(&app, "/js/missing.js").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn basic_auth_guards_site_but_not_the_upgrade_endpoint() {
        let app = app(ServerConfig {
            credential: Some("alice:secret".into()),
            ..ServerConfig::default()
        });
        for uri in ["/", "/config.js", "/js/wtty.js"] {
            let response = get_uri(&app, uri).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
        // Not an upgrade, so rejected, but by the WebSocket extractor.
        assert_ne!(get_uri(&app, "/ws").await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sso_gate_redirects_index_only() {
        let app = app(ServerConfig {
            sso_url: Some("https://sso.example.com/login".into()),
            ..ServerConfig::default()
        });
        let response = get_uri(&app, "/").await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "https://sso.example.com/login");

        assert_eq!(get_uri(&app, "/?token=t").await.status(), StatusCode::OK);
        assert_eq!(get_uri(&app, "/config.js").await.status(), StatusCode::OK);

        let response = get_uri(&app, "/sso-login/cb?token=t").await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/?token=t");
    }
}
