//! Site handlers: index, manifest, bootstrap scripts and embedded assets.

use crate::access::RemoteAddr;
use crate::router::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
};
use rust_embed::RustEmbed;
use std::collections::HashMap;
use std::sync::Arc;
use wtty_core::{WttyError, WttyResult};

/// Files under `static/`, compiled into the binary.
#[derive(RustEmbed)]
#[folder = "static/"]
pub struct Assets;

/// Contents of an embedded text asset.
pub fn embedded_text(path: &str) -> WttyResult<String> {
    let file = Assets::get(path)
        .ok_or_else(|| WttyError::Other(format!("embedded asset `{path}` is missing")))?;
    String::from_utf8(file.data.into_owned())
        .map_err(|e| WttyError::Other(format!("embedded asset `{path}` is not UTF-8: {e}")))
}

pub async fn index(State(state): State<Arc<AppState>>, remote: RemoteAddr) -> Html<String> {
    let title = state.site.title.render(&state.title_variables(remote));
    let vars = HashMap::from([("title".to_string(), title)]);
    Html(state.site.index.render_html(&vars))
}

pub async fn manifest(State(state): State<Arc<AppState>>) -> Response {
    let vars = HashMap::from([("pathPrefix".to_string(), state.site.base_path.clone())]);
    (
        [(header::CONTENT_TYPE, "application/manifest+json")],
        state.site.manifest.render(&vars),
    )
        .into_response()
}

pub async fn auth_token_js(State(state): State<Arc<AppState>>) -> Response {
    javascript(format!(
        "var gotty_auth_token = '{}';",
        js_escape(state.config.auth_token())
    ))
}

pub async fn config_js(State(state): State<Arc<AppState>>) -> Response {
    javascript(format!(
        "var gotty_term = '{}';\nvar gotty_ws_query_args = '{}';\n",
        js_escape(&state.config.term),
        js_escape(&state.config.ws_query_args),
    ))
}

/// Serve `static/<path relative to the base path>`.
pub async fn static_asset(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let Some(relative) = uri.path().strip_prefix(state.site.base_path.as_str()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match Assets::get(relative) {
        Some(file) => {
            let mime = mime_guess::from_path(relative).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.essence_str().to_string())], file.data).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn javascript(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/javascript")], body).into_response()
}

/// Escape for a single-quoted JavaScript string inside a `<script>` tag.
fn js_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '<' => out.push_str("\\x3c"),
            '>' => out.push_str("\\x3e"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_escape_keeps_strings_closed() {
        assert_eq!(js_escape("plain:pass"), "plain:pass");
        assert_eq!(js_escape(r"it's\"), r"it\'s\\");
        assert_eq!(js_escape("</script>"), r"\x3c/script\x3e");
    }

    #[test]
    fn bundled_templates_are_present() {
        assert!(embedded_text("index.html").unwrap().contains("{{ .title }}"));
        assert!(embedded_text("manifest.json").unwrap().contains("{{ .pathPrefix }}"));
        assert!(embedded_text("nope.txt").is_err());
    }
}
