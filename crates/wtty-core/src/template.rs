//! Minimal `{{ .name }}` templates.
//!
//! Used for the window title format, the index page and the web manifest.
//! Only variable substitution is supported; anything else inside `{{ }}`
//! is rejected at parse time so a bad format fails at startup, not per
//! request.

use crate::error::{WttyError, WttyResult};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(String),
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `source`. `name` only appears in error messages.
    pub fn parse(name: &str, source: &str) -> WttyResult<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                WttyError::Template(format!("{name}: unclosed action in `{source}`"))
            })?;
            let expr = after[..end].trim();
            let var = expr.strip_prefix('.').filter(|v| is_ident(v)).ok_or_else(|| {
                WttyError::Template(format!(
                    "{name}: unsupported expression `{expr}` (expected `.name`)"
                ))
            })?;
            segments.push(Segment::Var(var.to_string()));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Render with raw substitution. Unknown variables render as empty.
    pub fn render(&self, vars: &HashMap<String, String>) -> String {
        self.render_with(vars, |v| v.to_string())
    }

    /// Render with HTML escaping applied to substituted values.
    pub fn render_html(&self, vars: &HashMap<String, String>) -> String {
        self.render_with(vars, escape_html)
    }

    fn render_with(&self, vars: &HashMap<String, String>, f: impl Fn(&str) -> String) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Var(v) => {
                    if let Some(value) = vars.get(v) {
                        out.push_str(&f(value));
                    }
                }
            }
        }
        out
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Escape the five HTML-significant characters.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn title_format() {
        let t = Template::parse("title", "{{ .command }}@{{ .hostname }}").unwrap();
        let out = t.render(&vars(&[("command", "bash"), ("hostname", "box")]));
        assert_eq!(out, "bash@box");
    }

    #[test]
    fn whitespace_is_optional() {
        let t = Template::parse("t", "[{{.a}}]").unwrap();
        assert_eq!(t.render(&vars(&[("a", "x")])), "[x]");
    }

    #[test]
    fn missing_variable_renders_empty() {
        let t = Template::parse("t", "a{{ .nope }}b").unwrap();
        assert_eq!(t.render(&HashMap::new()), "ab");
    }

    #[test]
    fn plain_text() {
        let t = Template::parse("t", "no actions here").unwrap();
        assert_eq!(t.render(&HashMap::new()), "no actions here");
    }

    #[test]
    fn unclosed_action_fails() {
        let err = Template::parse("title", "{{ .command ").unwrap_err();
        assert!(err.to_string().contains("unclosed"));
    }

    #[test]
    fn non_variable_expression_fails() {
        assert!(Template::parse("t", "{{ range .x }}").is_err());
        assert!(Template::parse("t", "{{ . }}").is_err());
        assert!(Template::parse("t", "{{ .1abc }}").is_err());
    }

    #[test]
    fn close_braces_in_text_are_literal() {
        let t = Template::parse("t", "a }} b").unwrap();
        assert_eq!(t.render(&HashMap::new()), "a }} b");
    }

    #[test]
    fn html_rendering_escapes_values_only() {
        let t = Template::parse("index", "<title>{{ .title }}</title>").unwrap();
        let out = t.render_html(&vars(&[("title", "<b>&'\"")]));
        assert_eq!(out, "<title>&lt;b&gt;&amp;&#39;&#34;</title>");
    }
}
