//! Embedded web bundle.
//!
//! The browser UI ships inside the binary; `/` is rendered per request
//! with the configured alias substituted into the page title.

pub const ALIAS_PLACEHOLDER: &str = "__ALICES_MIRROR_ALIAS__";

const INDEX_HTML: &str = include_str!("../../web/index.html");
const APP_JS: &str = include_str!("../../web/app.js");
const STYLE_CSS: &str = include_str!("../../web/style.css");

/// Index page with the alias placeholder replaced by the HTML-escaped
/// alias; an empty alias yields an empty substitution.
pub fn render_index(alias: &str) -> String {
    let alias = if alias.trim().is_empty() {
        String::new()
    } else {
        escape_html(alias)
    };
    INDEX_HTML.replace(ALIAS_PLACEHOLDER, &alias)
}

/// Look up a static asset by request path. Returns `(content type, body)`.
pub fn lookup(path: &str) -> Option<(&'static str, &'static str)> {
    match path.trim_start_matches('/') {
        "app.js" => Some(("text/javascript; charset=utf-8", APP_JS)),
        "style.css" => Some(("text/css; charset=utf-8", STYLE_CSS)),
        _ => None,
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
