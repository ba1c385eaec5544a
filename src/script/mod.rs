//! The browser side of live reloading: a small inline script that connects back to the reload
//! WebSocket and refreshes the page when told to.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use axum::{body::Bytes, http::header::HOST};
use once_cell::sync::Lazy;

use crate::protocol::{RequestScope, Scheme};

/// Upper bound of cached script tags. The URL depends on the `Host` header a client sends, so the
/// cache is dropped once it reaches this size.
const CACHE_LIMIT: usize = 32;

/// Parsed form of `client.js`.
static TEMPLATE: Lazy<Vec<Segment>> = Lazy::new(|| parse(include_str!("client.js")));

#[derive(Debug, Eq, PartialEq)]
enum Segment {
    Text(&'static str),
    /// `{{url}}`, the WebSocket endpoint as JS string literal.
    Url,
    /// `{{reconnect_interval}}`, in seconds.
    ReconnectInterval,
}

/// Split the template at its `{{name}}` placeholders. Unknown placeholders are kept as text.
fn parse(mut template: &'static str) -> Vec<Segment> {
    let mut segments = Vec::new();

    while let Some(start) = template.find("{{") {
        let Some(len) = template[start..].find("}}") else {
            break;
        };
        let end = start + len + 2;

        let placeholder = match template[start + 2..start + len].trim() {
            "url" => Segment::Url,
            "reconnect_interval" => Segment::ReconnectInterval,
            _ => {
                segments.push(Segment::Text(&template[..end]));
                template = &template[end..];
                continue;
            }
        };

        segments.push(Segment::Text(&template[..start]));
        segments.push(placeholder);
        template = &template[end..];
    }

    segments.push(Segment::Text(template));
    segments
}

/// Renders the `<script>` tag that gets injected into HTML pages.
pub struct ClientScript {
    ws_path: String,
    reconnect_interval: Duration,
    /// Rendered tags by WebSocket URL, at most [`CACHE_LIMIT`] of them.
    cache: Mutex<HashMap<String, Bytes>>,
}

impl ClientScript {
    #[must_use]
    pub fn new(ws_path: impl Into<String>, reconnect_interval: Duration) -> Self {
        Lazy::force(&TEMPLATE);

        Self {
            ws_path: ws_path.into(),
            reconnect_interval,
            cache: Mutex::default(),
        }
    }

    /// The script tag for a page served within the given scope.
    #[must_use]
    pub fn for_scope(&self, scope: &RequestScope) -> Bytes {
        self.render(&self.url(scope))
    }

    /// WebSocket URL of the reload endpoint, as seen from a page served within the given scope.
    ///
    /// The host is taken from the `Host` header the browser sent, falling back to the address the
    /// server accepted the connection on.
    #[must_use]
    pub fn url(&self, scope: &RequestScope) -> String {
        let scheme = match scope.scheme {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        };

        let authority = scope
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
            .or_else(|| {
                scope.server.as_ref().map(|(host, port)| {
                    if host.contains(':') {
                        format!("[{host}]:{port}")
                    } else {
                        format!("{host}:{port}")
                    }
                })
            })
            .unwrap_or_else(|| "localhost".to_owned());

        format!("{scheme}://{authority}{}", self.ws_path)
    }

    /// The script tag, connecting to the given WebSocket URL.
    #[must_use]
    pub fn render(&self, url: &str) -> Bytes {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(script) = cache.get(url) {
            return script.clone();
        }

        let script = Bytes::from(self.render_uncached(url));
        if cache.len() >= CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(url.to_owned(), script.clone());
        script
    }

    fn render_uncached(&self, url: &str) -> String {
        let mut script = String::from(r#"<script type="text/javascript">"#);

        for segment in TEMPLATE.iter() {
            match segment {
                Segment::Text(text) => script.push_str(text),
                Segment::Url => script.push_str(&js_string(url)),
                Segment::ReconnectInterval => {
                    script.push_str(&self.reconnect_interval.as_secs_f64().to_string());
                }
            }
        }

        script.push_str("</script>");
        script
    }
}

/// Encode the value as JS string literal that is safe to embed in a `<script>` element.
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_default()
        .replace("</", r"<\/")
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn script() -> ClientScript {
        ClientScript::new("/__reload__", Duration::from_millis(1500))
    }

    #[test]
    fn parse_placeholders() {
        assert_eq!(
            vec![
                Segment::Text("a "),
                Segment::Url,
                Segment::Text(" b "),
                Segment::ReconnectInterval,
                Segment::Text(" {{other}}"),
                Segment::Text(" c"),
            ],
            parse("a {{url}} b {{ reconnect_interval }} {{other}} c")
        );
        assert_eq!(vec![Segment::Text("x {{ y")], parse("x {{ y"));
    }

    #[test]
    fn template_has_both_placeholders() {
        assert!(TEMPLATE.contains(&Segment::Url));
        assert!(TEMPLATE.contains(&Segment::ReconnectInterval));
    }

    #[test]
    fn url_from_host_header() {
        let mut scope = RequestScope::get("/");
        scope
            .headers
            .insert(HOST, HeaderValue::from_static("example.test:3000"));
        scope.server = Some(("127.0.0.1".to_owned(), 8080));

        assert_eq!("ws://example.test:3000/__reload__", script().url(&scope));
    }

    #[test]
    fn url_from_server_address() {
        let mut scope = RequestScope::get("/");
        scope.scheme = Scheme::Https;
        scope.server = Some(("127.0.0.1".to_owned(), 8443));
        assert_eq!("wss://127.0.0.1:8443/__reload__", script().url(&scope));

        scope.server = Some(("::1".to_owned(), 8443));
        assert_eq!("wss://[::1]:8443/__reload__", script().url(&scope));

        scope.server = None;
        assert_eq!("wss://localhost/__reload__", script().url(&scope));
    }

    #[test]
    fn render_fills_placeholders() {
        let rendered = script().render("ws://localhost:8080/__reload__");
        let rendered = std::str::from_utf8(&rendered).unwrap();

        assert!(rendered.starts_with(r#"<script type="text/javascript">"#));
        assert!(rendered.ends_with("</script>"));
        assert!(rendered.contains(r#"const url = "ws://localhost:8080/__reload__";"#));
        assert!(rendered.contains("const reconnectInterval = 1.5;"));
        assert!(rendered.contains("window.location.reload()"));
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn render_is_cached_per_url() {
        let script = script();
        let a = script.render("ws://a/__reload__");
        let b = script.render("ws://a/__reload__");
        let c = script.render("ws://c/__reload__");

        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_ne!(a, c);
    }

    #[test]
    fn render_cache_is_bounded() {
        let script = script();
        for port in 0..100 {
            let url = format!("ws://example.test:{port}/__reload__");
            assert!(script.render(&url).starts_with(b"<script"));
        }

        assert!(script.cache.lock().unwrap().len() <= CACHE_LIMIT);
    }

    #[test]
    fn url_cannot_break_out_of_the_script() {
        assert_eq!(r#""a\"b<\/script>""#, js_string(r#"a"b</script>"#));
    }
}
