//! A small Markdown site, serving every `*.md` file of a directory as HTML page.
//!
//! This is the application that `relive serve` wraps in a [`ReloadGateway`](crate::ReloadGateway).
//! Pages are rendered once and kept as an immutable snapshot. Reloading renders a complete new
//! snapshot and swaps it in, so requests always see either the old or the new set of pages.

use std::{
    collections::BTreeMap,
    ffi::OsStr,
    fmt::Write as _,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    body::Bytes,
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
};
use color_eyre::eyre::{Result, WrapErr};
use pulldown_cmark::{Options, Parser};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    protocol::{
        Application, Channel, Exchange, HttpExchange, LifespanEvent, LifespanExchange,
        LifespanReply, RequestEvent, ResponseMessage, SocketCommand, WebSocketExchange,
    },
    watch::WatchTarget,
};

const HTML: &str = "text/html; charset=utf-8";
const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";

/// Close code for refused WebSocket connections, as the site has none.
const UNSUPPORTED_DATA: u16 = 1003;

/// Rendered pages by name, which is the file name without the `.md` extension.
#[derive(Debug, Default)]
pub struct Pages {
    pages: BTreeMap<String, String>,
}

impl Pages {
    /// Render all Markdown files directly inside the directory. A missing directory has no pages.
    pub fn load(dir: &Path) -> Result<Self> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "pages directory doesn't exist");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed listing pages in `{}`", dir.display()))
            }
        };

        let mut pages = BTreeMap::new();

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(OsStr::to_str) != Some("md") || !path.is_file() {
                continue;
            }

            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let markdown = fs::read_to_string(&path)
                .wrap_err_with(|| format!("failed reading page `{}`", path.display()))?;

            pages.insert(name.to_owned(), render_markdown(&markdown));
        }

        Ok(Self { pages })
    }

    /// Rendered HTML content of a single page.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pages.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pages.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

fn render_markdown(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut html = String::with_capacity(markdown.len() * 3 / 2);
    pulldown_cmark::html::push_html(&mut html, Parser::new_ext(markdown, options));
    html
}

/// The Markdown site application.
pub struct PagesApp {
    dir: PathBuf,
    pages: watch::Sender<Arc<Pages>>,
}

impl PagesApp {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pages: watch::channel(Arc::default()).0,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The current set of pages.
    #[must_use]
    pub fn pages(&self) -> Arc<Pages> {
        Arc::clone(&self.pages.borrow())
    }

    /// Render all pages from scratch and replace the current ones.
    pub fn reload(&self) -> Result<()> {
        let pages = Pages::load(&self.dir)?;
        info!(count = pages.len(), dir = %self.dir.display(), "loaded pages");

        self.pages.send_replace(Arc::new(pages));
        Ok(())
    }

    /// Watch the pages directory, reloading the pages on every change.
    #[must_use]
    pub fn watch_target(self: &Arc<Self>) -> WatchTarget {
        let app = Arc::clone(self);

        WatchTarget::new(&self.dir).on_reload(move || {
            let app = Arc::clone(&app);
            async move { app.reload() }
        })
    }

    async fn lifespan(&self, channel: Channel<LifespanEvent, LifespanReply>) -> Result<()> {
        while let Ok(event) = channel.recv().await {
            let reply = match event {
                LifespanEvent::Startup => match self.reload() {
                    Ok(()) => LifespanReply::StartupComplete,
                    Err(e) => LifespanReply::StartupFailed {
                        message: format!("{e:#}"),
                    },
                },
                LifespanEvent::Shutdown => LifespanReply::ShutdownComplete,
            };

            channel.send(reply).await?;

            if event == LifespanEvent::Shutdown {
                break;
            }
        }

        Ok(())
    }

    async fn http(&self, exchange: HttpExchange) -> Result<()> {
        let HttpExchange { scope, channel } = exchange;

        if scope.method != Method::GET && scope.method != Method::HEAD {
            return respond(
                &channel,
                StatusCode::METHOD_NOT_ALLOWED,
                TEXT,
                "method not allowed",
            )
            .await;
        }

        let pages = self.pages();
        let (status, content_type, body) = match scope.path.as_str() {
            "/" => match pages.get("README") {
                Some(content) => (StatusCode::OK, HTML, page("README", content)),
                None => (StatusCode::OK, HTML, index(&pages)),
            },
            "/api/pages" => {
                let names = pages.names().collect::<Vec<_>>();
                let json = serde_json::to_string(&serde_json::json!({ "pages": names }))?;
                (StatusCode::OK, JSON, json)
            }
            "/stripped" => (StatusCode::OK, HTML, stripped()),
            path => match path
                .strip_prefix('/')
                .filter(|name| !name.contains('/'))
                .and_then(|name| pages.get(name).map(|content| (name, content)))
            {
                Some((name, content)) => (StatusCode::OK, HTML, page(name, content)),
                None => (StatusCode::NOT_FOUND, TEXT, "page not found".to_owned()),
            },
        };

        debug!(path = %scope.path, %status, "serving request");
        respond(&channel, status, content_type, body).await
    }

    async fn websocket(&self, exchange: WebSocketExchange) -> Result<()> {
        let WebSocketExchange { scope, channel } = exchange;

        channel.recv().await?;
        channel
            .send(SocketCommand::Close {
                code: UNSUPPORTED_DATA,
            })
            .await?;

        debug!(path = %scope.path, "refused websocket connection");
        Ok(())
    }
}

impl Application for PagesApp {
    async fn call(&self, exchange: Exchange) -> Result<()> {
        match exchange {
            Exchange::Lifespan(LifespanExchange { channel }) => self.lifespan(channel).await,
            Exchange::Http(exchange) => self.http(exchange).await,
            Exchange::WebSocket(exchange) => self.websocket(exchange).await,
        }
    }
}

async fn respond(
    channel: &Channel<RequestEvent, ResponseMessage>,
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Result<()> {
    let body = body.into();

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    channel
        .send(ResponseMessage::Start { status, headers })
        .await?;
    channel.send(ResponseMessage::last(body)).await?;

    Ok(())
}

/// Full HTML document around rendered page content.
fn page(title: &str, content: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n\
         <body>\n<main>\n{content}</main>\n</body>\n</html>\n",
        escape(title)
    )
}

/// Listing of all pages, used when there is no `README` page.
fn index(pages: &Pages) -> String {
    let mut list = String::from("<h1>Pages</h1>\n<ul>\n");

    for name in pages.names() {
        let name = escape(name);
        writeln!(&mut list, "<li><a href=\"/{name}\">{name}</a></li>").ok();
    }

    list.push_str("</ul>\n");
    page("Pages", &list)
}

/// A bare HTML fragment, without any document structure.
fn stripped() -> String {
    "<h1>Stripped</h1>\n<p>This page has no body element.</p>\n".to_owned()
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }

    escaped
}
