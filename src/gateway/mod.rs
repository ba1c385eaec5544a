//! The live reload middleware.
//!
//! [`ReloadGateway`] wraps any [`Application`] and adds three things on top of it:
//!
//! - During lifespan startup and shutdown it starts and stops one [`WatchSession`] per
//!   [`WatchTarget`].
//! - WebSocket connections on the reserved path are answered by the gateway itself, sending a
//!   `reload` message to each client whenever a watched file changed.
//! - HTML responses of the wrapped application get a small script injected that connects to that
//!   WebSocket.
//!
//! Everything else goes to the wrapped application untouched.

mod inject;
mod lifespan;
mod socket;

use std::time::Duration;

use color_eyre::eyre::{ensure, Result, WrapErr};
use tokio::sync::Mutex;
use tracing::{error, info};

pub use self::socket::RELOAD_MESSAGE;
use crate::{
    broadcast::Broadcaster,
    config::GatewayConfig,
    protocol::{
        Application, Channel, Exchange, HttpExchange, LifespanExchange, WebSocketExchange,
        CHANNEL_SIZE,
    },
    script::ClientScript,
    watch::{WatchOptions, WatchSession, WatchTarget},
};

/// Path of the reload WebSocket, unless configured otherwise.
pub const DEFAULT_WS_PATH: &str = "/__reload__";
/// How long browsers wait before reconnecting to the reload WebSocket, unless configured
/// otherwise.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Live reload middleware around the application `A`.
pub struct ReloadGateway<A> {
    app: A,
    /// Reserved path, without trailing slashes.
    ws_path: String,
    broadcaster: Broadcaster,
    sessions: Mutex<Vec<WatchSession>>,
    script: ClientScript,
}

impl<A: Application> ReloadGateway<A> {
    #[must_use]
    pub fn builder(app: A) -> GatewayBuilder<A> {
        GatewayBuilder {
            app,
            targets: Vec::new(),
            ws_path: DEFAULT_WS_PATH.to_owned(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            options: WatchOptions::default(),
        }
    }

    /// The wrapped application.
    #[must_use]
    pub fn app(&self) -> &A {
        &self.app
    }

    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    #[must_use]
    pub fn ws_path(&self) -> &str {
        &self.ws_path
    }

    /// Start watching all targets. If any of them fails, the ones already started are stopped
    /// again.
    ///
    /// This is done automatically on lifespan startup, and only needs to be called by hosts that
    /// don't support lifespan events.
    pub async fn startup(&self) -> Result<()> {
        let mut sessions = self.sessions.lock().await;

        let res = sessions
            .iter_mut()
            .filter(|session| !session.is_running())
            .try_for_each(WatchSession::start);

        if let Err(e) = res {
            error!(error = ?e, "failed to start file watching");
            stop_all(&mut sessions).await.ok();
            return Err(e);
        }

        info!(
            paths = sessions.len(),
            ws_path = %self.ws_path,
            "live reload enabled"
        );
        Ok(())
    }

    /// Stop all running watch sessions. Every session is stopped even if some of them fail,
    /// returning the first error.
    ///
    /// This is done automatically on lifespan shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        stop_all(&mut sessions).await
    }

    fn is_reload_path(&self, path: &str) -> bool {
        normalize(path).eq_ignore_ascii_case(&self.ws_path)
    }

    /// Let the app handle the request, rewriting its response on the way back.
    async fn handle_http(&self, exchange: HttpExchange) -> Result<()> {
        let HttpExchange { scope, channel } = exchange;
        let (requests, host) = channel.into_parts();
        let (responses_tx, responses_rx) = flume::bounded(CHANNEL_SIZE);

        let exchange = Exchange::Http(HttpExchange {
            scope: scope.clone(),
            channel: Channel::from_parts(requests, responses_tx),
        });
        let rewriter = inject::Rewriter::new(host, || self.script.for_scope(&scope));

        let (called, rewritten) =
            tokio::join!(self.app.call(exchange), rewriter.run(responses_rx));

        called?;
        rewritten.wrap_err_with(|| format!("invalid response for `{}`", scope.path))
    }
}

impl<A: Application> Application for ReloadGateway<A> {
    async fn call(&self, exchange: Exchange) -> Result<()> {
        match exchange {
            Exchange::Lifespan(LifespanExchange { channel }) => {
                lifespan::pump(self, channel).await
            }
            Exchange::WebSocket(WebSocketExchange { scope, channel })
                if self.is_reload_path(&scope.path) =>
            {
                socket::serve(channel, &self.broadcaster).await
            }
            Exchange::Http(exchange) => self.handle_http(exchange).await,
            exchange @ Exchange::WebSocket(_) => self.app.call(exchange).await,
        }
    }
}

async fn stop_all(sessions: &mut [WatchSession]) -> Result<()> {
    let mut first = None;

    for session in sessions.iter_mut().filter(|session| session.is_running()) {
        if let Err(e) = session.stop().await {
            error!(
                error = ?e,
                path = %session.target().path().display(),
                "watch session failed"
            );
            first.get_or_insert(e);
        }
    }

    first.map_or(Ok(()), Err)
}

fn normalize(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// Configures and builds a [`ReloadGateway`].
pub struct GatewayBuilder<A> {
    app: A,
    targets: Vec<WatchTarget>,
    ws_path: String,
    reconnect_interval: Duration,
    options: WatchOptions,
}

impl<A: Application> GatewayBuilder<A> {
    /// Add a path to watch.
    #[must_use]
    pub fn watch(mut self, target: WatchTarget) -> Self {
        self.targets.push(target);
        self
    }

    #[must_use]
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = path.into();
        self
    }

    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Options shared by all watched paths.
    #[must_use]
    pub fn watch_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Take the reserved path and reconnect interval from a loaded configuration.
    #[must_use]
    pub fn config(mut self, config: &GatewayConfig) -> Self {
        self.ws_path.clone_from(&config.ws_path);
        self.reconnect_interval = config.reconnect_interval();
        self
    }

    pub fn build(self) -> Result<ReloadGateway<A>> {
        ensure!(
            self.ws_path.starts_with('/'),
            "reload path `{}` must start with a `/`",
            self.ws_path
        );
        ensure!(
            !normalize(&self.ws_path).is_empty(),
            "reload path can't be the root path"
        );
        ensure!(
            !self.reconnect_interval.is_zero(),
            "reconnect interval must be greater than zero"
        );

        let broadcaster = Broadcaster::new();
        let sessions = self
            .targets
            .into_iter()
            .map(|target| WatchSession::new(target, broadcaster.clone(), self.options))
            .collect();
        let ws_path = normalize(&self.ws_path).to_owned();

        Ok(ReloadGateway {
            app: self.app,
            script: ClientScript::new(ws_path.clone(), self.reconnect_interval),
            ws_path,
            broadcaster,
            sessions: Mutex::new(sessions),
        })
    }
}
