//! Local server, driving an [`Application`] over real HTTP and WebSocket connections.
//!
//! Every request is turned into an [`Exchange`] and run on its own task. Lifespan startup is
//! completed before the first connection is accepted, and shutdown after the last one is gone.

use std::{convert::Infallible, future::IntoFuture, net::Ipv4Addr, sync::Arc};

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, Utf8Bytes, WebSocket},
        Request, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Router,
};
use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_shutdown::Shutdown;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    self, Application, Channel, Exchange, Frame, HttpExchange, LifespanEvent, LifespanExchange,
    LifespanReply, RequestEvent, RequestScope, ResponseMessage, Scheme, SocketCommand,
    SocketEvent, WebSocketExchange,
};

/// Close code sent when a connection ends without the application choosing one.
const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code for a close frame without any code.
const NO_STATUS: u16 = 1005;

/// Serve the application on the given local port, until a shutdown signal arrives.
pub fn run<A: Application>(app: A, port: u16) -> Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(serve(Arc::new(app), port))
}

pub async fn serve<A: Application>(app: Arc<A>, port: u16) -> Result<()> {
    let shutdown = Shutdown::new()?;

    // Always run on localhost only. It's a bad idea to publicly expose this server,
    // due to only doing the basics in terms of security.
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
    let addr = listener.local_addr()?;

    let lifespan = Lifespan::startup(&app).await?;
    let router = router(app, Some((addr.ip().to_string(), addr.port())));

    info!(%addr, "listening for connections");
    let server = axum::serve(listener, router).into_future();

    let res = tokio::select! {
        r = server => r.wrap_err("server failed"),
        () = shutdown.handle() => Ok(()),
    };

    debug!("server shut down");
    lifespan.shutdown().await?;

    res
}

/// Create a router that hands every request to the application. `server` is the address
/// reported to the application as where the connection was accepted.
pub fn router<A: Application>(app: Arc<A>, server: Option<(String, u16)>) -> Router {
    Router::new()
        .fallback(dispatch::<A>)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { app, server })
}

struct AppState<A> {
    app: Arc<A>,
    server: Option<(String, u16)>,
}

impl<A> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
            server: self.server.clone(),
        }
    }
}

/// The application's side of lifespan handling, kept alive for the whole time the server runs.
struct Lifespan {
    channel: Channel<LifespanReply, LifespanEvent>,
    task: JoinHandle<Result<()>>,
}

impl Lifespan {
    async fn startup<A: Application>(app: &Arc<A>) -> Result<Self> {
        let (app_side, channel) = protocol::channel();
        let task = tokio::spawn({
            let app = Arc::clone(app);
            async move {
                app.call(Exchange::Lifespan(LifespanExchange { channel: app_side }))
                    .await
            }
        });

        let lifespan = Self { channel, task };

        match lifespan.ask(LifespanEvent::Startup).await {
            Some(LifespanReply::StartupComplete) => debug!("application started"),
            Some(LifespanReply::StartupFailed { message }) => {
                lifespan.join().await.ok();
                bail!("application failed to start: {message}");
            }
            Some(reply) => bail!("unexpected lifespan reply to startup: {reply:?}"),
            None => debug!("application doesn't handle lifespan events"),
        }

        Ok(lifespan)
    }

    async fn shutdown(self) -> Result<()> {
        let res = match self.ask(LifespanEvent::Shutdown).await {
            Some(LifespanReply::ShutdownComplete) | None => Ok(()),
            Some(LifespanReply::ShutdownFailed { message }) => {
                Err(eyre!("application failed to shut down: {message}"))
            }
            Some(reply) => Err(eyre!("unexpected lifespan reply to shutdown: {reply:?}")),
        };

        self.join().await?;
        res
    }

    async fn ask(&self, event: LifespanEvent) -> Option<LifespanReply> {
        self.channel.send(event).await.ok()?;
        self.channel.recv().await.ok()
    }

    async fn join(self) -> Result<()> {
        drop(self.channel);
        self.task.await.wrap_err("lifespan task panicked")?
    }
}

/// Hand any request to the application, either as plain HTTP exchange or as WebSocket
/// connection.
async fn dispatch<A: Application>(
    State(state): State<AppState<A>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request,
) -> Response {
    let scope = RequestScope {
        method: request.method().clone(),
        path: request.uri().path().to_owned(),
        query: request.uri().query().map(ToOwned::to_owned),
        scheme: Scheme::Http,
        server: state.server,
        headers: request.headers().clone(),
    };

    match ws {
        Ok(ws) => ws.on_upgrade(|socket| bridge_socket(state.app, scope, socket)),
        Err(_) => bridge_http(state.app, scope, request.into_body()).await,
    }
}

async fn bridge_http<A: Application>(app: Arc<A>, scope: RequestScope, body: Body) -> Response {
    let (app_side, host) = protocol::channel();
    let (responses, requests) = host.into_parts();

    tokio::spawn(async move {
        let path = scope.path.clone();
        let exchange = Exchange::Http(HttpExchange {
            scope,
            channel: app_side,
        });

        let ((), res) = tokio::join!(feed_body(body, requests), app.call(exchange));

        if let Err(e) = res {
            error!(error = ?e, %path, "application failed handling the request");
        }
    });

    let Ok(ResponseMessage::Start { status, headers }) = responses.recv_async().await else {
        warn!("application didn't start a response");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let body = futures_util::stream::unfold(Some(responses), |responses| async move {
        let responses = responses?;
        match responses.recv_async().await {
            Ok(ResponseMessage::Body { body, more_body }) => Some((
                Ok::<_, Infallible>(body),
                more_body.then_some(responses),
            )),
            Ok(ResponseMessage::Start { .. }) | Err(_) => None,
        }
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;

    response
}

/// Stream the request body to the application, until it's complete or nobody listens anymore.
async fn feed_body(body: Body, requests: flume::Sender<RequestEvent>) {
    let mut stream = body.into_data_stream();

    while let Some(chunk) = stream.next().await {
        let event = match chunk {
            Ok(body) => RequestEvent::Body {
                body,
                more_body: true,
            },
            Err(e) => {
                debug!(error = %e, "failed reading the request body");
                requests.send_async(RequestEvent::Disconnect).await.ok();
                return;
            }
        };

        if requests.send_async(event).await.is_err() {
            return;
        }
    }

    requests
        .send_async(RequestEvent::Body {
            body: Bytes::new(),
            more_body: false,
        })
        .await
        .ok();
}

async fn bridge_socket<A: Application>(app: Arc<A>, scope: RequestScope, socket: WebSocket) {
    let (app_side, host) = protocol::channel();
    let (commands, events) = host.into_parts();
    let (mut sink, mut stream) = socket.split();
    let (done_tx, done_rx) = flume::bounded::<()>(0);
    let path = scope.path.clone();

    let call = app.call(Exchange::WebSocket(WebSocketExchange {
        scope,
        channel: app_side,
    }));

    let inbound = async {
        if events.send_async(SocketEvent::Connect).await.is_err() {
            return;
        }

        while let Some(message) = stream.next().await {
            let event = match message {
                Ok(Message::Text(text)) => {
                    SocketEvent::Receive(Frame::Text(text.as_str().to_owned()))
                }
                Ok(Message::Binary(data)) => SocketEvent::Receive(Frame::Binary(data)),
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(frame)) => SocketEvent::Disconnect {
                    code: frame.map_or(NO_STATUS, |frame| frame.code),
                },
                Err(e) => {
                    debug!(error = %e, "websocket connection failed");
                    SocketEvent::Disconnect {
                        code: ABNORMAL_CLOSURE,
                    }
                }
            };

            let disconnect = matches!(event, SocketEvent::Disconnect { .. });
            if events.send_async(event).await.is_err() || disconnect {
                return;
            }
        }

        events
            .send_async(SocketEvent::Disconnect {
                code: ABNORMAL_CLOSURE,
            })
            .await
            .ok();
    };

    let outbound = async {
        while let Ok(command) = commands.recv_async().await {
            let message = match command {
                // the upgrade is already complete at this point
                SocketCommand::Accept => continue,
                SocketCommand::Send(Frame::Text(text)) => Message::Text(text.into()),
                SocketCommand::Send(Frame::Binary(data)) => Message::Binary(data),
                SocketCommand::Close { code } => Message::Close(Some(CloseFrame {
                    code,
                    reason: Utf8Bytes::from_static(""),
                })),
            };

            let close = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || close {
                return;
            }
        }

        sink.close().await.ok();
    };

    let session = async move {
        let ((), res) = tokio::join!(outbound, call);
        drop(done_tx);
        res
    };
    let reader = async {
        tokio::select! {
            () = inbound => {}
            _ = done_rx.recv_async() => {}
        }
    };

    let (res, ()) = tokio::join!(session, reader);

    if let Err(e) = res {
        error!(error = ?e, %path, "application failed handling the websocket");
    }
}
