//! Message protocol spoken between a host server, the [`ReloadGateway`](crate::ReloadGateway)
//! and the wrapped application.
//!
//! Every unit of work arrives as one [`Exchange`]. The three variants each carry a typed,
//! bidirectional [`Channel`]. An HTTP handler can only ever receive [`RequestEvent`]s and send
//! [`ResponseMessage`]s, so a mismatched message can't be expressed at all.

use std::{future::Future, sync::Arc};

use axum::{
    body::Bytes,
    http::{HeaderMap, Method, StatusCode},
};
use color_eyre::eyre::Result;

/// Capacity of the channels connecting both sides of an exchange.
pub const CHANNEL_SIZE: usize = 16;

/// Anything that can process exchanges: the wrapped application, or middleware around it.
pub trait Application: Send + Sync + 'static {
    /// Run a single exchange to completion.
    fn call(&self, exchange: Exchange) -> impl Future<Output = Result<()>> + Send;
}

impl<A: Application> Application for Arc<A> {
    fn call(&self, exchange: Exchange) -> impl Future<Output = Result<()>> + Send {
        A::call(self, exchange)
    }
}

/// A single unit of work handed from the host to an application.
#[derive(Debug)]
pub enum Exchange {
    /// Application startup and shutdown signals.
    Lifespan(LifespanExchange),
    /// A plain HTTP request/response cycle.
    Http(HttpExchange),
    /// A WebSocket connection.
    WebSocket(WebSocketExchange),
}

#[derive(Debug)]
pub struct LifespanExchange {
    pub channel: Channel<LifespanEvent, LifespanReply>,
}

#[derive(Debug)]
pub struct HttpExchange {
    pub scope: RequestScope,
    pub channel: Channel<RequestEvent, ResponseMessage>,
}

#[derive(Debug)]
pub struct WebSocketExchange {
    pub scope: RequestScope,
    pub channel: Channel<SocketEvent, SocketCommand>,
}

/// Connection details of an HTTP request or WebSocket handshake.
#[derive(Clone, Debug)]
pub struct RequestScope {
    pub method: Method,
    /// Request path, always starting with `/`.
    pub path: String,
    pub query: Option<String>,
    pub scheme: Scheme,
    /// Host and port the server accepted the connection on, if known.
    pub server: Option<(String, u16)>,
    pub headers: HeaderMap,
}

impl RequestScope {
    /// Create a scope for a `GET` request to the given path, with everything else left empty.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: None,
            scheme: Scheme::Http,
            server: None,
            headers: HeaderMap::new(),
        }
    }
}

/// Transport security of the connection. WebSocket connections use the same values, `Http`
/// standing for `ws` and `Https` for `wss`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifespanEvent {
    Startup,
    Shutdown,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LifespanReply {
    StartupComplete,
    StartupFailed { message: String },
    ShutdownComplete,
    ShutdownFailed { message: String },
}

impl LifespanReply {
    /// The successful reply to the given event.
    #[must_use]
    pub fn complete(event: LifespanEvent) -> Self {
        match event {
            LifespanEvent::Startup => Self::StartupComplete,
            LifespanEvent::Shutdown => Self::ShutdownComplete,
        }
    }

    /// The failure reply to the given event.
    #[must_use]
    pub fn failed(event: LifespanEvent, message: String) -> Self {
        match event {
            LifespanEvent::Startup => Self::StartupFailed { message },
            LifespanEvent::Shutdown => Self::ShutdownFailed { message },
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestEvent {
    Body { body: Bytes, more_body: bool },
    /// The client went away before the response was complete.
    Disconnect,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResponseMessage {
    Start {
        status: StatusCode,
        headers: HeaderMap,
    },
    Body {
        body: Bytes,
        more_body: bool,
    },
}

impl ResponseMessage {
    /// A body chunk that completes the response.
    #[must_use]
    pub fn last(body: impl Into<Bytes>) -> Self {
        Self::Body {
            body: body.into(),
            more_body: false,
        }
    }

    /// A body chunk with more to follow.
    #[must_use]
    pub fn chunk(body: impl Into<Bytes>) -> Self {
        Self::Body {
            body: body.into(),
            more_body: true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SocketEvent {
    Connect,
    Receive(Frame),
    Disconnect { code: u16 },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SocketCommand {
    Accept,
    Send(Frame),
    Close { code: u16 },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Violations of the message protocol by either side of an exchange.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("the other side of the exchange hung up")]
    Disconnected,
    #[error("response body sent before the response start")]
    BodyBeforeStart,
    #[error("response start sent more than once")]
    DuplicateStart,
    #[error("response continued after its final body chunk")]
    BodyAfterEnd,
    #[error("application finished without completing the response body")]
    IncompleteBody,
    #[error("unexpected websocket event: {0:?}")]
    UnexpectedSocketEvent(SocketEvent),
}

/// One side of an exchange: receives `In` messages and sends `Out` messages.
#[derive(Debug)]
pub struct Channel<In, Out> {
    receiver: flume::Receiver<In>,
    sender: flume::Sender<Out>,
}

/// Create both sides of an exchange. The first channel is handed to the application, the second
/// one stays with whoever drives it.
#[must_use]
pub fn channel<In, Out>() -> (Channel<In, Out>, Channel<Out, In>) {
    let (in_tx, in_rx) = flume::bounded(CHANNEL_SIZE);
    let (out_tx, out_rx) = flume::bounded(CHANNEL_SIZE);

    (
        Channel {
            receiver: in_rx,
            sender: out_tx,
        },
        Channel {
            receiver: out_rx,
            sender: in_tx,
        },
    )
}

impl<In, Out> Channel<In, Out> {
    #[must_use]
    pub fn from_parts(receiver: flume::Receiver<In>, sender: flume::Sender<Out>) -> Self {
        Self { receiver, sender }
    }

    #[must_use]
    pub fn into_parts(self) -> (flume::Receiver<In>, flume::Sender<Out>) {
        (self.receiver, self.sender)
    }

    /// Wait for the next incoming message.
    pub async fn recv(&self) -> Result<In, ProtocolError> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }

    /// Send a message to the other side.
    pub async fn send(&self, message: Out) -> Result<(), ProtocolError> {
        self.sender
            .send_async(message)
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }

    #[must_use]
    pub fn try_recv(&self) -> Option<In> {
        self.receiver.try_recv().ok()
    }
}
