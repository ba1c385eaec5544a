//! Live reloading for web applications during development.
//!
//! A [`ReloadGateway`] wraps an [`Application`], watches a set of paths and, whenever any file
//! below them changes, tells every open browser tab to reload. Tabs learn about the reload
//! WebSocket through a script the gateway injects into each HTML page.

pub mod broadcast;
pub mod config;
pub mod gateway;
pub mod pages;
pub mod protocol;
pub mod script;
pub mod server;
pub mod watch;

pub use self::{
    broadcast::{Broadcaster, Reload, Subscription},
    config::Config,
    gateway::{GatewayBuilder, ReloadGateway},
    protocol::{Application, Exchange},
    watch::{ChangeBatch, ChangeKind, ChangeSource, WatchOptions, WatchSession, WatchTarget},
};
