//! Optional `relive.toml` configuration file.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::{
    eyre::{ensure, Result, WrapErr},
    Help,
};
use serde::Deserialize;

use crate::{
    gateway::{DEFAULT_RECONNECT_INTERVAL, DEFAULT_WS_PATH},
    watch::{WatchBackend, WatchOptions},
};

/// Default name of the configuration file, looked up in the current directory.
pub const FILE_NAME: &str = "relive.toml";

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub watch: WatchConfig,
}

/// Settings of the [`ReloadGateway`](crate::ReloadGateway) itself.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Seconds a browser waits before trying to reconnect a lost reload connection.
    pub reconnect_interval: f64,
    /// Path of the reload WebSocket.
    pub ws_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL.as_secs_f64(),
            ws_path: DEFAULT_WS_PATH.to_owned(),
        }
    }
}

impl GatewayConfig {
    /// The reconnect interval as duration, zero if it isn't representable as one.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.reconnect_interval).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub backend: WatchBackend,
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    /// Additional paths to watch, that trigger a reload without any recovery.
    pub paths: Vec<PathBuf>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        let options = WatchOptions::default();

        Self {
            backend: options.backend,
            debounce_ms: options.debounce.as_millis() as u64,
            poll_interval_ms: options.poll_interval.as_millis() as u64,
            paths: Vec::new(),
        }
    }
}

impl WatchConfig {
    #[must_use]
    pub fn options(&self) -> WatchOptions {
        WatchOptions {
            backend: self.backend,
            debounce: Duration::from_millis(self.debounce_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

impl Config {
    /// Load the configuration from the given file.
    ///
    /// If no explicit path was given, the default file in the current directory is used, falling
    /// back to the default settings if it doesn't exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let buf = match path {
            Some(path) => fs::read_to_string(path)
                .wrap_err("failed to read the configuration file")
                .with_note(|| format!("configuration file: {}", path.display()))?,
            None => match fs::read_to_string(FILE_NAME) {
                Ok(buf) => buf,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
                Err(e) => {
                    return Err(e).wrap_err_with(|| format!("failed to read `{FILE_NAME}`"));
                }
            },
        };

        Self::parse(&buf)
    }

    /// Parse and validate the configuration from its TOML representation.
    pub fn parse(buf: &str) -> Result<Self> {
        let deser = toml::Deserializer::new(buf);

        let config = serde_path_to_error::deserialize::<_, Self>(deser)
            .wrap_err("failed to parse the configuration")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let interval = self.gateway.reconnect_interval;

        ensure!(
            interval.is_finite() && interval > 0.0,
            "gateway.reconnect_interval must be a positive number of seconds, got {interval}"
        );
        ensure!(
            self.gateway.ws_path.starts_with('/'),
            "gateway.ws_path must start with a `/`, got `{}`",
            self.gateway.ws_path
        );
        ensure!(self.watch.debounce_ms > 0, "watch.debounce_ms must not be zero");
        ensure!(
            self.watch.poll_interval_ms > 0,
            "watch.poll_interval_ms must not be zero"
        );

        Ok(())
    }
}
