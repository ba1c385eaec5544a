//! The background loop that turns change batches of one [`WatchTarget`] into reload signals.

use color_eyre::eyre::{bail, Result, WrapErr};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ChangeSource, WatchOptions, WatchTarget};
use crate::broadcast::Broadcaster;

/// Handle to a running watch loop.
struct Running {
    /// Sender to signal the watch loop to shut down. Nothing is ever sent, dropping it is the
    /// signal.
    shutdown: flume::Sender<()>,
    /// The spawned loop. Resolves with the error that ended it, if any.
    task: JoinHandle<Result<()>>,
}

/// Watches a single [`WatchTarget`]. For every batch of changes, the target's recovery callbacks
/// are run in order, and only after all of them finished, a reload is published.
pub struct WatchSession {
    target: WatchTarget,
    options: WatchOptions,
    broadcaster: Broadcaster,
    running: Option<Running>,
}

impl WatchSession {
    #[must_use]
    pub fn new(target: WatchTarget, broadcaster: Broadcaster, options: WatchOptions) -> Self {
        Self {
            target,
            options,
            broadcaster,
            running: None,
        }
    }

    #[must_use]
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Begin watching. Failing to attach to an existing path is reported right away, the loop
    /// itself runs as a background task.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            bail!("already watching `{}`", self.target.path().display());
        }

        let source = ChangeSource::open(self.target.path(), &self.options)?;
        let (shutdown_tx, shutdown_rx) = flume::bounded(0);

        let task = tokio::spawn(run(
            source,
            self.target.clone(),
            self.broadcaster.clone(),
            shutdown_rx,
        ));

        self.running = Some(Running {
            shutdown: shutdown_tx,
            task,
        });

        info!(path = %self.target.path().display(), "started watching file changes");
        Ok(())
    }

    /// Signal the watch loop to stop and wait until it fully terminated. Returns the error of a
    /// recovery callback, if that's what ended the loop before.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(Running { shutdown, task }) = self.running.take() else {
            bail!("not watching `{}`", self.target.path().display());
        };

        info!(path = %self.target.path().display(), "stopping file watching");
        drop(shutdown);

        task.await.wrap_err("watch loop panicked")?
    }
}

/// Run the watch loop until it fails or a shutdown signal arrives. On shutdown, any batch
/// currently in progress is cancelled.
async fn run(
    source: ChangeSource,
    target: WatchTarget,
    broadcaster: Broadcaster,
    shutdown: flume::Receiver<()>,
) -> Result<()> {
    let res = tokio::select! {
        res = watch(source, &target, &broadcaster) => res,
        _ = shutdown.recv_async() => Ok(()),
    };

    match &res {
        Ok(()) => debug!(path = %target.path().display(), "watch loop shut down"),
        Err(e) => error!(
            error = ?e,
            path = %target.path().display(),
            "watch loop stopped, no more reloads for this path"
        ),
    }

    res
}

async fn watch(
    source: ChangeSource,
    target: &WatchTarget,
    broadcaster: &Broadcaster,
) -> Result<()> {
    let mut batches = Box::pin(source.into_stream());

    while let Some(batch) = batches.next().await {
        warn!(path = %target.path().display(), "detected {batch}, triggering reload");

        for (i, callback) in target.callbacks().iter().enumerate() {
            callback()
                .await
                .wrap_err_with(|| format!("recovery callback #{i} failed"))?;
        }

        let delivered = broadcaster.publish();
        debug!(delivered, "sent reload signal");
    }

    Ok(())
}
