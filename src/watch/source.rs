//! Change detection for a single path, backed by [`notify`].
//!
//! Raw events are recorded into a [`ChangeBatch`] until the debounce window after the first
//! event closes, then handed out as one batch. Paths that don't exist yet are retried
//! periodically, instead of failing.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::eyre::{Result, WrapErr};
use futures_util::Stream;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{
    event::{MetadataKind, ModifyKind, RenameMode},
    Event, EventKind, PollWatcher, RecursiveMode, Watcher,
};
use tokio::time::{self, Instant};
use tracing::{debug, error, trace, warn};

use super::{ChangeBatch, ChangeKind, WatchBackend, WatchOptions};

/// Patterns for files that are never reported, mostly VCS internals and editor leftovers.
const IGNORE_PATTERNS: &[&str] = &[
    ".git/",
    "node_modules/",
    "__pycache__/",
    "*.swp",
    "*.swx",
    "*~",
    ".#*",
    ".DS_Store",
];

/// Lazy, endless sequence of [`ChangeBatch`]es for one file or directory.
pub struct ChangeSource {
    /// Absolute path of the watched file or directory.
    path: PathBuf,
    /// The underlying [`notify`] watcher. Dropping it stops the backend.
    watcher: Box<dyn Watcher + Send>,
    /// Receiver for raw events from [`notify`].
    events: flume::Receiver<notify::Result<Event>>,
    /// Matcher for [`IGNORE_PATTERNS`].
    ignore: Gitignore,
    /// Whether the path currently exists and is registered with the watcher.
    attached: bool,
    debounce: Duration,
    poll_interval: Duration,
}

impl ChangeSource {
    /// Start watching the given path.
    ///
    /// A path that doesn't exist is not an error. The source keeps trying to attach to it, and
    /// reports it as added once it appears.
    pub fn open(path: impl AsRef<Path>, options: &WatchOptions) -> Result<Self> {
        let path = absolute(path.as_ref())?;
        let (tx, rx) = flume::unbounded();
        let handler = move |ev: notify::Result<Event>| {
            tx.send(ev).ok();
        };

        let watcher: Box<dyn Watcher + Send> = match options.backend {
            WatchBackend::Native => Box::new(notify::recommended_watcher(handler)?),
            WatchBackend::Poll => Box::new(PollWatcher::new(
                handler,
                // mtimes are only compared in whole seconds
                notify::Config::default()
                    .with_poll_interval(options.poll_interval)
                    .with_compare_contents(true),
            )?),
        };

        let ignore = {
            let mut builder = GitignoreBuilder::new(path.parent().unwrap_or(&path));
            for pattern in IGNORE_PATTERNS {
                builder.add_line(None, pattern)?;
            }
            builder.build()?
        };

        let mut source = Self {
            path,
            watcher,
            events: rx,
            ignore,
            attached: false,
            debounce: options.debounce,
            poll_interval: options.poll_interval,
        };

        if source
            .attach()
            .wrap_err_with(|| format!("failed watching `{}`", source.path.display()))?
        {
            debug!(path = %source.path.display(), "watching path");
        } else {
            debug!(path = %source.path.display(), "path doesn't exist yet, waiting for it");
        }

        Ok(source)
    }

    /// The absolute path being watched.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next batch of changes.
    ///
    /// Only returns `None` if the watcher backend shut down on its own.
    pub async fn next_batch(&mut self) -> Option<ChangeBatch> {
        let mut batch = ChangeBatch::default();
        let mut deadline = None;

        loop {
            let wait = deadline.unwrap_or_else(|| Instant::now() + self.poll_interval);

            match time::timeout_at(wait, self.events.recv_async()).await {
                Ok(Ok(event)) => {
                    self.record(event, &mut batch);
                    if deadline.is_none() && !batch.is_empty() {
                        deadline = Some(Instant::now() + self.debounce);
                    }
                }
                Ok(Err(_)) => {
                    warn!(path = %self.path.display(), "file watcher backend stopped");
                    return None;
                }
                // Debounce window closed
                Err(_) if deadline.is_some() => return Some(batch),
                // Idle tick
                Err(_) => {
                    self.reattach(&mut batch);
                    if !batch.is_empty() {
                        return Some(batch);
                    }
                }
            }
        }
    }

    /// Turn the source into a stream of batches. Dropping the stream stops watching.
    pub fn into_stream(self) -> impl Stream<Item = ChangeBatch> + Send + 'static {
        futures_util::stream::unfold(self, |mut source| async move {
            let batch = source.next_batch().await?;
            Some((batch, source))
        })
    }

    /// Register the path with the watcher, if it exists. Returns whether it's attached.
    fn attach(&mut self) -> Result<bool> {
        if !self.path.try_exists()? {
            return Ok(false);
        }

        self.watcher.watch(&self.path, RecursiveMode::Recursive)?;
        self.attached = true;

        Ok(true)
    }

    fn reattach(&mut self, batch: &mut ChangeBatch) {
        if self.attached {
            return;
        }

        match self.attach() {
            Ok(true) => {
                debug!(path = %self.path.display(), "path appeared, watching it now");
                batch.push(ChangeKind::Added, self.path.clone());
            }
            Ok(false) => {}
            Err(e) => warn!(error = ?e, path = %self.path.display(), "failed attaching watcher"),
        }
    }

    /// Convert a single raw event from [`notify`] into changes.
    fn record(&mut self, ev: notify::Result<Event>, batch: &mut ChangeBatch) {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                error!(error = %e, "fs event error");
                return;
            }
        };

        let kind = match ev.kind {
            EventKind::Create(_) => ChangeKind::Added,
            EventKind::Modify(modify) => match modify {
                ModifyKind::Any | ModifyKind::Other | ModifyKind::Data(_) => ChangeKind::Modified,
                // the polling backend reports content changes this way
                ModifyKind::Metadata(MetadataKind::WriteTime) => ChangeKind::Modified,
                ModifyKind::Metadata(_) => return,
                ModifyKind::Name(name) => match name {
                    RenameMode::From => ChangeKind::Deleted,
                    RenameMode::To => ChangeKind::Added,
                    RenameMode::Both => {
                        if let [from, to] = ev.paths.as_slice() {
                            self.push(batch, ChangeKind::Deleted, from.clone());
                            self.push(batch, ChangeKind::Added, to.clone());
                        }
                        return;
                    }
                    RenameMode::Any | RenameMode::Other => ChangeKind::Modified,
                },
            },
            EventKind::Remove(_) => ChangeKind::Deleted,
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {
                trace!(kind = ?ev.kind, paths = ?ev.paths, "skipped event");
                return;
            }
        };

        for path in ev.paths {
            self.push(batch, kind, path);
        }
    }

    fn push(&mut self, batch: &mut ChangeBatch, mut kind: ChangeKind, path: PathBuf) {
        if self.is_ignored(&path) {
            trace!(path = %path.display(), "ignored change");
            return;
        }

        if kind == ChangeKind::Deleted && path == self.path {
            self.attached = false;
            self.watcher.unwatch(&self.path).ok();

            // Atomic saves replace the path instead of removing it.
            match self.attach() {
                Ok(true) => {
                    debug!(path = %self.path.display(), "watched path replaced");
                    kind = ChangeKind::Modified;
                }
                Ok(false) => debug!(path = %self.path.display(), "watched path removed"),
                Err(e) => {
                    warn!(error = ?e, path = %self.path.display(), "failed re-attaching watcher");
                }
            }
        }

        trace!(%kind, path = %path.display(), "recorded change");
        batch.push(kind, path);
    }

    fn is_ignored(&self, path: &Path) -> bool {
        path.starts_with(self.ignore.path())
            && self
                .ignore
                .matched_path_or_any_parents(path, path.is_dir())
                .is_ignore()
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(if path.is_absolute() {
        path.to_owned()
    } else {
        env::current_dir()?.join(path)
    })
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::fs;

    use assert_fs::prelude::*;

    use super::*;

    async fn next(source: &mut ChangeSource) -> ChangeBatch {
        time::timeout(Duration::from_secs(5), source.next_batch())
            .await
            .expect("change batch within timeout")
            .expect("watcher to keep running")
    }

    fn options() -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(50),
            ..WatchOptions::default()
        }
    }

    #[tokio::test]
    async fn modify_file() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        let page = temp.child("page1.md");
        page.write_str("# Page 1")?;

        let mut source = ChangeSource::open(temp.path(), &options())?;
        page.write_str("# Page 1 (modified)")?;

        let batch = next(&mut source).await;
        assert_eq!(vec![page.to_path_buf()], batch.get(ChangeKind::Modified));
        assert!(batch.get(ChangeKind::Added).is_empty());
        assert!(batch.get(ChangeKind::Deleted).is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn create_and_delete_file() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        let mut source = ChangeSource::open(temp.path(), &options())?;

        let page = temp.child("new.md");
        page.touch()?;
        let batch = next(&mut source).await;
        assert!(batch.get(ChangeKind::Added).contains(&page.to_path_buf()));

        fs::remove_file(page.path())?;
        let batch = next(&mut source).await;
        assert_eq!(vec![page.to_path_buf()], batch.get(ChangeKind::Deleted));

        Ok(())
    }

    #[tokio::test]
    async fn rename_file() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        temp.child("a.md").touch()?;
        let mut source = ChangeSource::open(temp.path(), &options())?;

        fs::rename(temp.join("a.md"), temp.join("b.md"))?;

        let batch = next(&mut source).await;
        assert_eq!(vec![temp.join("a.md")], batch.get(ChangeKind::Deleted));
        assert_eq!(vec![temp.join("b.md")], batch.get(ChangeKind::Added));

        Ok(())
    }

    #[tokio::test]
    async fn ignored_files_are_skipped() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        temp.child(".git").create_dir_all()?;
        let mut source = ChangeSource::open(temp.path(), &options())?;

        temp.child(".page.md.swp").touch()?;
        temp.child(".git/index").touch()?;
        temp.child("page.md").touch()?;

        let batch = next(&mut source).await;
        assert_eq!(vec![temp.join("page.md")], batch.get(ChangeKind::Added));

        Ok(())
    }

    #[tokio::test]
    async fn missing_path_is_picked_up_later() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        let pages = temp.child("pages");

        let mut source = ChangeSource::open(pages.path(), &options())?;
        assert!(
            time::timeout(Duration::from_millis(200), source.next_batch())
                .await
                .is_err(),
            "no event for a missing path"
        );

        pages.create_dir_all()?;
        let batch = next(&mut source).await;
        assert_eq!(vec![pages.to_path_buf()], batch.get(ChangeKind::Added));

        pages.child("page1.md").write_str("# Page 1")?;
        let batch = next(&mut source).await;
        assert!(batch
            .get(ChangeKind::Added)
            .contains(&pages.join("page1.md")));

        Ok(())
    }

    #[tokio::test]
    async fn watch_single_file() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        let watched = temp.child("watched.md");
        watched.touch()?;
        let mut source = ChangeSource::open(watched.path(), &options())?;

        temp.child("other.md").write_str("not watched")?;
        watched.write_str("changed")?;

        let batch = next(&mut source).await;
        assert_eq!(vec![watched.to_path_buf()], batch.get(ChangeKind::Modified));
        assert!(batch.get(ChangeKind::Added).is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn replace_single_file() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        let watched = temp.child("watched.md");
        watched.write_str("before")?;
        let mut source = ChangeSource::open(watched.path(), &options())?;

        let staged = temp.child("watched.md.tmp");
        staged.write_str("after")?;
        fs::rename(staged.path(), watched.path())?;

        let batch = next(&mut source).await;
        assert_eq!(vec![watched.to_path_buf()], batch.get(ChangeKind::Modified));
        assert!(batch.get(ChangeKind::Deleted).is_empty());
        assert!(batch.get(ChangeKind::Added).is_empty());

        assert!(
            time::timeout(Duration::from_millis(300), source.next_batch())
                .await
                .is_err(),
            "one save is one batch"
        );

        watched.write_str("after, again")?;
        let batch = next(&mut source).await;
        assert_eq!(vec![watched.to_path_buf()], batch.get(ChangeKind::Modified));

        Ok(())
    }

    #[tokio::test]
    async fn remove_single_file() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        let watched = temp.child("watched.md");
        watched.touch()?;
        let mut source = ChangeSource::open(watched.path(), &options())?;

        fs::remove_file(watched.path())?;
        let batch = next(&mut source).await;
        assert_eq!(vec![watched.to_path_buf()], batch.get(ChangeKind::Deleted));

        watched.write_str("back")?;
        let batch = next(&mut source).await;
        assert_eq!(vec![watched.to_path_buf()], batch.get(ChangeKind::Added));

        Ok(())
    }

    #[tokio::test]
    async fn poll_backend() -> Result<()> {
        let temp = assert_fs::TempDir::new()?;
        let page = temp.child("page.md");
        page.write_str("one")?;

        let options = WatchOptions {
            backend: WatchBackend::Poll,
            ..options()
        };
        let mut source = ChangeSource::open(temp.path(), &options)?;

        std::thread::sleep(Duration::from_millis(20));
        page.write_str("two")?;

        let batch = next(&mut source).await;
        assert!(batch
            .get(ChangeKind::Modified)
            .contains(&page.to_path_buf()));

        Ok(())
    }
}
