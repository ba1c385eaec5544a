//! File watching, turning raw file system events into [`ChangeBatch`]es and those into reload
//! signals.
//!
//! - [`ChangeSource`] wraps a single path and produces coalesced batches of changes.
//! - [`WatchSession`] pairs a source with the recovery callbacks of its [`WatchTarget`], running
//!   them on each batch before publishing a reload through the
//!   [`Broadcaster`](crate::Broadcaster).

mod session;
mod source;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use color_eyre::eyre::Result;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Deserialize;

pub use session::WatchSession;
pub use source::ChangeSource;

/// Server-side hook run after a file change, before browsers are told to reload. Usually
/// rebuilds some in-memory state derived from the changed files.
pub type RecoveryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A path to observe, together with the hooks to run when anything below it changes.
#[derive(Clone)]
pub struct WatchTarget {
    path: PathBuf,
    on_reload: Vec<RecoveryFn>,
}

impl WatchTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            on_reload: Vec::new(),
        }
    }

    /// Add a recovery callback. Callbacks run in the order they were added.
    #[must_use]
    pub fn on_reload<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_reload.push(Arc::new(move || callback().boxed()));
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn callbacks(&self) -> &[RecoveryFn] {
        &self.on_reload
    }
}

impl fmt::Debug for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchTarget")
            .field("path", &self.path)
            .field("on_reload", &self.on_reload.len())
            .finish()
    }
}

/// The mechanism used to detect file system changes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum WatchBackend {
    /// The platform's native notification API (inotify, FSEvents, ...).
    #[default]
    Native,
    /// Periodically scan the watched paths. Works on network drives and inside containers where
    /// native events don't arrive.
    Poll,
}

/// Tuning knobs shared by all watched paths.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WatchOptions {
    pub backend: WatchBackend,
    /// Length of the window in which events are merged into a single batch, starting at the
    /// first event.
    pub debounce: Duration,
    /// Scan interval of the polling backend, and retry interval for attaching to paths that
    /// don't exist yet.
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            backend: WatchBackend::Native,
            debounce: Duration::from_millis(50),
            poll_interval: Duration::from_millis(400),
        }
    }
}

/// Kind of a single file change.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        })
    }
}

/// File changes that were detected together, grouped by kind.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeBatch {
    changes: BTreeMap<ChangeKind, Vec<PathBuf>>,
}

impl ChangeBatch {
    /// Record a change. Recording the same path twice for one kind has no effect.
    pub fn push(&mut self, kind: ChangeKind, path: PathBuf) {
        let paths = self.changes.entry(kind).or_default();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// Paths that changed in the given way, in the order they were detected.
    #[must_use]
    pub fn get(&self, kind: ChangeKind) -> &[PathBuf] {
        self.changes
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(Vec::is_empty)
    }

    /// Total number of recorded changes over all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChangeKind, &[PathBuf])> {
        self.changes
            .iter()
            .filter(|(_, paths)| !paths.is_empty())
            .map(|(kind, paths)| (*kind, paths.as_slice()))
    }
}

/// Short summary like `modified 2 files (a.md, b.md), deleted 1 file (c.md)`.
impl Display for ChangeBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no changes");
        }

        for (i, (kind, paths)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }

            write!(
                f,
                "{kind} {} {} (",
                paths.len(),
                if paths.len() == 1 { "file" } else { "files" }
            )?;

            for (j, path) in paths.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                let name = path.file_name().unwrap_or(path.as_os_str());
                write!(f, "{}", Path::new(name).display())?;
            }

            f.write_str(")")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_deduplicates_per_kind() {
        let mut batch = ChangeBatch::default();
        batch.push(ChangeKind::Added, "a.md".into());
        batch.push(ChangeKind::Modified, "a.md".into());
        batch.push(ChangeKind::Modified, "a.md".into());

        assert_eq!(2, batch.len());
        assert_eq!(vec![PathBuf::from("a.md")], batch.get(ChangeKind::Modified));
        assert!(batch.get(ChangeKind::Deleted).is_empty());
    }

    #[test]
    fn batch_summary() {
        let mut batch = ChangeBatch::default();
        batch.push(ChangeKind::Deleted, "/docs/c.md".into());
        batch.push(ChangeKind::Modified, "/docs/a.md".into());
        batch.push(ChangeKind::Modified, "/docs/b.md".into());

        assert_eq!(
            "modified 2 files (a.md, b.md), deleted 1 file (c.md)",
            batch.to_string()
        );
        assert_eq!("no changes", ChangeBatch::default().to_string());
    }

    #[test]
    fn callbacks_keep_order() {
        let target = WatchTarget::new("pages")
            .on_reload(|| async { Ok(()) })
            .on_reload(|| async { Ok(()) });

        assert_eq!(Path::new("pages"), target.path());
        assert_eq!(2, target.callbacks().len());
        assert_eq!(
            "WatchTarget { path: \"pages\", on_reload: 2 }",
            format!("{target:?}")
        );
    }
}
