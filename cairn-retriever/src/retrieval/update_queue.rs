//! Coalescing queue of pending incremental updates.
//!
//! File-system events arrive in bursts: an editor save can produce several events
//! for one file, a checkout touches hundreds. Events are folded into one pending
//! action per absolute path, last event wins, and drained as a single batch once
//! the debounce timer fires. If too many distinct paths pile up, the batch
//! degrades to a full rebuild, which is cheaper than hundreds of single-file updates.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default number of distinct paths held before falling back to a rebuild.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Kind of change reported by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Add,
    Change,
    Unlink,
}

/// A single file-system change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

impl WatchEvent {
    pub fn add(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Add,
            path: path.into(),
        }
    }

    pub fn change(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Change,
            path: path.into(),
        }
    }

    pub fn unlink(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: WatchEventKind::Unlink,
            path: path.into(),
        }
    }
}

/// What to do with a path when the batch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    /// Remove the current entry and index the file again
    Reindex,
    /// Remove the entry (or every entry beneath a removed directory)
    Remove,
}

impl From<WatchEventKind> for UpdateAction {
    fn from(kind: WatchEventKind) -> Self {
        match kind {
            WatchEventKind::Add | WatchEventKind::Change => UpdateAction::Reindex,
            WatchEventKind::Unlink => UpdateAction::Remove,
        }
    }
}

/// A drained batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateBatch {
    /// Per-path actions ordered by path
    Paths(Vec<(PathBuf, UpdateAction)>),
    /// Too many paths changed, rebuild everything
    Rebuild,
}

impl UpdateBatch {
    pub fn is_empty(&self) -> bool {
        matches!(self, UpdateBatch::Paths(paths) if paths.is_empty())
    }
}

#[derive(Debug)]
pub struct PendingUpdates {
    pending: BTreeMap<PathBuf, UpdateAction>,
    max_pending: usize,
    overflowed: bool,
}

impl Default for PendingUpdates {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING)
    }
}

impl PendingUpdates {
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            overflowed: false,
        }
    }

    /// Records `event`, replacing any earlier action for the same path.
    pub fn push(&mut self, event: WatchEvent) {
        if self.overflowed {
            return;
        }
        self.pending.insert(event.path, event.kind.into());
        if self.pending.len() > self.max_pending {
            tracing::warn!(
                "More than {} pending file updates, scheduling a full rebuild instead",
                self.max_pending
            );
            self.pending.clear();
            self.overflowed = true;
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && !self.overflowed
    }

    /// Takes everything queued so far, leaving the queue empty.
    pub fn drain(&mut self) -> UpdateBatch {
        if std::mem::take(&mut self.overflowed) {
            self.pending.clear();
            return UpdateBatch::Rebuild;
        }
        UpdateBatch::Paths(std::mem::take(&mut self.pending).into_iter().collect())
    }

    /// Drops everything queued.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_event_wins() {
        let mut queue = PendingUpdates::default();
        queue.push(WatchEvent::add("/ws/a.md"));
        queue.push(WatchEvent::change("/ws/a.md"));
        queue.push(WatchEvent::unlink("/ws/a.md"));
        queue.push(WatchEvent::change("/ws/b.md"));
        assert_eq!(queue.len(), 2);

        assert_eq!(
            queue.drain(),
            UpdateBatch::Paths(vec![
                (PathBuf::from("/ws/a.md"), UpdateAction::Remove),
                (PathBuf::from("/ws/b.md"), UpdateAction::Reindex),
            ])
        );
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_unlink_then_add_reindexes() {
        let mut queue = PendingUpdates::default();
        queue.push(WatchEvent::unlink("/ws/a.md"));
        queue.push(WatchEvent::add("/ws/a.md"));
        assert_eq!(
            queue.drain(),
            UpdateBatch::Paths(vec![(PathBuf::from("/ws/a.md"), UpdateAction::Reindex)])
        );
    }

    #[test]
    fn test_overflow_becomes_rebuild() {
        let mut queue = PendingUpdates::with_limit(2);
        queue.push(WatchEvent::add("/ws/a.md"));
        queue.push(WatchEvent::add("/ws/b.md"));
        queue.push(WatchEvent::add("/ws/c.md"));
        queue.push(WatchEvent::add("/ws/d.md"));
        assert!(!queue.is_empty());
        assert_eq!(queue.drain(), UpdateBatch::Rebuild);
        assert!(queue.is_empty());

        queue.push(WatchEvent::add("/ws/e.md"));
        queue.clear();
        assert!(queue.is_empty());
    }
}
