use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tracing::{debug, warn};

use super::scanner::ScanRules;
use super::update_queue::WatchEvent;

/// Window the OS-level debouncer uses to fold duplicate notifications for one path.
/// The indexing manager applies its own, longer debounce on top.
const EVENT_COALESCE: Duration = Duration::from_millis(200);

/// Recursive watcher over a workspace that forwards relevant changes as
/// [`WatchEvent`]s. Watching stops when the value is dropped.
pub struct WorkspaceWatcher {
    root: PathBuf,
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

impl WorkspaceWatcher {
    pub fn start(root: &Path, rules: ScanRules, events: flume::Sender<WatchEvent>) -> Result<Self> {
        let base = root.to_path_buf();
        let handler_root = base.clone();
        let mut debouncer = new_debouncer(EVENT_COALESCE, move |res: DebounceEventResult| {
            match res {
                Ok(batch) => {
                    for ev in batch {
                        let Some(event) = classify(&handler_root, &rules, &ev.path) else {
                            continue;
                        };
                        // Runs on the notifier thread, so a blocking send is fine.
                        if events.send(event).is_err() {
                            debug!("Update worker is gone, dropping file change");
                            return;
                        }
                    }
                }
                Err(err) => warn!("File watcher error: {}", err),
            }
        })?;

        debouncer
            .watcher()
            .watch(&base, notify::RecursiveMode::Recursive)?;
        debug!("Watching {} for changes", base.display());

        Ok(Self {
            root: base,
            _debouncer: debouncer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Turns a raw notification into an update, or `None` if it is irrelevant.
///
/// Existing files must pass the extension allowlist. A path that no longer exists is
/// reported as an unlink whatever its name, since it may have been a directory.
pub(crate) fn classify(root: &Path, rules: &ScanRules, path: &Path) -> Option<WatchEvent> {
    let relative = path.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() || rules.in_ignored_dir(relative) {
        return None;
    }
    if path.is_dir() {
        return None;
    }
    if path.exists() {
        rules
            .is_eligible(root, path)
            .then(|| WatchEvent::change(path))
    } else {
        let own_name_ignored = relative
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| rules.is_ignored_dir_name(n));
        (!own_name_ignored).then(|| WatchEvent::unlink(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::retrieval::update_queue::WatchEventKind;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn rules() -> ScanRules {
        ScanRules::from_config(&IndexingConfig::default().with_extensions(["md"]))
    }

    #[test]
    fn test_classify() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("docs"))?;
        std::fs::write(root.join("docs/a.md"), "a")?;
        std::fs::write(root.join("b.rs"), "b")?;

        let rules = rules();
        assert_eq!(
            classify(root, &rules, &root.join("docs/a.md")),
            Some(WatchEvent::change(root.join("docs/a.md")))
        );
        assert_eq!(classify(root, &rules, &root.join("b.rs")), None);
        assert_eq!(classify(root, &rules, &root.join("docs")), None);
        assert_eq!(
            classify(root, &rules, &root.join("gone")),
            Some(WatchEvent::unlink(root.join("gone")))
        );
        assert_eq!(classify(root, &rules, &root.join(".cairn/index.bin")), None);
        assert_eq!(classify(root, &rules, &root.join("node_modules")), None);
        assert_eq!(classify(root, &rules, Path::new("/elsewhere/a.md")), None);
        Ok(())
    }

    #[traced_test]
    #[tokio::test]
    async fn test_watcher_reports_changes() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().canonicalize()?;
        let (tx, rx) = flume::unbounded();
        let watcher = WorkspaceWatcher::start(&root, rules(), tx)?;
        assert_eq!(watcher.root(), root.as_path());

        let file = root.join("note.md");
        tokio::fs::write(&file, "hello").await?;

        let event = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv_async().await?;
                if event.path == file {
                    return Ok::<_, flume::RecvError>(event);
                }
            }
        })
        .await??;
        assert_eq!(event.kind, WatchEventKind::Change);
        Ok(())
    }
}
