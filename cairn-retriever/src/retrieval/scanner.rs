//! Workspace traversal and file reading.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::config::IndexingConfig;

/// Decides which paths are eligible for indexing.
#[derive(Debug, Clone)]
pub struct ScanRules {
    extensions: HashSet<String>,
    ignored_dirs: HashSet<String>,
    /// Workspace-relative subtrees pruned regardless of their name
    ignored_paths: Vec<PathBuf>,
    respect_gitignore: bool,
}

impl ScanRules {
    /// The storage directory is always ignored, whatever `ignored_dirs` says.
    pub fn from_config(config: &IndexingConfig) -> Self {
        let extensions = config
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        let mut ignored_dirs: HashSet<String> = config.ignored_dirs.iter().cloned().collect();
        ignored_dirs.insert(config.storage_dir.clone());
        Self {
            extensions,
            ignored_dirs,
            ignored_paths: Vec::new(),
            respect_gitignore: config.respect_gitignore,
        }
    }

    /// Prunes the subtree at `relative`, a path relative to the workspace root.
    pub fn with_ignored_path(mut self, relative: impl Into<PathBuf>) -> Self {
        let relative = relative.into();
        if !relative.as_os_str().is_empty() && !self.ignored_paths.contains(&relative) {
            self.ignored_paths.push(relative);
        }
        self
    }

    /// Whether `relative` is, or lies beneath, an explicitly ignored path.
    pub fn is_ignored_path(&self, relative: &Path) -> bool {
        self.ignored_paths.iter().any(|p| relative.starts_with(p))
    }

    pub fn has_allowed_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_lowercase()))
    }

    pub fn is_ignored_dir_name(&self, name: &str) -> bool {
        self.ignored_dirs.contains(name)
    }

    /// Applies the extension allowlist and directory denylist to a single path, as
    /// reported by a file watcher. Paths outside `workspace` are never eligible.
    pub fn is_eligible(&self, workspace: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(workspace) else {
            return false;
        };
        if !self.has_allowed_extension(path) {
            return false;
        }
        !self.in_ignored_dir(relative)
    }

    /// Whether any directory component of `relative` is denied, or `relative` sits
    /// inside an ignored path.
    pub fn in_ignored_dir(&self, relative: &Path) -> bool {
        if self.is_ignored_path(relative) {
            return true;
        }
        let mut components: Vec<Component> = relative.components().collect();
        components.pop();
        components.iter().any(|c| match c {
            Component::Normal(name) => name.to_str().is_some_and(|n| self.is_ignored_dir_name(n)),
            _ => false,
        })
    }
}

/// Depth-first walk of a workspace collecting indexable files.
#[derive(Debug, Clone)]
pub struct WorkspaceScanner {
    root: PathBuf,
    rules: ScanRules,
}

impl WorkspaceScanner {
    pub fn new(root: impl Into<PathBuf>, rules: ScanRules) -> Self {
        Self {
            root: root.into(),
            rules,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules(&self) -> &ScanRules {
        &self.rules
    }

    /// Returns eligible files in a stable depth-first order.
    ///
    /// Denied directories are pruned before descent. Unreadable entries are logged
    /// and skipped together with anything beneath them.
    pub fn scan(&self) -> Vec<PathBuf> {
        let rules = self.rules.clone();
        let root = self.root.clone();
        let walker = ignore::WalkBuilder::new(&self.root)
            .hidden(false)
            .parents(self.rules.respect_gitignore)
            .ignore(self.rules.respect_gitignore)
            .git_ignore(self.rules.respect_gitignore)
            .git_exclude(self.rules.respect_gitignore)
            .git_global(false)
            .require_git(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if entry
                    .path()
                    .strip_prefix(&root)
                    .is_ok_and(|relative| rules.is_ignored_path(relative))
                {
                    return false;
                }
                let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
                !(is_dir
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| rules.is_ignored_dir_name(name)))
            })
            .build();

        let mut files = Vec::new();
        for result in walker {
            match result {
                Ok(entry) => {
                    if entry.file_type().is_some_and(|ft| ft.is_file())
                        && self.rules.has_allowed_extension(entry.path())
                    {
                        files.push(entry.into_path());
                    }
                }
                Err(err) => warn!("Skipping unreadable path during scan: {}", err),
            }
        }

        debug!("Scanned {}: {} eligible files", self.root.display(), files.len());
        files
    }

    /// Runs [`scan`](Self::scan) on the blocking pool.
    pub async fn scan_async(&self) -> anyhow::Result<Vec<PathBuf>> {
        let scanner = self.clone();
        Ok(tokio::task::spawn_blocking(move || scanner.scan()).await?)
    }
}

/// Source of file contents for the indexer.
#[async_trait]
pub trait WorkspaceReader: Send + Sync {
    async fn read_file(&self, path: &Path) -> std::io::Result<String>;
}

/// Reads files from the local file system. Non-UTF-8 files are read errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsReader;

#[async_trait]
impl WorkspaceReader for FsReader {
    async fn read_file(&self, path: &Path) -> std::io::Result<String> {
        tokio::fs::read_to_string(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn rules(extensions: &[&str]) -> ScanRules {
        ScanRules::from_config(&IndexingConfig::default().with_extensions(extensions.iter().copied()))
    }

    fn relative(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_scan_filters_and_prunes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "a.md", "a");
        write(root, "b.txt", "b");
        write(root, "image.png", "x");
        write(root, "docs/c.md", "c");
        write(root, "docs/deep/d.MD", "d");
        write(root, "node_modules/pkg/readme.md", "skip");
        write(root, ".git/notes.md", "skip");
        write(root, ".cairn/metadata.md", "skip");
        write(root, "target/out.md", "skip");

        let scanner = WorkspaceScanner::new(root, rules(&["md", "txt"]));
        let files = relative(root, &scanner.scan());

        assert_eq!(files, vec!["a.md", "b.txt", "docs/c.md", "docs/deep/d.MD"]);
    }

    #[test]
    fn test_scan_respects_gitignore() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, ".gitignore", "generated/\n");
        write(root, "keep.md", "k");
        write(root, "generated/skip.md", "s");

        let scanner = WorkspaceScanner::new(root, rules(&["md"]));
        assert_eq!(relative(root, &scanner.scan()), vec!["keep.md"]);

        let mut config = IndexingConfig::default().with_extensions(["md"]);
        config.respect_gitignore = false;
        let scanner = WorkspaceScanner::new(root, ScanRules::from_config(&config));
        assert_eq!(scanner.scan().len(), 2);
    }

    #[test]
    fn test_is_eligible() {
        let rules = rules(&["md"]);
        let ws = Path::new("/ws");
        assert!(rules.is_eligible(ws, Path::new("/ws/notes/a.md")));
        assert!(!rules.is_eligible(ws, Path::new("/ws/notes/a.rs")));
        assert!(!rules.is_eligible(ws, Path::new("/ws/node_modules/a.md")));
        assert!(!rules.is_eligible(ws, Path::new("/ws/.cairn/a.md")));
        assert!(!rules.is_eligible(ws, Path::new("/elsewhere/a.md")));
    }

    #[test]
    fn test_ignored_path_is_pruned() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "a.md", "a");
        write(root, "idx/metadata.json", "{}");
        write(root, "data/idx/keep.json", "{}");

        let rules = rules(&["md", "json"]).with_ignored_path("idx");
        let scanner = WorkspaceScanner::new(root, rules.clone());
        assert_eq!(
            relative(root, &scanner.scan()),
            vec!["a.md", "data/idx/keep.json"]
        );

        assert!(!rules.is_eligible(root, &root.join("idx/metadata.json")));
        assert!(rules.is_eligible(root, &root.join("data/idx/keep.json")));
        assert!(rules.in_ignored_dir(Path::new("idx")));
    }

    #[tokio::test]
    async fn test_scan_missing_root_is_empty() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let scanner = WorkspaceScanner::new(dir.path().join("nope"), rules(&["md"]));
        assert!(scanner.scan_async().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_fs_reader() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("a.md");
        tokio::fs::write(&path, "hello").await?;
        assert_eq!(FsReader.read_file(&path).await?, "hello");
        assert!(FsReader.read_file(&dir.path().join("missing")).await.is_err());
        Ok(())
    }
}
