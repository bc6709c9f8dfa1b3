//! Directory walking via the `ignore` crate, plus relative-path helpers
//!
//! Everything under the root is visited, hidden entries included. No ignore files are
//! honoured: the synchronized tree is mirrored exactly.

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use ignore::WalkBuilder;
use tracing::{debug, warn};

/// Suffix of scratch files written while a patch is being applied
pub const TEMP_SUFFIX: &str = ".swarmsync-tmp";

/// A filesystem entry found during a walk
#[derive(Debug, Clone)]
pub struct ScanEntry {
    /// Path relative to the scan root, `/`-separated
    pub relative_path: String,
    /// Absolute path on disk
    pub path: PathBuf,
    /// Metadata captured at listing time
    pub metadata: Metadata,
}

impl ScanEntry {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.metadata.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scanner for a synchronized directory tree
pub struct Scanner {
    root: PathBuf,
}

impl Scanner {
    /// Create a new scanner for the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a configured walk builder
    fn walk_builder(&self) -> WalkBuilder {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .ignore(false)
            .parents(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(false)
            .sort_by_file_path(|a, b| a.cmp(b));
        builder
    }

    /// Walk the tree and return every directory and file below the root.
    ///
    /// Entries that disappear between listing and stat, or that cannot be listed,
    /// are skipped rather than aborting the walk. A missing root yields nothing.
    ///
    /// # Errors
    /// Returns an error only if the root exists but is not a directory.
    pub fn scan(&self) -> Result<Vec<ScanEntry>> {
        if !self.root.exists() {
            debug!("Scan root {} does not exist", self.root.display());
            return Ok(Vec::new());
        }
        if !self.root.is_dir() {
            bail!("scan root {} is not a directory", self.root.display());
        }

        let mut entries = Vec::new();

        for result in self.walk_builder().build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {e}");
                    continue;
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            let path = entry.path();
            if path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().ends_with(TEMP_SUFFIX))
            {
                continue;
            }

            // Vanished since it was listed
            let Ok(metadata) = std::fs::metadata(path) else {
                debug!("Entry vanished during scan: {}", path.display());
                continue;
            };

            if !metadata.is_dir() && !metadata.is_file() {
                debug!("Skipping special file: {}", path.display());
                continue;
            }

            let Some(relative_path) = relative_path(&self.root, path) else {
                continue;
            };

            entries.push(ScanEntry {
                relative_path,
                path: path.to_path_buf(),
                metadata,
            });
        }

        Ok(entries)
    }
}

/// Express `path` relative to `root` with `/` separators
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Resolve a received relative path against `root`.
///
/// # Errors
/// Rejects absolute paths and any `..` component so a changeset can never write
/// outside the synchronized tree.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.starts_with('/') || Path::new(relative).is_absolute() {
        bail!("refusing absolute path: {relative:?}");
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;

    for part in relative.split('/') {
        let component = Path::new(part).components().next();
        match component {
            None | Some(Component::CurDir) => {}
            Some(Component::Normal(name)) if Path::new(part).components().count() == 1 => {
                resolved.push(name);
                depth += 1;
            }
            _ => return Err(eyre!("refusing path outside the root: {relative:?}")),
        }
    }

    if depth == 0 {
        bail!("empty relative path");
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(entries: &[ScanEntry]) -> Vec<String> {
        entries.iter().map(|e| e.relative_path.clone()).collect()
    }

    #[test]
    fn test_scan_includes_directories_and_hidden_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join(".hidden"), "h").unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();
        let mut found = paths(&entries);
        found.sort();

        assert_eq!(
            found,
            vec![".hidden", "sub", "sub/dir", "sub/dir/deep.txt", "sub/nested.txt"]
        );
        assert!(entries.iter().find(|e| e.relative_path == "sub").unwrap().is_dir());
    }

    #[test]
    fn test_scan_ignores_gitignore_rules() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("debug.log"), "kept").unwrap();

        let found = paths(&Scanner::new(dir.path()).scan().unwrap());
        assert!(found.contains(&"debug.log".to_string()), "paths: {found:?}");
        assert!(found.contains(&".git".to_string()), "paths: {found:?}");
    }

    #[test]
    fn test_scan_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join(format!(".a.txt{TEMP_SUFFIX}")), "partial").unwrap();

        assert_eq!(paths(&Scanner::new(dir.path()).scan().unwrap()), vec!["a.txt"]);
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let entries = Scanner::new(dir.path().join("nope")).scan().unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let root = Path::new("/sync");
        assert_eq!(resolve(root, "a/b.txt").unwrap(), PathBuf::from("/sync/a/b.txt"));
        assert!(resolve(root, "../etc/passwd").is_err());
        assert!(resolve(root, "a/../../x").is_err());
        assert!(resolve(root, "/etc/passwd").is_err());
        assert!(resolve(root, "").is_err());
    }
}
