//! Scoped virtual filesystem rooted at `memories/<bot>/...`, used for
//! markdown/JSON blobs the LLM can read and edit through the `memory` tool.
//!
//! Grounded in the teacher's `tools/file.rs` (tokio::fs read/write/list, a
//! path-guard idiom) generalized from a single protected-path denylist to
//! full canonicalize-and-prefix-check validation, per the six-operation
//! contract this crate's MemoryStore implements.

pub mod followup;
pub mod stats;

use crate::error::{MemoryError, Result};
use tokio::sync::Mutex;

/// View result for a single memory path: a directory listing or file text.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewResult {
    Directory(Vec<DirEntry>),
    File(String),
}

/// One entry in a directory listing. `is_dir` lets the LLM decide whether to
/// recurse without issuing a second View call.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// A path-scoped virtual filesystem, exclusive to one bot. All six
/// operations are serialized behind `lock` per spec's "memory operations
/// serialized per bot".
pub struct MemoryStore {
    root: std::path::PathBuf,
    bot_id: String,
    lock: Mutex<()>,
}

impl MemoryStore {
    /// `root` is the bot's memory root, e.g. `memories/<bot>`. Created if
    /// absent. `bot_id` is the segment callers address this store as, per
    /// the `/memories/<bot_id>/...` path convention the `memory` tool
    /// documents.
    pub async fn new(root: std::path::PathBuf, bot_id: impl Into<String>) -> Result<Self> {
        tokio::fs::create_dir_all(&root).await.map_err(|source| MemoryError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self {
            root,
            bot_id: bot_id.into(),
            lock: Mutex::new(()),
        })
    }

    /// Canonicalize `requested` against the bot root and reject anything
    /// that would escape it. The root itself and anything under it are
    /// allowed; `..` segments and absolute paths outside the root are not.
    /// Accepts both a bare path (`/notes.md`) and one carrying the full
    /// `/memories/<bot_id>/...` prefix the tool description advertises —
    /// the latter is stripped before joining to `self.root`, so addressing
    /// the bot root as `/memories/<bot_id>` views the root itself rather
    /// than a nonexistent nested `memories/<bot_id>/memories/<bot_id>`.
    fn resolve(&self, requested: &str) -> Result<std::path::PathBuf> {
        if requested.split('/').any(|segment| segment == "..") {
            return Err(MemoryError::InvalidPath(requested.to_string()).into());
        }

        let relative = self.strip_bot_prefix(requested);
        let candidate = if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        };

        let root_canonical = self
            .root
            .canonicalize()
            .map_err(|source| MemoryError::Io { path: self.root.display().to_string(), source })?;

        // The candidate may not exist yet (e.g. Create of a new file), so
        // canonicalize its existing ancestor and rejoin the remaining tail.
        let canonical = canonicalize_lenient(&candidate)
            .map_err(|source| MemoryError::Io { path: candidate.display().to_string(), source })?;

        if canonical != root_canonical && !canonical.starts_with(&root_canonical) {
            return Err(MemoryError::InvalidPath(requested.to_string()).into());
        }

        Ok(candidate)
    }

    /// Strips a leading `/memories/<bot_id>` segment (with or without a
    /// trailing slash) and any remaining leading slash, leaving a path
    /// relative to `self.root`.
    fn strip_bot_prefix<'a>(&self, requested: &'a str) -> &'a str {
        let trimmed = requested.trim_start_matches('/');
        let prefix = format!("memories/{}", self.bot_id);
        match trimmed.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.trim_start_matches('/'),
            None => trimmed,
        }
    }

    /// For a directory, lists children; for a file, returns full text or an
    /// inclusive 1-indexed line range; for an empty file, returns the
    /// literal marker text rather than an empty string.
    pub async fn view(&self, path: &str, range: Option<(usize, usize)>) -> Result<ViewResult> {
        let _guard = self.lock.lock().await;
        let resolved = self.resolve(path)?;

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| MemoryError::NotFound(path.to_string()))?;

        if metadata.is_dir() {
            let mut entries = Vec::new();
            let mut reader = tokio::fs::read_dir(&resolved)
                .await
                .map_err(|source| MemoryError::Io { path: resolved.display().to_string(), source })?;
            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|source| MemoryError::Io { path: resolved.display().to_string(), source })?
            {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                entries.push(DirEntry {
                    name: entry.file_name().to_string_lossy().to_string(),
                    is_dir,
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(ViewResult::Directory(entries));
        }

        let text = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|source| MemoryError::Io { path: resolved.display().to_string(), source })?;

        if text.is_empty() {
            return Ok(ViewResult::File(format!("File exists but is empty: {path}")));
        }

        match range {
            None => Ok(ViewResult::File(text)),
            Some((start, end)) => {
                let lines: Vec<&str> = text.lines().collect();
                let start_idx = start.saturating_sub(1).min(lines.len());
                let end_idx = end.min(lines.len());
                let slice = if start_idx < end_idx {
                    lines[start_idx..end_idx].join("\n")
                } else {
                    String::new()
                };
                Ok(ViewResult::File(slice))
            }
        }
    }

    /// Creates parent directories as needed; overwrites an existing file.
    pub async fn create(&self, path: &str, text: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| MemoryError::Io { path: parent.display().to_string(), source })?;
        }
        tokio::fs::write(&resolved, text)
            .await
            .map_err(|source| MemoryError::Io { path: resolved.display().to_string(), source })?;
        Ok(())
    }

    /// Replaces the first occurrence of `old` with `new`; fails with
    /// `NotFound` if `old` is absent.
    pub async fn str_replace(&self, path: &str, old: &str, new: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let resolved = self.resolve(path)?;
        let text = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|_| MemoryError::NotFound(path.to_string()))?;

        let Some(pos) = text.find(old) else {
            return Err(MemoryError::NotFound(format!("{old:?} not found in {path}")).into());
        };
        let mut replaced = String::with_capacity(text.len() - old.len() + new.len());
        replaced.push_str(&text[..pos]);
        replaced.push_str(new);
        replaced.push_str(&text[pos + old.len()..]);

        tokio::fs::write(&resolved, replaced)
            .await
            .map_err(|source| MemoryError::Io { path: resolved.display().to_string(), source })?;
        Ok(())
    }

    /// Inserts `text` before the 1-indexed `line`.
    pub async fn insert(&self, path: &str, line: usize, text: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let resolved = self.resolve(path)?;
        let original = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|_| MemoryError::NotFound(path.to_string()))?;

        let mut lines: Vec<&str> = original.lines().collect();
        let idx = line.saturating_sub(1).min(lines.len());
        lines.insert(idx, text);

        tokio::fs::write(&resolved, lines.join("\n"))
            .await
            .map_err(|source| MemoryError::Io { path: resolved.display().to_string(), source })?;
        Ok(())
    }

    /// Removes a file or directory, recursively for directories.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let resolved = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| MemoryError::NotFound(path.to_string()))?;

        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&resolved)
                .await
                .map_err(|source| MemoryError::Io { path: resolved.display().to_string(), source })?;
        } else {
            tokio::fs::remove_file(&resolved)
                .await
                .map_err(|source| MemoryError::Io { path: resolved.display().to_string(), source })?;
        }
        Ok(())
    }

    /// Moves/renames within the scoped root.
    pub async fn rename(&self, path: &str, new_path: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let from = self.resolve(path)?;
        let to = self.resolve(new_path)?;

        tokio::fs::metadata(&from)
            .await
            .map_err(|_| MemoryError::NotFound(path.to_string()))?;

        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| MemoryError::Io { path: parent.display().to_string(), source })?;
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|source| MemoryError::Io { path: to.display().to_string(), source })?;
        Ok(())
    }
}

/// Canonicalize the longest existing ancestor of `path` and rejoin the
/// remaining (not-yet-created) tail, so paths for not-yet-existing files
/// still resolve to a definite location for the root-containment check.
fn canonicalize_lenient(path: &std::path::Path) -> std::io::Result<std::path::PathBuf> {
    let mut remaining = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        match current.canonicalize() {
            Ok(base) => {
                let mut result = base;
                for segment in remaining.into_iter().rev() {
                    result.push(segment);
                }
                return Ok(result);
            }
            Err(e) => {
                let Some(file_name) = current.file_name().map(|s| s.to_owned()) else {
                    return Err(e);
                };
                remaining.push(file_name);
                if !current.pop() {
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("memories").join("bot1");
        let store = MemoryStore::new(root, "bot1").await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn create_then_view_round_trips_text() {
        let (store, _dir) = store().await;
        store.create("/notes.md", "hello").await.unwrap();
        let result = store.view("/notes.md", None).await.unwrap();
        assert_eq!(result, ViewResult::File("hello".into()));
    }

    #[tokio::test]
    async fn empty_file_view_returns_literal_marker() {
        let (store, _dir) = store().await;
        store.create("/empty.md", "").await.unwrap();
        let result = store.view("/empty.md", None).await.unwrap();
        match result {
            ViewResult::File(text) => assert!(text.starts_with("File exists but is empty:")),
            _ => panic!("expected file"),
        }
    }

    #[tokio::test]
    async fn str_replace_then_reverse_restores_original() {
        let (store, _dir) = store().await;
        store.create("/f.md", "the quick fox").await.unwrap();
        store.str_replace("/f.md", "quick", "slow").await.unwrap();
        store.str_replace("/f.md", "slow", "quick").await.unwrap();
        let result = store.view("/f.md", None).await.unwrap();
        assert_eq!(result, ViewResult::File("the quick fox".into()));
    }

    #[tokio::test]
    async fn str_replace_missing_old_fails_with_not_found() {
        let (store, _dir) = store().await;
        store.create("/f.md", "hello").await.unwrap();
        let err = store.str_replace("/f.md", "missing", "x").await.unwrap_err();
        assert!(matches!(err, crate::Error::Memory(MemoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn dotdot_traversal_is_rejected() {
        let (store, _dir) = store().await;
        let err = store.create("/../../etc/passwd", "x").await.unwrap_err();
        assert!(matches!(err, crate::Error::Memory(MemoryError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn rename_moves_file_within_scope() {
        let (store, _dir) = store().await;
        store.create("/a.md", "x").await.unwrap();
        store.rename("/a.md", "/sub/b.md").await.unwrap();
        let result = store.view("/sub/b.md", None).await.unwrap();
        assert_eq!(result, ViewResult::File("x".into()));
    }

    #[tokio::test]
    async fn prefixed_bot_path_resolves_the_same_as_a_bare_path() {
        let (store, _dir) = store().await;
        store.create("/memories/bot1/notes.md", "hello").await.unwrap();
        let result = store.view("/notes.md", None).await.unwrap();
        assert_eq!(result, ViewResult::File("hello".into()));
    }

    #[tokio::test]
    async fn viewing_the_bot_root_lists_its_contents() {
        let (store, _dir) = store().await;
        store.create("/notes.md", "hello").await.unwrap();
        let result = store.view("/memories/bot1", None).await.unwrap();
        match result {
            ViewResult::Directory(entries) => assert!(entries.iter().any(|e| e.name == "notes.md")),
            _ => panic!("expected directory"),
        }
    }
}
