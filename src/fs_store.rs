//! Project filesystem adapter.
//!
//! Every path handed to a [`FileStore`] is relative to a project root:
//! - `src/App.tsx` → `{project}/src/App.tsx`
//! - anything that normalizes outside the root is refused

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Directory (inside each project) holding forgeloop's own bookkeeping.
pub const META_DIR: &str = ".forgeloop";

/// Top-level directories never reported as project files.
const IGNORED_DIRS: &[&str] = &[META_DIR, "node_modules", "dist", ".git"];

/// SHA-256 of `bytes` as lowercase hex.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Resolve `..` and `.` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Join `relative` onto `root`, returning `None` when the result escapes `root`.
pub fn contained_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let root = normalize_lexically(root);
    let joined = normalize_lexically(&root.join(relative));
    if joined.starts_with(&root) && joined != root {
        Some(joined)
    } else {
        None
    }
}

/// Filesystem operations the orchestrator needs from a project tree.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, root: &Path, path: &str) -> anyhow::Result<String>;

    /// Write `content`, creating parent directories as needed.
    async fn write(&self, root: &Path, path: &str, content: &str) -> anyhow::Result<()>;

    async fn delete(&self, root: &Path, path: &str) -> anyhow::Result<()>;

    async fn exists(&self, root: &Path, path: &str) -> bool;

    /// SHA-256 of the current content, or `None` if the file does not exist.
    async fn checksum(&self, root: &Path, path: &str) -> anyhow::Result<Option<String>>;

    /// Every readable text file under `root`, keyed by `/`-separated relative path.
    async fn list_project_files(&self, root: &Path) -> anyhow::Result<BTreeMap<String, String>>;

    async fn create_project_structure(&self, root: &Path, prompt: &str) -> anyhow::Result<()>;

    async fn save_task_log(
        &self,
        root: &Path,
        task_id: &str,
        log: &serde_json::Value,
    ) -> anyhow::Result<()>;

    async fn remove_project(&self, root: &Path) -> anyhow::Result<()>;
}

/// [`FileStore`] over the local disk.
#[derive(Debug, Default, Clone)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }

    fn resolve(root: &Path, path: &str) -> anyhow::Result<PathBuf> {
        contained_path(root, path)
            .ok_or_else(|| anyhow::anyhow!("Path escapes project root: {}", path))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn read(&self, root: &Path, path: &str) -> anyhow::Result<String> {
        let full = Self::resolve(root, path)?;
        tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }

    async fn write(&self, root: &Path, path: &str, content: &str) -> anyhow::Result<()> {
        let full = Self::resolve(root, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("Failed to write {}", full.display()))
    }

    async fn delete(&self, root: &Path, path: &str) -> anyhow::Result<()> {
        let full = Self::resolve(root, path)?;
        tokio::fs::remove_file(&full)
            .await
            .with_context(|| format!("Failed to delete {}", full.display()))
    }

    async fn exists(&self, root: &Path, path: &str) -> bool {
        match Self::resolve(root, path) {
            Ok(full) => tokio::fs::try_exists(&full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn checksum(&self, root: &Path, path: &str) -> anyhow::Result<Option<String>> {
        let full = Self::resolve(root, path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(sha256_hex(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to hash {}", full.display())),
        }
    }

    async fn list_project_files(&self, root: &Path) -> anyhow::Result<BTreeMap<String, String>> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut files = BTreeMap::new();
            if !root.exists() {
                return Ok(files);
            }
            let walker = walkdir::WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| {
                    entry.depth() != 1
                        || !IGNORED_DIRS
                            .iter()
                            .any(|ignored| entry.file_name() == *ignored)
                });
            for entry in walker {
                let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&root) {
                    Ok(rel) => rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                    Err(_) => continue,
                };
                match std::fs::read_to_string(entry.path()) {
                    Ok(content) => {
                        files.insert(relative, content);
                    }
                    Err(e) => {
                        tracing::debug!("Skipping unreadable file {}: {}", relative, e);
                    }
                }
            }
            Ok(files)
        })
        .await
        .context("File listing task panicked")?
    }

    async fn create_project_structure(&self, root: &Path, prompt: &str) -> anyhow::Result<()> {
        for dir in [META_DIR, "src", "tests"] {
            let full = root.join(dir);
            tokio::fs::create_dir_all(&full)
                .await
                .with_context(|| format!("Failed to create {}", full.display()))?;
        }
        let prompt_file = root.join(META_DIR).join("prompt.txt");
        tokio::fs::write(&prompt_file, prompt)
            .await
            .with_context(|| format!("Failed to write {}", prompt_file.display()))?;
        Ok(())
    }

    async fn save_task_log(
        &self,
        root: &Path,
        task_id: &str,
        log: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let body = serde_json::to_string_pretty(log)?;
        self.write(root, &format!("{}/{}.log.json", META_DIR, task_id), &body)
            .await
    }

    async fn remove_project(&self, root: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", root.display())),
        }
    }
}
