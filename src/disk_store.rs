//! Thin on-disk file layer under a single root directory.
//!
//! `DiskStore` owns no mutable state beyond the filesystem itself; all
//! serialization of concurrent access is provided by
//! [`crate::file_index::FileIndex`]'s per-entry locks and, for
//! `remove_all_under_root`, by the atomic move-aside-then-delete
//! discipline below.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// One file discovered by [`DiskStore::scan`], keyed by its path relative
/// to the cache root.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub relative_path: String,
    pub size: u64,
    pub last_access: SystemTime,
}

pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root directory if missing, with `0o775` permissions on
    /// Unix. Fatal if creation fails.
    pub async fn ensure_root(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        #[cfg(unix)]
        {
            let mut perms = tokio::fs::metadata(&self.root).await?.permissions();
            perms.set_mode(0o775);
            tokio::fs::set_permissions(&self.root, perms).await?;
        }
        Ok(())
    }

    /// Recursively walks the root, emitting one record per regular file.
    /// Directories are not emitted. `last_access` comes from the
    /// filesystem's access time when available, otherwise `SystemTime::now`.
    pub async fn scan(&self) -> std::io::Result<Vec<ScannedFile>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&root))
            .await
            .expect("scan task panicked")
    }

    /// Writes `bytes` to `relative_path`, creating parent directories as
    /// needed. Uses a temp-sibling-then-rename discipline so that any
    /// reader observing the final path also observes the complete bytes:
    /// the file is never visible at its final name until fully written.
    pub async fn write(&self, relative_path: &str, bytes: &[u8]) -> std::io::Result<()> {
        let dest = self.root.join(relative_path);
        let parent = dest.parent().expect("relative path has a parent").to_path_buf();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_blocking(&parent, &dest, &bytes))
            .await
            .expect("write task panicked")
    }

    /// Reads a single file or, if `relative_path` names a directory, every
    /// regular file beneath it, keyed by path relative to the store root.
    /// Fails with `NotFound` if nothing exists at that path.
    pub async fn read_tree(&self, relative_path: &str) -> std::io::Result<HashMap<String, Vec<u8>>> {
        let root = self.root.clone();
        let relative_path = relative_path.to_string();
        tokio::task::spawn_blocking(move || read_tree_blocking(&root, &relative_path))
            .await
            .expect("read_tree task panicked")
    }

    /// Recursively removes `relative_path`. Succeeds if the target is
    /// already absent.
    pub async fn remove(&self, relative_path: &str) -> std::io::Result<()> {
        let target = self.root.join(relative_path);
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Moves the root aside to a sibling suffixed `_deleting`, then
    /// asynchronously removes that sibling. The move is a single rename,
    /// minimizing the window during which partial state is visible.
    pub async fn remove_all_under_root(&self) -> std::io::Result<()> {
        let deleting = sibling_path(&self.root, "_deleting");

        match tokio::fs::rename(&self.root, &deleting).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }

        tokio::fs::create_dir_all(&self.root).await?;

        let deleting_clone = deleting.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&deleting_clone).await {
                warn!(path = %deleting_clone.display(), error = %e, "failed to remove moved-aside cache root");
            } else {
                debug!(path = %deleting_clone.display(), "removed moved-aside cache root");
            }
        });

        Ok(())
    }
}

fn sibling_path(root: &Path, suffix: &str) -> PathBuf {
    let file_name = root.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    root.with_file_name(format!("{file_name}{suffix}"))
}

fn scan_blocking(root: &Path) -> std::io::Result<Vec<ScannedFile>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in WalkDir::new(root).into_iter() {
        let entry = entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let last_access = meta.accessed().unwrap_or_else(|_| SystemTime::now());
        let relative_path = entry
            .path()
            .strip_prefix(root)
            .expect("walked entry is under root")
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        out.push(ScannedFile {
            relative_path,
            size: meta.len(),
            last_access,
        });
    }
    Ok(out)
}

fn write_blocking(parent: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

fn read_tree_blocking(root: &Path, relative_path: &str) -> std::io::Result<HashMap<String, Vec<u8>>> {
    let target = root.join(relative_path);
    let meta = std::fs::metadata(&target).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no such path: {relative_path}"))
        } else {
            e
        }
    })?;

    let mut out = HashMap::new();
    if meta.is_file() {
        out.insert(relative_path.to_string(), std::fs::read(&target)?);
        return Ok(out);
    }

    for entry in WalkDir::new(&target) {
        let entry = entry.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walked entry is under root")
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        out.insert(rel, std::fs::read(entry.path())?);
    }
    Ok(out)
}
