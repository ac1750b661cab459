//! Composes [`FileIndex`] and [`DiskStore`] into the cache's public API,
//! and owns the background eviction loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::disk_store::DiskStore;
use crate::error::{DeleteError, FatalError, RetrieveError, StoreError};
use crate::eviction;
use crate::file_index::FileIndex;

/// Read-only snapshot of the engine's size and watermark configuration,
/// exposed for diagnostics (the HTTP `/status` endpoint).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub total_size: u64,
    pub low_watermark: u64,
    pub high_watermark: u64,
}

/// An on-disk, size-bounded, per-entry-locked, LRU-evicting artifact
/// store. Construct with [`CacheEngine::new`]; the returned handle can be
/// cloned cheaply (it is `Arc`-backed internally) and shared across the
/// HTTP server, the RPC server, and the eviction task.
pub struct CacheEngine {
    index: FileIndex,
    disk: DiskStore,
    clean_interval: Duration,
    max_artifact_age: Duration,
    low_watermark: u64,
    high_watermark: u64,
    started_at: SystemTime,
    shutdown_tx: watch::Sender<bool>,
    eviction_running: AtomicBool,
}

impl CacheEngine {
    /// Creates the root directory if missing, rescans it to populate the
    /// index, and spawns the eviction loop. `low_watermark` must not
    /// exceed `high_watermark`; violating this is rejected at
    /// construction rather than silently tolerated at runtime.
    pub async fn new(
        root: impl Into<PathBuf>,
        clean_interval: Duration,
        max_artifact_age: Duration,
        low_watermark: u64,
        high_watermark: u64,
    ) -> Result<Arc<Self>, FatalError> {
        if low_watermark > high_watermark {
            return Err(FatalError::InvalidConfig(format!(
                "low_watermark ({low_watermark}) exceeds high_watermark ({high_watermark})"
            )));
        }

        let root = root.into();
        let disk = DiskStore::new(root.clone());
        disk.ensure_root()
            .await
            .map_err(|source| FatalError::RootUnavailable { path: root.clone(), source })?;

        let index = FileIndex::new();
        let scanned = disk
            .scan()
            .await
            .map_err(|source| FatalError::ScanFailed { path: root.clone(), source })?;
        for file in &scanned {
            index.restore(&file.relative_path, file.size, file.last_access);
        }
        info!(root = %root.display(), entries = scanned.len(), "cache engine rescanned root");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Arc::new(Self {
            index,
            disk,
            clean_interval,
            max_artifact_age,
            low_watermark,
            high_watermark,
            started_at: SystemTime::now(),
            shutdown_tx,
            eviction_running: AtomicBool::new(true),
        });

        engine.clone().spawn_eviction_loop(shutdown_rx);

        Ok(engine)
    }

    pub fn root(&self) -> &Path {
        self.disk.root()
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn total_size(&self) -> u64 {
        self.index.total_size()
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            count: self.count(),
            total_size: self.total_size(),
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }

    /// Stores `bytes` at `path`. At most one writer mutates `path`'s bytes
    /// at a time; a concurrent reader either sees the old bytes or the
    /// new ones in full, never a mixture.
    pub async fn store(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let guard = self.index.lock_for_write(path, bytes.len() as u64).await;

        if let Err(source) = self.disk.write(path, bytes).await {
            self.index.remove(path, guard);
            if let Err(cleanup_err) = self.disk.remove(path).await {
                warn!(%path, error = %cleanup_err, "failed to clean up partial write");
            }
            return Err(StoreError::Io { path: PathBuf::from(path), source });
        }

        drop(guard);
        Ok(())
    }

    /// Retrieves the bytes at `path`. If `path` is indexed, returns its
    /// (single) file; if not indexed but present on disk as a directory,
    /// returns every file beneath it without taking an index lock
    /// (directories are never tracked as index entries).
    pub async fn retrieve(&self, path: &str) -> Result<HashMap<String, Vec<u8>>, RetrieveError> {
        match self.index.lock_for_read(path).await {
            Some(guard) => {
                let result = self.disk.read_tree(path).await;
                drop(guard);
                result.map_err(|source| classify_retrieve_error(path, source))
            }
            None => match self.disk.read_tree(path).await {
                Ok(map) => Ok(map),
                Err(source) => Err(classify_retrieve_error(path, source)),
            },
        }
    }

    /// Removes every indexed entry whose path has `path_prefix` as a
    /// string prefix, then recursively removes the matching on-disk
    /// subtree. The two phases are deliberately decoupled: a concurrent
    /// reader arriving between them either sees `NotFound` (index already
    /// pruned) or a disk read error (subtree already removed); clients
    /// are expected to retry either way.
    pub async fn delete_prefix(&self, path_prefix: &str) -> Result<(), DeleteError> {
        let matching: Vec<String> = self
            .index
            .snapshot()
            .into_iter()
            .map(|e| e.path)
            .filter(|p| p.starts_with(path_prefix))
            .collect();

        for path in matching {
            if let Some(guard) = self.index.lock_for_removal(&path).await {
                self.index.remove(&path, guard);
            }
        }

        self.disk
            .remove(path_prefix)
            .await
            .map_err(|source| DeleteError::Io { path: PathBuf::from(path_prefix), source })
    }

    /// Drops every index entry, resets `total_size` to zero, removes
    /// everything under the cache root, then rescans (typically landing
    /// on an empty index).
    pub async fn delete_all(&self) -> Result<(), DeleteError> {
        let all: Vec<String> = self.index.snapshot().into_iter().map(|e| e.path).collect();
        for path in all {
            if let Some(guard) = self.index.lock_for_removal(&path).await {
                self.index.remove(&path, guard);
            }
        }

        self.disk
            .remove_all_under_root()
            .await
            .map_err(|source| DeleteError::Io { path: self.disk.root().to_path_buf(), source })?;

        match self.disk.scan().await {
            Ok(scanned) => {
                for file in scanned {
                    self.index.restore(&file.relative_path, file.size, file.last_access);
                }
            }
            Err(e) => warn!(error = %e, "rescan after delete_all failed; index left empty"),
        }

        Ok(())
    }

    /// Signals the eviction loop to stop after its current tick.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_eviction_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.clean_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_eviction_tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            self.eviction_running.store(false, Ordering::SeqCst);
                            debug!("eviction loop shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn run_eviction_tick(&self) {
        self.age_sweep().await;
        self.size_sweep().await;
    }

    async fn age_sweep(&self) {
        let snapshot = self.index.snapshot();
        let stale = eviction::age_sweep(&snapshot, self.max_artifact_age, SystemTime::now());
        for path in stale {
            self.evict_one(&path).await;
        }
    }

    async fn size_sweep(&self) {
        let snapshot = self.index.snapshot();
        let total = self.index.total_size();
        let to_evict = eviction::size_sweep(snapshot, total, self.low_watermark, self.high_watermark);
        for path in to_evict {
            self.evict_one(&path).await;
        }
    }

    async fn evict_one(&self, path: &str) {
        if let Some(guard) = self.index.lock_for_removal(path).await {
            self.index.remove(path, guard);
            if let Err(e) = self.disk.remove(path).await {
                warn!(%path, error = %e, "failed to remove evicted file from disk");
            } else {
                debug!(%path, "evicted");
            }
        }
    }
}

fn classify_retrieve_error(path: &str, source: std::io::Error) -> RetrieveError {
    if source.kind() == std::io::ErrorKind::NotFound {
        RetrieveError::NotFound { path: PathBuf::from(path) }
    } else {
        RetrieveError::Io { path: PathBuf::from(path), source }
    }
}
