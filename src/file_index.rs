//! In-memory concurrent map from relative artifact path to metadata.
//!
//! Mirrors the teacher's channel/task discipline of keeping shared mutable
//! state behind narrow, explicit entry points rather than ad-hoc locking
//! scattered through call sites: every mutation of the index goes through
//! [`FileIndex::lock_for_read`] or [`FileIndex::lock_for_write`], and every
//! removal requires proof (a [`WriteGuard`]) that the caller already holds
//! the entry's write lock, per the acquisition order in the specification's
//! concurrency model: the per-entry lock is always acquired before the
//! coarse map operation that inserts or removes the entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Per-path metadata tracked by the index. Never exposed directly; callers
/// observe it only through [`FileIndex::snapshot`] or the two lock methods.
struct Entry {
    size: AtomicU64,
    last_access: Mutex<SystemTime>,
    read_count: AtomicU64,
    lock: Arc<RwLock<()>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            size: AtomicU64::new(0),
            last_access: Mutex::new(SystemTime::now()),
            read_count: AtomicU64::new(0),
            lock: Arc::new(RwLock::new(())),
        }
    }

    fn touch(&self) {
        *self.last_access.lock().unwrap() = SystemTime::now();
    }
}

/// A read-only snapshot of one entry's metadata at some past instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub path: String,
    pub size: u64,
    pub last_access: SystemTime,
}

/// Held while a reader is reading a path's bytes. Releases the per-entry
/// read lock on drop.
pub struct ReadGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Held while a writer is storing or removing a path's bytes. Releases the
/// per-entry write lock on drop. Required as proof of ownership by
/// [`FileIndex::remove`], which also uses the guard's entry identity to
/// avoid tearing down an entry that was recreated after a race (see
/// `remove`).
pub struct WriteGuard {
    _guard: OwnedRwLockWriteGuard<()>,
    entry: Arc<Entry>,
}

/// Concurrent bookkeeping for path -> metadata, plus the aggregate size
/// invariant `total_size == sum(entries[p].size)`.
#[derive(Default)]
pub struct FileIndex {
    entries: DashMap<String, Arc<Entry>>,
    total_size: AtomicU64,
}

impl FileIndex {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            total_size: AtomicU64::new(0),
        }
    }

    /// Acquires the path's read lock if the path exists, bumping
    /// `read_count` and `last_access`. Returns `None` without side effects
    /// if the path is absent.
    pub async fn lock_for_read(&self, path: &str) -> Option<ReadGuard> {
        let entry = self.entries.get(path)?.clone();
        let guard = entry.lock.clone().read_owned().await;
        entry.read_count.fetch_add(1, Ordering::Relaxed);
        entry.touch();
        Some(ReadGuard { _guard: guard })
    }

    /// Acquires the path's write lock, inserting a fresh entry with `size`
    /// if the path is absent. Adjusts `total_size` by `new_size - old_size`
    /// atomically with the insert/update.
    pub async fn lock_for_write(&self, path: &str, size: u64) -> WriteGuard {
        let entry = match self.entries.entry(path.to_string()) {
            DashEntry::Occupied(o) => o.get().clone(),
            DashEntry::Vacant(v) => {
                let fresh = Arc::new(Entry::new());
                v.insert(fresh.clone());
                fresh
            }
        };

        let guard = entry.lock.clone().write_owned().await;

        let old_size = entry.size.swap(size, Ordering::SeqCst);
        if size >= old_size {
            self.total_size.fetch_add(size - old_size, Ordering::SeqCst);
        } else {
            self.total_size.fetch_sub(old_size - size, Ordering::SeqCst);
        }
        entry.touch();

        WriteGuard { _guard: guard, entry }
    }

    /// Acquires the write lock for `path` without inserting a new entry.
    /// Returns `None` if the path is currently absent. Used by
    /// `delete_prefix` and the eviction loop, which only ever want to
    /// remove entries they already observed in a snapshot, never create
    /// one.
    pub async fn lock_for_removal(&self, path: &str) -> Option<WriteGuard> {
        let entry = self.entries.get(path)?.clone();
        let guard = entry.lock.clone().write_owned().await;
        Some(WriteGuard { _guard: guard, entry })
    }

    /// Inserts an entry with an explicit `last_access`, bypassing the
    /// "touch to now" semantics of `lock_for_write`. Used only by
    /// `CacheEngine::new` to repopulate the index from a disk rescan,
    /// before the engine serves any request.
    pub fn restore(&self, path: &str, size: u64, last_access: SystemTime) {
        let entry = Entry::new();
        entry.size.store(size, Ordering::SeqCst);
        *entry.last_access.lock().unwrap() = last_access;
        self.entries.insert(path.to_string(), Arc::new(entry));
        self.total_size.fetch_add(size, Ordering::SeqCst);
    }

    /// Removes `path` from the index and subtracts its size from
    /// `total_size`. The caller must already hold the entry's write lock;
    /// consuming the [`WriteGuard`] enforces this at the type level.
    ///
    /// If a concurrent writer replaced the entry after this guard was
    /// acquired (the old entry was removed and a fresh one inserted under
    /// the same path), this is a no-op: the guard's lock no longer
    /// protects the current entry, so removing it would tear down state
    /// the guard holder never observed. Per the specification's race
    /// tie-break, either outcome of such a race is acceptable; this
    /// implementation never removes an entry out from under a lock it
    /// does not hold.
    pub fn remove(&self, path: &str, guard: WriteGuard) {
        let should_remove = self
            .entries
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(&current, &guard.entry));

        if should_remove {
            if let Some((_, entry)) = self.entries.remove(path) {
                self.total_size
                    .fetch_sub(entry.size.load(Ordering::SeqCst), Ordering::SeqCst);
            }
        }
        drop(guard);
    }

    /// A point-in-time copy of every entry's `(path, size, last_access)`.
    /// Safe to iterate outside any lock; may miss concurrent changes.
    pub fn snapshot(&self) -> Vec<CachedFile> {
        self.entries
            .iter()
            .map(|entry| CachedFile {
                path: entry.key().clone(),
                size: entry.value().size.load(Ordering::SeqCst),
                last_access: *entry.value().last_access.lock().unwrap(),
            })
            .collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// Read count for `path`, or `None` if the path is not indexed. Soft
    /// observability counter only.
    pub fn read_count(&self, path: &str) -> Option<u64> {
        self.entries
            .get(path)
            .map(|e| e.read_count.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_read_round_trips() {
        let index = FileIndex::new();
        let w = index.lock_for_write("p1", 10).await;
        index.remove("p1", w);
        assert!(!index.contains("p1"));
    }

    #[tokio::test]
    async fn total_size_tracks_inserts_and_updates() {
        let index = FileIndex::new();
        let w = index.lock_for_write("p1", 100).await;
        drop(w);
        assert_eq!(index.total_size(), 100);

        let w = index.lock_for_write("p1", 40).await;
        drop(w);
        assert_eq!(index.total_size(), 40);
    }

    #[tokio::test]
    async fn total_size_drops_to_zero_after_remove() {
        let index = FileIndex::new();
        let w = index.lock_for_write("p1", 50).await;
        index.remove("p1", w);
        assert_eq!(index.total_size(), 0);
        assert_eq!(index.count(), 0);
    }

    #[tokio::test]
    async fn missing_path_read_returns_none() {
        let index = FileIndex::new();
        assert!(index.lock_for_read("missing").await.is_none());
    }

    #[tokio::test]
    async fn read_bumps_read_count_and_last_access() {
        let index = FileIndex::new();
        let w = index.lock_for_write("p1", 10).await;
        drop(w);
        assert_eq!(index.read_count("p1"), Some(0));
        let r = index.lock_for_read("p1").await;
        assert!(r.is_some());
        assert_eq!(index.read_count("p1"), Some(1));
    }

    #[tokio::test]
    async fn lock_for_removal_returns_none_for_missing_path() {
        let index = FileIndex::new();
        assert!(index.lock_for_removal("missing").await.is_none());
    }

    #[tokio::test]
    async fn lock_for_removal_does_not_recreate_entry() {
        let index = FileIndex::new();
        assert!(index.lock_for_removal("p1").await.is_none());
        assert!(!index.contains("p1"));
        assert_eq!(index.total_size(), 0);
    }

    #[tokio::test]
    async fn remove_is_noop_if_entry_was_replaced_after_guard_acquired() {
        let index = FileIndex::new();
        let w = index.lock_for_write("p1", 10).await;
        drop(w);

        let stale_guard = index.lock_for_removal("p1").await.unwrap();
        // Simulate a concurrent store that replaced the entry while the
        // stale guard's lock is already released in spirit (guard held
        // only conceptually here since we can't interleave real tasks in
        // a unit test): remove the entry out-of-band, then recreate it.
        let fresh = index.lock_for_write("p1", 10).await;
        drop(fresh);
        let recreated = index.lock_for_write("p1", 99).await;
        drop(recreated);

        index.remove("p1", stale_guard);
        // The entry inserted after the stale guard was acquired survives.
        assert!(index.contains("p1"));
        assert_eq!(index.total_size(), 99);
    }

    #[tokio::test]
    async fn restore_sets_last_access_without_touching_to_now() {
        let index = FileIndex::new();
        let past = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000);
        index.restore("p1", 10, past);
        let snap = index.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].last_access, past);
        assert_eq!(index.total_size(), 10);
    }

    #[tokio::test]
    async fn snapshot_reflects_current_entries() {
        let index = FileIndex::new();
        drop(index.lock_for_write("a", 10).await);
        drop(index.lock_for_write("b", 20).await);
        let mut snap: Vec<_> = index.snapshot().into_iter().map(|c| (c.path, c.size)).collect();
        snap.sort();
        assert_eq!(snap, vec![("a".to_string(), 10), ("b".to_string(), 20)]);
    }
}
