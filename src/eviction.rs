//! Pure sort-and-select eviction policy.
//!
//! Both passes operate on a snapshot of `(path, size, last_access)` tuples
//! and never touch the index or disk themselves; [`crate::cache_engine`]
//! is the only caller that turns their output into real removals, which
//! keeps the ordering logic trivially testable (see §8 of the
//! specification: LRU ordering, size tiebreak, bucketed tolerance, and the
//! Pass-B low-watermark stop are all exercised directly against this
//! module in the tests below).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::file_index::CachedFile;

const DAY: u64 = 24 * 60 * 60;

fn day_bucket(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() / DAY).unwrap_or(0)
}

/// Returns the paths of every entry whose `last_access` predates
/// `now - max_age`, i.e. Pass A of the eviction loop.
pub fn age_sweep(entries: &[CachedFile], max_age: Duration, now: SystemTime) -> Vec<String> {
    let cutoff = now.checked_sub(max_age).unwrap_or(UNIX_EPOCH);
    entries
        .iter()
        .filter(|e| e.last_access < cutoff)
        .map(|e| e.path.clone())
        .collect()
}

/// Orders `entries` for Pass B: older calendar day first; within the same
/// day, larger size first. This is the "LRU with size tiebreak" total
/// order from the specification — the day bucket exists so that a file a
/// few seconds newer than a much larger one does not save the large file
/// from eviction.
pub fn sort_for_eviction(mut entries: Vec<CachedFile>) -> Vec<CachedFile> {
    entries.sort_by(|a, b| {
        day_bucket(a.last_access)
            .cmp(&day_bucket(b.last_access))
            .then(b.size.cmp(&a.size))
    });
    entries
}

/// Walks entries in eviction order, accumulating sizes, and returns the
/// prefix of paths to evict so that their summed size is at least
/// `total_size - low_watermark`. Returns an empty list when
/// `total_size <= high_watermark` (Pass B is a no-op) or the index is
/// empty.
pub fn size_sweep(
    entries: Vec<CachedFile>,
    total_size: u64,
    low_watermark: u64,
    high_watermark: u64,
) -> Vec<String> {
    if total_size <= high_watermark || entries.is_empty() {
        return Vec::new();
    }

    let bytes_to_free = total_size.saturating_sub(low_watermark);
    let ordered = sort_for_eviction(entries);

    let mut freed = 0u64;
    let mut out = Vec::new();
    for entry in ordered {
        if freed >= bytes_to_free {
            break;
        }
        freed += entry.size;
        out.push(entry.path);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn file(path: &str, size: u64, secs: u64) -> CachedFile {
        CachedFile {
            path: path.to_string(),
            size,
            last_access: at(secs),
        }
    }

    #[test]
    fn lru_ordering_oldest_first() {
        let entries = vec![
            file("p1", 1000, 1449488976),
            file("p2", 1000, 1449688978),
            file("p3", 1000, 1449588977),
        ];
        let sorted = sort_for_eviction(entries);
        let paths: Vec<_> = sorted.into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["p1", "p3", "p2"]);
    }

    #[test]
    fn size_tiebreak_same_timestamp() {
        let entries = vec![
            file("p1", 10, 1449488976),
            file("p2", 100_000, 1449488976),
            file("p3", 1000, 1449488976),
        ];
        let sorted = sort_for_eviction(entries);
        let paths: Vec<_> = sorted.into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["p2", "p3", "p1"]);
    }

    #[test]
    fn bucketed_tolerance_small_age_gap_does_not_save_large_file() {
        let entries = vec![
            file("p1", 10, 1449488976),
            file("p2", 100_000, 1449488978),
            file("p3", 1000, 1449488977),
        ];
        let sorted = sort_for_eviction(entries);
        let paths: Vec<_> = sorted.into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["p2", "p3", "p1"]);
    }

    #[test]
    fn pass_b_stops_at_low_watermark() {
        let entries = vec![
            file("p1", 1000, 1),
            file("p2", 1000, 2),
            file("p3", 1000, 3),
        ];
        let evicted = size_sweep(entries, 3000, 1700, 2500);
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted, vec!["p1", "p2"]);
    }

    #[test]
    fn pass_b_noop_when_exactly_at_high_watermark() {
        let entries = vec![file("p1", 1000, 1)];
        let evicted = size_sweep(entries, 1000, 500, 1000);
        assert!(evicted.is_empty());
    }

    #[test]
    fn pass_b_noop_on_empty_index() {
        let evicted = size_sweep(Vec::new(), 0, 0, 100);
        assert!(evicted.is_empty());
    }

    #[test]
    fn age_sweep_selects_entries_older_than_cutoff() {
        let now = at(10_000);
        let entries = vec![
            file("old", 10, 0),
            file("new", 10, 9_999),
        ];
        let evicted = age_sweep(&entries, Duration::from_secs(100), now);
        assert_eq!(evicted, vec!["old".to_string()]);
    }
}
