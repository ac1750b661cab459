//! Exercises the background eviction loop itself (not just the pure
//! `eviction` sort/select functions, which already have direct unit tests
//! colocated with that module) by running a `CacheEngine` with a short
//! `clean_interval` and observing state after real ticks.

#[path = "support/mod.rs"]
mod support;

use std::time::Duration;

use artifact_cache::error::RetrieveError;
use support::Fixture;

#[tokio::test]
async fn age_sweep_evicts_entries_older_than_max_artifact_age() {
    let fixture = Fixture::with_watermarks(
        Duration::from_millis(50),
        Duration::from_millis(10),
        0,
        u64::MAX,
    )
    .await;

    fixture.engine.store("stale", b"old bytes").await.unwrap();

    // Give the clock room to cross max_artifact_age, then let at least one
    // eviction tick run.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = fixture.engine.retrieve("stale").await.unwrap_err();
    assert!(matches!(err, RetrieveError::NotFound { .. }));
    assert_eq!(fixture.engine.count(), 0);
}

#[tokio::test]
async fn size_sweep_evicts_down_toward_low_watermark_oldest_first() {
    let fixture = Fixture::with_watermarks(
        Duration::from_millis(50),
        Duration::from_secs(3600),
        1_700,
        2_500,
    )
    .await;

    // Three 1000-byte entries stored in order; the sweep should drop the
    // oldest ones first until accumulated size frees at least 1300 bytes.
    fixture.engine.store("p1", &vec![0u8; 1000]).await.unwrap();
    fixture.engine.store("p2", &vec![0u8; 1000]).await.unwrap();
    fixture.engine.store("p3", &vec![0u8; 1000]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(fixture.engine.total_size() <= 2_500);
    assert!(fixture.engine.count() <= 2);
}

#[tokio::test]
async fn size_sweep_is_a_noop_below_high_watermark() {
    let fixture = Fixture::with_watermarks(
        Duration::from_millis(50),
        Duration::from_secs(3600),
        0,
        u64::MAX,
    )
    .await;

    fixture.engine.store("small", b"just a few bytes").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(fixture.engine.count(), 1);
    assert!(fixture.engine.retrieve("small").await.is_ok());
}
