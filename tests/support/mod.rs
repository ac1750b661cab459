//! Shared fixture for the integration tests in this directory: a real
//! `CacheEngine` rooted in a fresh temp directory, torn down with the
//! directory on drop.

use std::sync::Arc;
use std::time::Duration;

use artifact_cache::cache_engine::CacheEngine;
use tempfile::TempDir;

pub struct Fixture {
    pub engine: Arc<CacheEngine>,
    _root: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_watermarks(Duration::from_secs(3600), Duration::from_secs(3600), 0, u64::MAX).await
    }

    pub async fn with_watermarks(
        clean_interval: Duration,
        max_artifact_age: Duration,
        low_watermark: u64,
        high_watermark: u64,
    ) -> Self {
        let root = TempDir::new().expect("create fixture root");
        let engine = CacheEngine::new(root.path(), clean_interval, max_artifact_age, low_watermark, high_watermark)
            .await
            .expect("construct cache engine");
        Self { engine, _root: root }
    }
}

pub fn darwin_path(package: &str, target: &str, file: &str) -> String {
    artifact_cache::path_key::build("darwin", "amd64", package, target, b"hash", file)
}
