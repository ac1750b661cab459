//! Canonical artifact path builder.
//!
//! `PathKey` is the sole authority on how an artifact's external identity
//! `(os, arch, package, target, hash, file)` maps onto the relative path
//! used as the key into [`crate::file_index::FileIndex`] and the location
//! on disk under the cache root. It is a pure function with no state.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Builds the relative path for a single artifact file.
///
/// `"{os}_{arch}/{package}/{target}/{base64url(hash)}/{file}"`. Components
/// are accepted verbatim; no normalization beyond joining with `/` is
/// performed.
pub fn build(os: &str, arch: &str, package: &str, target: &str, hash: &[u8], file: &str) -> String {
    format!(
        "{}/{}",
        delete_prefix_for(os, arch, package, target),
        join2(&encode_hash(hash), file)
    )
}

/// Builds the prefix shared by every file belonging to `(os, arch, package,
/// target)`, i.e. the path up through (but not including) the hash
/// component. Used by [`crate::cache_engine::CacheEngine::delete_prefix`].
pub fn delete_prefix_for(os: &str, arch: &str, package: &str, target: &str) -> String {
    format!("{}_{}/{}/{}", os, arch, package, target)
}

/// Builds the directory path shared by every file under one content hash,
/// i.e. the path up through the hash component. Used by the RPC server to
/// compute the root for a `Retrieve`/`Store` request before appending each
/// artifact's individual file path.
pub fn hash_root(os: &str, arch: &str, package: &str, target: &str, hash: &[u8]) -> String {
    join2(&delete_prefix_for(os, arch, package, target), &encode_hash(hash))
}

fn encode_hash(hash: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(hash)
}

fn join2(a: &str, b: &str) -> String {
    format!("{a}/{b}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_stable_path() {
        let path = build("darwin", "amd64", "pkg", "lbl", b"hash", "lbl.ext");
        assert_eq!(path, "darwin_amd64/pkg/lbl/aGFzaA/lbl.ext");
    }

    #[test]
    fn deterministic_for_equal_inputs() {
        let a = build("linux", "amd64", "other", "lbl", b"hash", "out");
        let b = build("linux", "amd64", "other", "lbl", b"hash", "out");
        assert_eq!(a, b);
    }

    #[test]
    fn delete_prefix_matches_leading_segments_of_build() {
        let prefix = delete_prefix_for("linux", "amd64", "other", "lbl");
        let full = build("linux", "amd64", "other", "lbl", b"hash", "out");
        assert!(full.starts_with(&prefix));
    }

    #[test]
    fn hash_root_is_prefix_of_build() {
        let root = hash_root("linux", "amd64", "other", "lbl", b"hash");
        let full = build("linux", "amd64", "other", "lbl", b"hash", "out");
        assert_eq!(full, format!("{root}/out"));
    }

    #[test]
    fn different_hashes_produce_different_paths() {
        let a = build("linux", "amd64", "pkg", "lbl", b"hash-a", "f");
        let b = build("linux", "amd64", "pkg", "lbl", b"hash-b", "f");
        assert_ne!(a, b);
    }
}
