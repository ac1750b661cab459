//! Error kinds shared across the cache engine and both protocol servers.

use std::io;
use std::path::PathBuf;

/// Errors that can occur while storing an artifact.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write artifact at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that can occur while retrieving an artifact.
#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    #[error("no artifact at {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read artifact at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that can occur while deleting an artifact or prefix.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("failed to remove {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that abort process startup.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("cache root {path} could not be created")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to rescan cache root {path}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Authentication/authorization failures surfaced by the RPC server.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("no client certificate presented")]
    Unauthenticated,

    #[error("client certificate is not in the allowed set")]
    PermissionDenied,
}
