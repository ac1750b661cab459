//! Content-addressed build artifact cache: an on-disk, size-bounded,
//! per-entry-locked store served over HTTP and gRPC, with optional gossip
//! clustering and best-effort replication.

pub mod auth;
pub mod cache_engine;
pub mod cluster;
pub mod config;
pub mod disk_store;
pub mod error;
pub mod eviction;
pub mod file_index;
pub mod http_server;
pub mod path_key;
pub mod rpc;
