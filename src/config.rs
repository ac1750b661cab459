//! Layered configuration: a TOML file deserialized with `serde`, overridden
//! field-by-field by CLI flags parsed with `clap`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::FatalError;

fn default_clean_interval() -> u64 {
    300
}

fn default_max_artifact_age() -> u64 {
    30 * 24 * 60 * 60
}

fn default_listen_port() -> u16 {
    8080
}

fn default_cluster_port() -> u16 {
    8081
}

fn default_cluster_size() -> usize {
    1
}

/// On-disk TOML representation of the cache's configuration. Every field
/// has a CLI-flag counterpart in [`Cli`]; CLI flags take precedence when
/// both are present.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub root_path: Option<PathBuf>,

    #[serde(default = "default_clean_interval")]
    pub clean_interval_secs: u64,

    #[serde(default = "default_max_artifact_age")]
    pub max_artifact_age_secs: u64,

    pub low_watermark: Option<u64>,
    pub high_watermark: Option<u64>,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    pub tls_key_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
    pub readonly_certs_dir: Option<PathBuf>,
    pub writable_certs_dir: Option<PathBuf>,

    #[serde(default = "default_cluster_port")]
    pub cluster_port: u16,

    #[serde(default)]
    pub cluster_seeds: Vec<String>,

    #[serde(default)]
    pub seed_cluster: bool,

    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,

    pub node_name: Option<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            root_path: None,
            clean_interval_secs: default_clean_interval(),
            max_artifact_age_secs: default_max_artifact_age(),
            low_watermark: None,
            high_watermark: None,
            listen_port: default_listen_port(),
            tls_key_file: None,
            tls_cert_file: None,
            ca_cert_file: None,
            readonly_certs_dir: None,
            writable_certs_dir: None,
            cluster_port: default_cluster_port(),
            cluster_seeds: Vec::new(),
            seed_cluster: false,
            cluster_size: default_cluster_size(),
            node_name: None,
        }
    }
}

/// Command-line flags. Every flag is optional; an unset flag falls back to
/// the config file's value, and an unset config file falls back to the
/// field default.
#[derive(Debug, Parser)]
#[command(name = "artifact-cache-server", about = "Content-addressed build artifact cache")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    #[arg(long)]
    pub root_path: Option<PathBuf>,

    #[arg(long)]
    pub clean_interval_secs: Option<u64>,

    #[arg(long)]
    pub max_artifact_age_secs: Option<u64>,

    #[arg(long)]
    pub low_watermark: Option<u64>,

    #[arg(long)]
    pub high_watermark: Option<u64>,

    #[arg(long)]
    pub listen_port: Option<u16>,

    #[arg(long)]
    pub tls_key_file: Option<PathBuf>,

    #[arg(long)]
    pub tls_cert_file: Option<PathBuf>,

    #[arg(long)]
    pub ca_cert_file: Option<PathBuf>,

    #[arg(long)]
    pub readonly_certs_dir: Option<PathBuf>,

    #[arg(long)]
    pub writable_certs_dir: Option<PathBuf>,

    #[arg(long)]
    pub cluster_port: Option<u16>,

    #[arg(long)]
    pub cluster_seeds: Vec<String>,

    #[arg(long)]
    pub seed_cluster: bool,

    #[arg(long)]
    pub cluster_size: Option<usize>,

    #[arg(long)]
    pub node_name: Option<String>,
}

/// Fully resolved configuration, ready to drive [`crate::cache_engine::CacheEngine`],
/// the HTTP server, the RPC server, and the optional cluster task.
#[derive(Debug, Clone)]
pub struct Config {
    pub root_path: PathBuf,
    pub clean_interval: Duration,
    pub max_artifact_age: Duration,
    pub low_watermark: u64,
    pub high_watermark: u64,
    pub listen_port: u16,
    pub tls_key_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
    pub readonly_certs_dir: Option<PathBuf>,
    pub writable_certs_dir: Option<PathBuf>,
    pub cluster_port: u16,
    pub cluster_seeds: Vec<String>,
    pub seed_cluster: bool,
    pub cluster_size: usize,
    pub node_name: String,
}

impl Config {
    /// Loads `file` (if given), applies `cli` overrides on top, and
    /// validates the result. Rejects a missing `root_path` and
    /// `low_watermark > high_watermark` (the behavior spec.md §9 leaves
    /// undefined, resolved here as a hard startup error rather than a
    /// runtime surprise).
    pub fn load(cli: Cli) -> Result<Self, FatalError> {
        let file = match &cli.config_file {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };

        let root_path = cli
            .root_path
            .or(file.root_path)
            .ok_or_else(|| FatalError::InvalidConfig("root_path is required".to_string()))?;

        let low_watermark = cli
            .low_watermark
            .or(file.low_watermark)
            .ok_or_else(|| FatalError::InvalidConfig("low_watermark is required".to_string()))?;
        let high_watermark = cli
            .high_watermark
            .or(file.high_watermark)
            .ok_or_else(|| FatalError::InvalidConfig("high_watermark is required".to_string()))?;

        if low_watermark > high_watermark {
            return Err(FatalError::InvalidConfig(format!(
                "low_watermark ({low_watermark}) exceeds high_watermark ({high_watermark})"
            )));
        }

        let mut cluster_seeds = file.cluster_seeds;
        cluster_seeds.extend(cli.cluster_seeds);

        Ok(Self {
            root_path,
            clean_interval: Duration::from_secs(cli.clean_interval_secs.unwrap_or(file.clean_interval_secs)),
            max_artifact_age: Duration::from_secs(cli.max_artifact_age_secs.unwrap_or(file.max_artifact_age_secs)),
            low_watermark,
            high_watermark,
            listen_port: cli.listen_port.unwrap_or(file.listen_port),
            tls_key_file: cli.tls_key_file.or(file.tls_key_file),
            tls_cert_file: cli.tls_cert_file.or(file.tls_cert_file),
            ca_cert_file: cli.ca_cert_file.or(file.ca_cert_file),
            readonly_certs_dir: cli.readonly_certs_dir.or(file.readonly_certs_dir),
            writable_certs_dir: cli.writable_certs_dir.or(file.writable_certs_dir),
            cluster_port: cli.cluster_port.unwrap_or(file.cluster_port),
            seed_cluster: cli.seed_cluster || file.seed_cluster,
            cluster_size: cli.cluster_size.unwrap_or(file.cluster_size),
            node_name: cli.node_name.or(file.node_name).unwrap_or_else(default_node_name),
            cluster_seeds,
        })
    }
}

fn default_node_name() -> String {
    hostname_or_fallback()
}

fn hostname_or_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "artifact-cache-node".to_string())
}

fn read_file_config(path: &std::path::Path) -> Result<FileConfig, FatalError> {
    let text = std::fs::read_to_string(path).map_err(|source| FatalError::RootUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text)
        .map_err(|e| FatalError::InvalidConfig(format!("failed to parse {}: {e}", path.display())))
}
