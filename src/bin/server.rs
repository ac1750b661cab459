//! Binary entry point: parses configuration, builds one `CacheEngine`, and
//! serves it over HTTP and gRPC until interrupted.

use std::sync::Arc;

use artifact_cache::auth::AuthConfig;
use artifact_cache::cache_engine::CacheEngine;
use artifact_cache::cluster::Cluster;
use artifact_cache::config::{Cli, Config};
use artifact_cache::rpc::proto::cache_server::CacheServer;
use artifact_cache::rpc::RpcService;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(Cli::parse())?;
    info!(root = %config.root_path.display(), port = config.listen_port, "starting artifact cache");

    let engine = CacheEngine::new(
        config.root_path.clone(),
        config.clean_interval,
        config.max_artifact_age,
        config.low_watermark,
        config.high_watermark,
    )
    .await?;

    let cluster = if config.seed_cluster || !config.cluster_seeds.is_empty() {
        match Cluster::join(config.node_name.clone(), config.cluster_port, &config.cluster_seeds).await {
            Ok(cluster) => {
                info!(port = config.cluster_port, "joined cluster");
                Some(cluster)
            }
            Err(e) => {
                error!(error = %e, "failed to start cluster gossip layer; continuing unclustered");
                None
            }
        }
    } else {
        None
    };

    let auth = AuthConfig::from_dirs(
        config.readonly_certs_dir.as_deref(),
        config.writable_certs_dir.as_deref(),
    )?;

    let http_addr: std::net::SocketAddr = ([0, 0, 0, 0], config.listen_port).into();
    let http_engine = engine.clone();
    let mut http_task = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        info!(%http_addr, "HTTP server listening");
        axum::serve(listener, artifact_cache::http_server::router(http_engine)).await
    });

    let rpc_addr: std::net::SocketAddr = ([0, 0, 0, 0], config.listen_port + 1).into();
    let rpc_service = RpcService::new(engine.clone(), auth, cluster);
    let mut rpc_builder = tonic::transport::Server::builder();
    if let Some(tls) = load_tls_config(&config).await? {
        rpc_builder = rpc_builder.tls_config(tls)?;
    }

    const MAX_MESSAGE_BYTES: usize = 512 * 1024 * 1024;
    let cache_service = CacheServer::new(rpc_service)
        .max_decoding_message_size(MAX_MESSAGE_BYTES)
        .max_encoding_message_size(MAX_MESSAGE_BYTES);

    let mut rpc_task = tokio::spawn(async move {
        info!(%rpc_addr, "RPC server listening");
        rpc_builder.add_service(cache_service).serve(rpc_addr).await
    });

    // Race the two servers against the shutdown signal so a bind/serve
    // failure in either task propagates through `main`'s `?` instead of
    // panicking silently inside its spawned task.
    let outcome: Result<(), Box<dyn std::error::Error + Send + Sync>> = tokio::select! {
        res = &mut http_task => join_outcome(res),
        res = &mut rpc_task => join_outcome(res),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    engine.shutdown();
    http_task.abort();
    rpc_task.abort();

    outcome?;
    Ok(())
}

/// Flattens a spawned server task's `JoinHandle` result (task panic vs.
/// server error) into a single boxed error, so callers can propagate
/// either failure mode through `?` the same way.
fn join_outcome<E>(
    res: Result<Result<(), E>, tokio::task::JoinError>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Box::new(e)),
        Err(e) => Err(Box::new(e)),
    }
}

/// Builds a TLS config for the RPC server from `tls_key_file`/`tls_cert_file`,
/// requesting client certificates for mutual auth when `ca_cert_file` is
/// also configured. Returns `None` (plaintext) if no key/cert pair is set.
async fn load_tls_config(
    config: &Config,
) -> Result<Option<tonic::transport::ServerTlsConfig>, Box<dyn std::error::Error>> {
    let (Some(key_path), Some(cert_path)) = (&config.tls_key_file, &config.tls_cert_file) else {
        return Ok(None);
    };

    let cert = tokio::fs::read(cert_path).await?;
    let key = tokio::fs::read(key_path).await?;
    let identity = tonic::transport::Identity::from_pem(cert, key);
    let mut tls = tonic::transport::ServerTlsConfig::new().identity(identity);

    if let Some(ca_path) = &config.ca_cert_file {
        let ca = tokio::fs::read(ca_path).await?;
        tls = tls.client_ca_root(tonic::transport::Certificate::from_pem(ca));
    }

    Ok(Some(tls))
}
