//! `tonic`-based RPC surface over [`crate::cache_engine::CacheEngine`].
//!
//! Wire messages are generated from `proto/cache.proto` at build time (see
//! `build.rs`); this module only ever touches the generated
//! `proto::cache_server::Cache` trait and the plain Rust structs it
//! produces, never hand-rolled framing.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::auth::AuthConfig;
use crate::cache_engine::CacheEngine;
use crate::cluster::Cluster;
use crate::path_key;

pub mod proto {
    tonic::include_proto!("cache.v1");
}

use proto::cache_server::Cache;
use proto::{
    Artifact, ArtifactRef, DeleteRequest, DeleteResponse, ListNodesRequest, ListNodesResponse, Node,
    ReplicateRequest, ReplicateResponse, RetrieveRequest, RetrieveResponse, StoreRequest, StoreResponse,
};

pub struct RpcService {
    engine: Arc<CacheEngine>,
    auth: AuthConfig,
    cluster: Option<Arc<Cluster>>,
}

impl RpcService {
    pub fn new(engine: Arc<CacheEngine>, auth: AuthConfig, cluster: Option<Arc<Cluster>>) -> Self {
        Self { engine, auth, cluster }
    }

    fn peer_cert<T>(request: &Request<T>) -> Option<Vec<u8>> {
        request
            .peer_certs()
            .and_then(|certs| certs.first().map(|c| c.as_ref().to_vec()))
    }

    fn require_read<T>(&self, request: &Request<T>) -> Result<(), Status> {
        self.auth.check_read(Self::peer_cert(request).as_deref()).map_err(|e| auth_status(e, "read"))
    }

    fn require_write<T>(&self, request: &Request<T>) -> Result<(), Status> {
        self.auth.check_write(Self::peer_cert(request).as_deref()).map_err(|e| auth_status(e, "write"))
    }

    async fn replicate_store_to_peer(&self, req: StoreRequest) {
        let Some(cluster) = &self.cluster else { return };
        let peers = cluster.pick_replicas(&req.hash_key()).await;
        let replicate = req.into_replicate(false);
        for peer in peers {
            info!(peer = %peer.name, "replicating store");
            // Fire-and-forget: failures are logged, never surfaced to the
            // original caller, per the specification's replication contract.
            if let Err(e) = send_replicate(&peer.address, replicate.clone()).await {
                warn!(peer = %peer.name, error = %e, "replicate store failed");
            }
        }
    }

    async fn replicate_delete_to_peer(&self, req: DeleteRequest) {
        let Some(cluster) = &self.cluster else { return };
        let key = format!("{}_{}", req.os, req.arch);
        let peers = cluster.pick_replicas(&key).await;
        let replicate = delete_to_replicate(req);
        for peer in peers {
            if let Err(e) = send_replicate(&peer.address, replicate.clone()).await {
                warn!(peer = %peer.name, error = %e, "replicate delete failed");
            }
        }
    }
}

trait StoreRequestExt {
    fn hash_key(&self) -> String;
    fn into_replicate(self, delete: bool) -> ReplicateRequest;
}

impl StoreRequestExt for StoreRequest {
    fn hash_key(&self) -> String {
        format!("{}_{}/{}", self.os, self.arch, hex_preview(&self.hash))
    }

    fn into_replicate(self, delete: bool) -> ReplicateRequest {
        ReplicateRequest {
            delete,
            os: self.os,
            arch: self.arch,
            hash: self.hash,
            artifacts: self.artifacts,
            everything: false,
        }
    }
}

fn delete_to_replicate(req: DeleteRequest) -> ReplicateRequest {
    ReplicateRequest {
        delete: true,
        os: req.os,
        arch: req.arch,
        hash: Vec::new(),
        everything: req.everything,
        artifacts: req
            .artifacts
            .into_iter()
            .map(|a| Artifact { package: a.package, target: a.target, file: a.file, body: Vec::new() })
            .collect(),
    }
}

/// Maps an [`crate::error::AuthError`] to the `tonic::Status` code the
/// specification's error-kind list distinguishes them by: no certificate
/// presented is `Unauthenticated`; a certificate presented but not in the
/// configured whitelist is `PermissionDenied`.
fn auth_status(err: crate::error::AuthError, role: &str) -> Status {
    match err {
        crate::error::AuthError::Unauthenticated => {
            Status::unauthenticated(format!("no client certificate presented for {role} access"))
        }
        crate::error::AuthError::PermissionDenied => {
            Status::permission_denied(format!("client certificate not authorized for {role} access"))
        }
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn send_replicate(peer_address: &str, request: ReplicateRequest) -> Result<(), tonic::transport::Error> {
    let mut client = proto::cache_client::CacheClient::connect(format!("http://{peer_address}")).await?;
    let _ = client.replicate(request).await;
    Ok(())
}

#[tonic::async_trait]
impl Cache for RpcService {
    async fn store(&self, request: Request<StoreRequest>) -> Result<Response<StoreResponse>, Status> {
        self.require_write(&request)?;
        let req = request.into_inner();

        for artifact in &req.artifacts {
            let path = path_key::build(&req.os, &req.arch, &artifact.package, &artifact.target, &req.hash, &artifact.file);
            if let Err(e) = self.engine.store(&path, &artifact.body).await {
                warn!(%path, error = %e, "rpc store failed");
                return Ok(Response::new(StoreResponse { success: false }));
            }
        }

        self.replicate_store_to_peer(req).await;
        Ok(Response::new(StoreResponse { success: true }))
    }

    async fn retrieve(&self, request: Request<RetrieveRequest>) -> Result<Response<RetrieveResponse>, Status> {
        self.require_read(&request)?;
        let req = request.into_inner();

        let mut out = Vec::new();
        for artifact_ref in &req.artifacts {
            let root = path_key::hash_root(&req.os, &req.arch, &artifact_ref.package, &artifact_ref.target, &req.hash);
            let path = path_key::build(
                &req.os,
                &req.arch,
                &artifact_ref.package,
                &artifact_ref.target,
                &req.hash,
                &artifact_ref.file,
            );

            match self.engine.retrieve(&path).await {
                Ok(files) => {
                    for (file_path, body) in files {
                        let file = file_path.strip_prefix(&root).unwrap_or(&file_path).trim_start_matches('/').to_string();
                        out.push(Artifact {
                            package: artifact_ref.package.clone(),
                            target: artifact_ref.target.clone(),
                            file,
                            body,
                        });
                    }
                }
                Err(e) => {
                    warn!(%path, error = %e, "rpc retrieve failed");
                    return Ok(Response::new(RetrieveResponse { success: false, artifacts: Vec::new() }));
                }
            }
        }

        Ok(Response::new(RetrieveResponse { success: true, artifacts: out }))
    }

    async fn delete(&self, request: Request<DeleteRequest>) -> Result<Response<DeleteResponse>, Status> {
        self.require_write(&request)?;
        let req = request.into_inner();

        let success = if req.everything {
            self.engine.delete_all().await.is_ok()
        } else {
            let mut all_ok = true;
            for artifact_ref in &req.artifacts {
                let prefix = path_key::delete_prefix_for(&req.os, &req.arch, &artifact_ref.package, &artifact_ref.target);
                if self.engine.delete_prefix(&prefix).await.is_err() {
                    all_ok = false;
                }
            }
            all_ok
        };

        if success {
            self.replicate_delete_to_peer(req).await;
        }

        Ok(Response::new(DeleteResponse { success }))
    }

    async fn list_nodes(&self, request: Request<ListNodesRequest>) -> Result<Response<ListNodesResponse>, Status> {
        self.require_read(&request)?;
        let nodes = match &self.cluster {
            Some(cluster) => cluster.members().await.into_iter().map(|n| Node { name: n.name, address: n.address }).collect(),
            None => Vec::new(),
        };
        Ok(Response::new(ListNodesResponse { nodes }))
    }

    async fn replicate(&self, request: Request<ReplicateRequest>) -> Result<Response<ReplicateResponse>, Status> {
        // Server-to-server only: no further fan-out, per the
        // specification's replication note. Peers still authenticate via
        // the same mTLS write-role handshake as any other writer.
        self.require_write(&request)?;
        let req = request.into_inner();

        let success = if req.delete && req.everything {
            self.engine.delete_all().await.is_ok()
        } else if req.delete {
            let mut all_ok = true;
            for artifact_ref in &req.artifacts {
                let prefix = path_key::delete_prefix_for(&req.os, &req.arch, &artifact_ref.package, &artifact_ref.target);
                if self.engine.delete_prefix(&prefix).await.is_err() {
                    all_ok = false;
                }
            }
            all_ok
        } else {
            let mut all_ok = true;
            for artifact in &req.artifacts {
                let path = path_key::build(&req.os, &req.arch, &artifact.package, &artifact.target, &req.hash, &artifact.file);
                if self.engine.store(&path, &artifact.body).await.is_err() {
                    all_ok = false;
                }
            }
            all_ok
        };

        Ok(Response::new(ReplicateResponse { success }))
    }
}

#[cfg(test)]
mod delete_to_replicate_tests {
    use super::*;

    #[test]
    fn preserves_the_everything_flag() {
        let req = DeleteRequest { everything: true, os: "linux".into(), arch: "amd64".into(), artifacts: Vec::new() };
        let replicate = delete_to_replicate(req);
        assert!(replicate.everything);
        assert!(replicate.delete);
    }

    #[test]
    fn prefix_delete_leaves_everything_unset() {
        let req = DeleteRequest {
            everything: false,
            os: "linux".into(),
            arch: "amd64".into(),
            artifacts: vec![ArtifactRef { package: "pkg".into(), target: "lbl".into(), file: String::new() }],
        };
        let replicate = delete_to_replicate(req);
        assert!(!replicate.everything);
        assert_eq!(replicate.artifacts.len(), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn service() -> (RpcService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = CacheEngine::new(dir.path(), Duration::from_secs(3600), Duration::from_secs(3600), 0, u64::MAX)
            .await
            .unwrap();
        (RpcService::new(engine, AuthConfig::default(), None), dir)
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trips() {
        let (service, _dir) = service().await;

        let store_req = Request::new(StoreRequest {
            os: "darwin".into(),
            arch: "amd64".into(),
            hash: b"hash".to_vec(),
            artifacts: vec![Artifact {
                package: "pkg".into(),
                target: "lbl".into(),
                file: "lbl.ext".into(),
                body: b"hello".to_vec(),
            }],
        });
        let store_resp = service.store(store_req).await.unwrap().into_inner();
        assert!(store_resp.success);

        let retrieve_req = Request::new(RetrieveRequest {
            os: "darwin".into(),
            arch: "amd64".into(),
            hash: b"hash".to_vec(),
            artifacts: vec![ArtifactRef { package: "pkg".into(), target: "lbl".into(), file: "lbl.ext".into() }],
        });
        let retrieve_resp = service.retrieve(retrieve_req).await.unwrap().into_inner();
        assert!(retrieve_resp.success);
        assert_eq!(retrieve_resp.artifacts.len(), 1);
        assert_eq!(retrieve_resp.artifacts[0].body, b"hello");
    }

    #[tokio::test]
    async fn delete_everything_empties_engine() {
        let (service, _dir) = service().await;

        let store_req = Request::new(StoreRequest {
            os: "linux".into(),
            arch: "amd64".into(),
            hash: b"hash".to_vec(),
            artifacts: vec![Artifact { package: "pkg".into(), target: "lbl".into(), file: "f".into(), body: b"x".to_vec() }],
        });
        service.store(store_req).await.unwrap();

        let delete_req = Request::new(DeleteRequest { everything: true, os: String::new(), arch: String::new(), artifacts: Vec::new() });
        let delete_resp = service.delete(delete_req).await.unwrap().into_inner();
        assert!(delete_resp.success);
        assert_eq!(service.engine.count(), 0);
    }

    #[tokio::test]
    async fn replicate_everything_empties_engine() {
        let (service, _dir) = service().await;

        service
            .store(Request::new(StoreRequest {
                os: "linux".into(),
                arch: "amd64".into(),
                hash: b"hash".to_vec(),
                artifacts: vec![Artifact { package: "pkg".into(), target: "lbl".into(), file: "f".into(), body: b"x".to_vec() }],
            }))
            .await
            .unwrap();

        let req = Request::new(ReplicateRequest {
            delete: true,
            everything: true,
            os: String::new(),
            arch: String::new(),
            hash: Vec::new(),
            artifacts: Vec::new(),
        });
        let resp = service.replicate(req).await.unwrap().into_inner();
        assert!(resp.success);
        assert_eq!(service.engine.count(), 0);
    }

    #[tokio::test]
    async fn list_nodes_empty_without_cluster() {
        let (service, _dir) = service().await;
        let resp = service.list_nodes(Request::new(ListNodesRequest {})).await.unwrap().into_inner();
        assert!(resp.nodes.is_empty());
    }

    #[tokio::test]
    async fn write_denied_with_nonmatching_certificate_set() {
        let dir = tempfile::tempdir().unwrap();
        let engine = CacheEngine::new(dir.path(), Duration::from_secs(3600), Duration::from_secs(3600), 0, u64::MAX)
            .await
            .unwrap();

        let writable = crate::auth::CertSet::from_certs([b"only-this-cert".to_vec()]);
        let auth = AuthConfig::new(crate::auth::CertSet::empty(), writable);
        let service = RpcService::new(engine, auth, None);

        // no TLS in this in-process test, so peer_certs() is None; a
        // nonempty writable set must reject an absent certificate.
        let req = Request::new(StoreRequest { os: "a".into(), arch: "b".into(), hash: Vec::new(), artifacts: Vec::new() });
        let result = service.store(req).await;
        assert!(result.is_err());
    }
}
