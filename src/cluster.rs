//! Minimal gossip-based membership layer plus single-peer replication.
//!
//! Membership itself is deliberately simple: each node periodically
//! broadcasts a heartbeat UDP datagram containing its own `{name, address}`
//! to every seed it knows, and every node that has ever been heard from is
//! considered a member until it has been silent for several heartbeat
//! intervals. This is the gossip layer's entire contract with the rest of
//! the crate — it is opaque to [`crate::cache_engine::CacheEngine`], which
//! never observes it directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const MEMBER_TIMEOUT: Duration = Duration::from_secs(30);

/// One cluster member as observed by the gossip layer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Node {
    pub name: String,
    pub address: String,
}

struct Member {
    address: String,
    last_seen: SystemTime,
}

/// Gossip membership handle. Cheap to clone; all clones share the same
/// member table.
#[derive(Clone)]
pub struct Cluster {
    local_name: String,
    local_address: String,
    members: Arc<Mutex<HashMap<String, Member>>>,
    socket: Arc<UdpSocket>,
    seeds: Vec<SocketAddr>,
    replication_factor: usize,
}

impl Cluster {
    /// Binds the local gossip port and spawns the heartbeat and listener
    /// tasks. `seeds` are the addresses of already-known peers to start
    /// gossiping with; an empty seed list is valid for a single-node
    /// cluster that others can later join by pointing a seed at it.
    pub async fn join(
        node_name: String,
        cluster_port: u16,
        seeds: &[String],
    ) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", cluster_port)).await?;
        let local_address = socket.local_addr()?.to_string();

        let resolved_seeds: Vec<SocketAddr> = seeds
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(seed = %s, error = %e, "ignoring unparseable cluster seed");
                    None
                }
            })
            .collect();

        let cluster = Arc::new(Self {
            local_name: node_name,
            local_address,
            members: Arc::new(Mutex::new(HashMap::new())),
            socket: Arc::new(socket),
            seeds: resolved_seeds,
            replication_factor: 2,
        });

        cluster.clone().spawn_heartbeat_loop();
        cluster.clone().spawn_listener();

        Ok(cluster)
    }

    pub fn is_clustered(&self) -> bool {
        !self.seeds.is_empty()
    }

    /// Current membership, excluding entries that have gone silent for
    /// longer than [`MEMBER_TIMEOUT`].
    pub async fn members(&self) -> Vec<Node> {
        let now = SystemTime::now();
        let members = self.members.lock().await;
        members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_seen).unwrap_or(Duration::ZERO) < MEMBER_TIMEOUT)
            .map(|(name, m)| Node { name: name.clone(), address: m.address.clone() })
            .collect()
    }

    /// Picks the peers that should hold the remaining copies of an
    /// artifact under `self.replication_factor` (2 by default: the local
    /// copy plus one replica), hashing on `key` so that repeated calls for
    /// the same key land on the same peers. Returns fewer than
    /// `replication_factor - 1` peers (possibly none) if the cluster
    /// doesn't have that many other members.
    pub async fn pick_replicas(&self, key: &str) -> Vec<Node> {
        let mut peers = self.members().await;
        peers.retain(|n| n.name != self.local_name);
        if peers.is_empty() {
            return Vec::new();
        }
        peers.sort_by(|a, b| a.name.cmp(&b.name));

        let wanted = self.replication_factor.saturating_sub(1).min(peers.len());
        let start = (fnv1a(key) as usize) % peers.len();
        (0..wanted).map(|offset| peers[(start + offset) % peers.len()].clone()).collect()
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                let payload = format!("{}|{}", self.local_name, self.local_address);
                for seed in &self.seeds {
                    if let Err(e) = self.socket.send_to(payload.as_bytes(), seed).await {
                        debug!(%seed, error = %e, "heartbeat send failed");
                    }
                }
            }
        });
    }

    fn spawn_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let (len, _from) = match self.socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "gossip listener recv failed");
                        continue;
                    }
                };
                let Ok(text) = std::str::from_utf8(&buf[..len]) else { continue };
                let Some((name, address)) = text.split_once('|') else { continue };
                let mut members = self.members.lock().await;
                members.insert(
                    name.to_string(),
                    Member { address: address.to_string(), last_seen: SystemTime::now() },
                );
            }
        });
    }
}

fn fnv1a(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
