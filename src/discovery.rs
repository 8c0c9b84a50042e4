//! Peer discovery (spec §4.4): populates `ClusterNode` rows from whichever
//! sources are configured. All sources are additive and funnel through
//! `PeerStore::upsert`, which enforces the gossip-does-not-refresh rule.

use crate::config::{timing, NodeConfig};
use crate::peers::PeerStore;
use crate::rpc::{HealthResponse, JoinRequest, JoinResponse, RpcClient};
use crate::types::NodeSource;
use std::sync::Arc;
use tokio::sync::watch;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

pub struct DiscoveryManager {
    config: NodeConfig,
    peers: Arc<PeerStore>,
    rpc: RpcClient,
}

impl DiscoveryManager {
    pub fn new(config: NodeConfig, peers: Arc<PeerStore>) -> Arc<Self> {
        let rpc = RpcClient::new(config.cluster_hmac_secret.clone(), timing::DISCOVERY_RPC_TIMEOUT);
        Arc::new(DiscoveryManager { config, peers, rpc })
    }

    /// Self-registration on boot (spec §4.4 source 1).
    pub fn self_register(&self) -> crate::errors::Result<()> {
        self.peers.upsert(&self.config.node_id, &self.config.advertise_addr, NodeSource::Local, true)
    }

    /// Periodically rewrites the consensus-facing snapshot from the
    /// ClusterNode table (spec §4.3).
    pub async fn run_peer_refresh_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.peers.refresh() {
                warn!(error = %e, "peer store refresh failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(timing::PEER_STORE_REFRESH_INTERVAL) => {}
                _ = stop.changed() => { if *stop.borrow() { break; } }
            }
        }
    }

    /// DNS A-record resolution (spec §4.4 source 2).
    pub async fn run_dns_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let Some(name) = self.config.discovery_dns_name.clone() else { return };
        let port = self.config.discovery_dns_port;
        loop {
            if let Err(e) = self.resolve_and_upsert(&name, port, NodeSource::Dns).await {
                debug!(error = %e, name = %name, "dns discovery lookup failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(timing::DNS_DISCOVERY_INTERVAL) => {}
                _ = stop.changed() => { if *stop.borrow() { break; } }
            }
        }
    }

    /// Orchestrator-DNS resolution of `tasks.<service>` (spec §4.4 source 3).
    pub async fn run_orchestrator_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let Some(service) = self.config.discovery_orchestrator_service.clone() else { return };
        let name = format!("tasks.{}", service);
        let port = self.config.discovery_orchestrator_port;
        loop {
            if let Err(e) = self.resolve_and_upsert(&name, port, NodeSource::DockerDns).await {
                debug!(error = %e, name = %name, "orchestrator dns discovery lookup failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(timing::ORCHESTRATOR_DNS_INTERVAL) => {}
                _ = stop.changed() => { if *stop.borrow() { break; } }
            }
        }
    }

    async fn resolve_and_upsert(&self, name: &str, port: u16, source: NodeSource) -> crate::errors::Result<()> {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let response = resolver
            .lookup_ip(name)
            .await
            .map_err(|e| crate::errors::Error::from(format!("dns lookup {}: {}", name, e)))?;
        for ip in response.iter() {
            let address = format!("{}:{}", ip, port);
            // The node id isn't known until we contact it; use the address as
            // a placeholder id so a later direct health poll can replace it.
            let node_id = format!("dns:{}", address);
            self.peers.upsert(&node_id, &address, source, false)?;
        }
        Ok(())
    }

    /// Static seed list gossip join loop (spec §4.4 source 4).
    pub async fn run_seed_gossip_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        if self.config.discovery_seeds.is_empty() {
            return;
        }
        loop {
            for seed in self.config.discovery_seeds.clone() {
                if let Err(e) = self.gossip_with_seed(&seed).await {
                    debug!(error = %e, seed = %seed, "seed gossip failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(timing::SEED_GOSSIP_INTERVAL) => {}
                _ = stop.changed() => { if *stop.borrow() { break; } }
            }
        }
    }

    async fn gossip_with_seed(&self, seed: &str) -> crate::errors::Result<()> {
        let url = format!("http://{}/cluster/join", seed);
        let req = JoinRequest {
            node_id: self.config.node_id.clone(),
            address: self.config.advertise_addr.clone(),
            source: "gossip".into(),
        };
        let resp: JoinResponse = self.rpc.post_signed(&url, &req).await?;
        // Direct contact with the seed itself refreshes its last_seen.
        self.peers.upsert(seed, seed, NodeSource::Seed, true)?;
        for node in resp.nodes {
            if node.node_id == self.config.node_id {
                continue;
            }
            // Third-party nodes learned via gossip must not refresh last_seen.
            self.peers.upsert(&node.node_id, &node.address, NodeSource::Gossip, false)?;
        }
        Ok(())
    }

    /// Opportunistic polling of peers' `/raft/health` for leader hints (spec
    /// §5 task #5). A successful poll is direct contact and refreshes
    /// `last_seen`.
    pub async fn run_health_poll_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            for peer_id in self.peers.active_peers() {
                if let Some(address) = self.peers.address_of(&peer_id) {
                    let url = format!("http://{}/raft/health", address);
                    if let Ok(resp) = self.rpc.get_unsigned::<HealthResponse>(&url).await {
                        let _ = self.peers.touch(&peer_id);
                        if resp.is_leader {
                            self.peers.set_current_leader(Some(resp.node_id));
                        }
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(timing::HEALTH_POLL_TIMEOUT * 5) => {}
                _ = stop.changed() => { if *stop.borrow() { break; } }
            }
        }
    }
}
