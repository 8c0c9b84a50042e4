//! Wires every long-lived task together into one running node (spec §5).
//!
//! The teacher's `Node<StateMachine>` (`pkg/raft/src/node.rs`, referenced
//! from `main.rs` as `Node::start(NodeConfig { .. })`) plays the same role:
//! owns the consensus module, starts the background cycle task, and hands
//! back a handle the HTTP layer can clone into request state. This version
//! has more tasks to start (discovery has four sources, there are six
//! reconcilers) but the shape — one `start`, a bag of `JoinHandle`s, a
//! shared stop signal — is the same.

use crate::applier::OperationApplier;
use crate::config::NodeConfig;
use crate::consensus::Engine;
use crate::discovery::DiscoveryManager;
use crate::domain::{pool_from_dsn, DomainStore, SqliteDomainStore};
use crate::errors::*;
use crate::http::{self, AppState};
use crate::peers::PeerStore;
use crate::reconcile::Reconciler;
use crate::store::SqliteStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Node {
    pub engine: Arc<Engine>,
    pub peers: Arc<PeerStore>,
    pub domain: Arc<dyn DomainStore>,
    pub config: NodeConfig,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Builds storage, the consensus engine, discovery and reconcilers, and
    /// spawns every background task (spec §5 tasks #1 and #3-#7; the HTTP
    /// servers are started separately by `serve`, task #7, since `axum`
    /// wants to own the listener on the caller's task).
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let pool = pool_from_dsn(&config.storage_dsn)?;
        let store = SqliteStore::from_pool(pool.clone())?;
        let domain: Arc<dyn DomainStore> = SqliteDomainStore::new(pool)?;

        let peers = PeerStore::new(config.node_id.clone(), store.clone());
        let applier = OperationApplier::new(domain.clone());
        let engine = Engine::new(config.clone(), store, peers.clone(), applier)?;

        let discovery = DiscoveryManager::new(config.clone(), peers.clone());
        discovery.self_register()?;

        let reconciler = Reconciler::new(config.clone(), domain.clone(), peers.clone(), engine.clone());

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(engine.clone().run(stop_rx.clone())));
        tasks.push(tokio::spawn(engine.clone().run_apply_loop(stop_rx.clone())));

        tasks.push(tokio::spawn(discovery.clone().run_peer_refresh_loop(stop_rx.clone())));
        tasks.push(tokio::spawn(discovery.clone().run_dns_loop(stop_rx.clone())));
        tasks.push(tokio::spawn(discovery.clone().run_orchestrator_loop(stop_rx.clone())));
        tasks.push(tokio::spawn(discovery.clone().run_seed_gossip_loop(stop_rx.clone())));
        tasks.push(tokio::spawn(discovery.clone().run_health_poll_loop(stop_rx.clone())));

        tasks.extend(reconciler.spawn_all(stop_rx.clone()));

        info!(node_id = %config.node_id, http_addr = %config.http_addr, "node started");

        Ok(Arc::new(Node { engine, peers, domain, config, stop_tx, tasks }))
    }

    /// Binds and serves the `/raft/*` + `/cluster/*` control-plane router
    /// until the process receives a shutdown signal. Blocks the caller.
    pub async fn serve(self: &Arc<Self>, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
        let state = AppState {
            engine: self.engine.clone(),
            peers: self.peers.clone(),
            domain: self.domain.clone(),
            secret: self.config.cluster_hmac_secret.clone(),
            http_client: reqwest::Client::new(),
        };
        let app = http::router(state);

        let listener = tokio::net::TcpListener::bind(&self.config.http_addr)
            .await
            .map_err(|e| Error::from(format!("binding {}: {}", self.config.http_addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::from(format!("http server: {}", e)))
    }

    /// Signals every background task to stop. Does not wait for them; call
    /// `shutdown` for that.
    pub fn stop(&self) {
        self.engine.stop();
        let _ = self.stop_tx.send(true);
    }

    pub async fn shutdown(mut self: Arc<Self>) {
        self.stop();
        let tasks = match Arc::get_mut(&mut self) {
            Some(node) => std::mem::take(&mut node.tasks),
            None => return,
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> NodeConfig {
        NodeConfig {
            node_id: id.to_string(),
            advertise_addr: "127.0.0.1:0".into(),
            http_addr: "127.0.0.1:0".into(),
            cluster_hmac_secret: "s3cr3t".into(),
            storage_dsn: ":memory:".into(),
            discovery_seeds: vec![],
            discovery_dns_name: None,
            discovery_dns_port: 0,
            discovery_orchestrator_service: None,
            discovery_orchestrator_port: 0,
            tls_cert_path: None,
            tls_key_path: None,
            log_level: "info".into(),
            log_format: crate::config::LogFormat::Pretty,
            allow_degraded_elections: true,
        }
    }

    #[tokio::test]
    async fn start_boots_a_single_node_and_self_registers() {
        let node = Node::start(config("n1")).await.unwrap();
        assert!(node.peers.listing().unwrap().is_empty());
        node.stop();
    }
}
