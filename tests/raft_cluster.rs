//! End-to-end cluster tests: real nodes, real loopback HTTP, real timers.
//!
//! Peers are wired directly through `PeerStore::upsert` rather than the
//! discovery loops so these tests don't depend on DNS or a seed list, but
//! everything downstream of that (elections, replication, the apply loop,
//! the HTTP control plane) runs exactly as it would on a real cluster.

use agenda_raft::config::{LogFormat, NodeConfig};
use agenda_raft::domain::{DomainStore, User};
use agenda_raft::node::Node;
use agenda_raft::reconcile::Reconciler;
use agenda_raft::types::NodeSource;
use std::sync::Arc;
use std::time::Duration;

const HMAC_SECRET: &str = "test-cluster-secret";

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn node_config(id: &str, port: u16) -> NodeConfig {
    NodeConfig {
        node_id: id.to_string(),
        advertise_addr: format!("127.0.0.1:{port}"),
        http_addr: format!("127.0.0.1:{port}"),
        cluster_hmac_secret: HMAC_SECRET.to_string(),
        storage_dsn: ":memory:".to_string(),
        discovery_seeds: vec![],
        discovery_dns_name: None,
        discovery_dns_port: 0,
        discovery_orchestrator_service: None,
        discovery_orchestrator_port: 0,
        tls_cert_path: None,
        tls_key_path: None,
        log_level: "error".to_string(),
        log_format: LogFormat::Pretty,
        allow_degraded_elections: false,
    }
}

struct Member {
    node: Arc<Node>,
    addr: String,
    serve_task: tokio::task::JoinHandle<()>,
}

impl Member {
    /// Aborts the HTTP listener and stops every background task, simulating
    /// a node disappearing from the cluster without a graceful goodbye.
    async fn crash(self) {
        self.node.stop();
        self.serve_task.abort();
        let _ = self.serve_task.await;
    }
}

async fn start_member(id: &str) -> Member {
    let port = free_port();
    let config = node_config(id, port);
    let addr = config.http_addr.clone();
    let node = Node::start(config).await.expect("node boots");

    let serving = node.clone();
    let serve_task = tokio::spawn(async move {
        // Never resolves on its own; `crash`/test teardown aborts the task.
        let shutdown = std::future::pending::<()>();
        let _ = serving.serve(shutdown).await;
    });

    Member { node, addr, serve_task }
}

/// Hand-wires a full mesh between `members`, bypassing discovery.
fn wire_mesh(members: &[Member]) {
    for (i, a) in members.iter().enumerate() {
        for (j, b) in members.iter().enumerate() {
            if i == j {
                continue;
            }
            a.node.peers.upsert(&b.node.config.node_id, &b.addr, NodeSource::Seed, true).unwrap();
        }
        a.node.peers.refresh().unwrap();
    }
}

/// Severs every link between the two index sets by having each side forget
/// the other through `PeerStore::forget`. Since RPCs are only attempted
/// against known active peers, this reproduces a network partition from the
/// engine's point of view without any real network-layer interception.
fn partition(members: &[Member], side_a: &[usize], side_b: &[usize]) {
    for &i in side_a {
        for &j in side_b {
            members[i].node.peers.forget(&members[j].node.config.node_id).unwrap();
            members[j].node.peers.forget(&members[i].node.config.node_id).unwrap();
        }
    }
}

async fn wait_for_leader(members: &[Member], timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for (i, m) in members.iter().enumerate() {
            if m.node.engine.is_leader() {
                return i;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no leader elected within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn three_node_cluster_replicates_a_write_to_every_follower() {
    let members = vec![start_member("n1").await, start_member("n2").await, start_member("n3").await];
    wire_mesh(&members);

    let leader_idx = wait_for_leader(&members, Duration::from_secs(20)).await;
    let leader = &members[leader_idx].node;

    leader
        .engine
        .propose_entry(
            "users",
            "u1",
            "user.create",
            serde_json::json!({
                "user_id": "u1", "username": "alice", "display_name": "Alice", "password_hash": "h"
            }),
        )
        .await
        .expect("leader commits the write");

    for m in &members {
        wait_until(
            || m.node.domain.find_user_by_username("alice").unwrap().is_some(),
            Duration::from_secs(10),
            "follower replicates the committed write",
        )
        .await;
    }

    for m in members {
        m.crash().await;
    }
}

/// spec.md §8 scenario 3: a 5-node cluster split 3/2 keeps committing on the
/// majority side while the minority side can neither elect nor commit.
#[tokio::test(flavor = "multi_thread")]
async fn five_node_minority_partition_cannot_elect_or_commit() {
    let members =
        vec![start_member("n1").await, start_member("n2").await, start_member("n3").await, start_member("n4").await, start_member("n5").await];
    wire_mesh(&members);

    let leader_idx = wait_for_leader(&members, Duration::from_secs(20)).await;

    // Keep the current leader in the 3-node majority side.
    let mut majority: Vec<usize> = vec![leader_idx];
    let mut minority: Vec<usize> = Vec::new();
    for i in 0..members.len() {
        if i == leader_idx {
            continue;
        }
        if majority.len() < 3 {
            majority.push(i);
        } else {
            minority.push(i);
        }
    }
    partition(&members, &majority, &minority);

    let leader = &members[leader_idx].node;
    leader
        .engine
        .propose_entry(
            "users",
            "u1",
            "user.create",
            serde_json::json!({
                "user_id": "u1", "username": "alice", "display_name": "Alice", "password_hash": "h"
            }),
        )
        .await
        .expect("the majority side keeps committing writes");

    for &i in &majority {
        wait_until(
            || members[i].node.domain.find_user_by_username("alice").unwrap().is_some(),
            Duration::from_secs(10),
            "every majority-side node replicates the committed write",
        )
        .await;
    }

    // Give the minority side ample time to try (and fail) to elect a leader
    // of its own; two nodes can never reach a 3-of-5 majority of votes.
    tokio::time::sleep(Duration::from_secs(5)).await;
    for &i in &minority {
        assert!(!members[i].node.engine.is_leader(), "a 2-node minority can never win an election");
    }

    let stranded = &members[minority[0]].node;
    let propose_result = tokio::time::timeout(
        Duration::from_secs(10),
        stranded.engine.propose_entry(
            "users",
            "u2",
            "user.create",
            serde_json::json!({
                "user_id": "u2", "username": "bob", "display_name": "Bob", "password_hash": "h"
            }),
        ),
    )
    .await;
    match propose_result {
        Ok(Ok(_)) => panic!("a minority-side node must never commit a write"),
        Ok(Err(_)) | Err(_) => {}
    }

    for m in members {
        m.crash().await;
    }
}

/// spec.md §8 scenario 5: a node that accepted a write outside of consensus
/// (simulating an isolated node serving local reads/writes during a
/// partition) gets reconciled onto every other node once a reconciler polls
/// its local-events feed and proposes a repair entry.
#[tokio::test(flavor = "multi_thread")]
async fn reconciler_converges_a_direct_local_write() {
    let members = vec![start_member("n1").await, start_member("n2").await, start_member("n3").await];
    wire_mesh(&members);

    let leader_idx = wait_for_leader(&members, Duration::from_secs(20)).await;

    // Write straight to a follower's domain store, bypassing `propose_entry`
    // entirely, as if it had accepted a local write while cut off from the
    // rest of the cluster.
    let isolated_idx = (leader_idx + 1) % members.len();
    let isolated = &members[isolated_idx].node;
    isolated
        .domain
        .create_user(&User {
            id: "u-bob".to_string(),
            username: "bob".to_string(),
            display_name: "Bob".to_string(),
            password_hash: "h".to_string(),
            email: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        })
        .expect("the isolated node accepts the local write");

    // Drive a reconciler pass directly instead of waiting out the
    // production 20s poll interval: same resolve/propose code path, just
    // triggered on demand for the test.
    let leader = &members[leader_idx].node;
    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let reconciler = Reconciler::new(leader.config.clone(), leader.domain.clone(), leader.peers.clone(), leader.engine.clone());
    let tasks = reconciler.spawn_all(stop_rx);

    for m in &members {
        wait_until(
            || m.node.domain.find_user_by_username("bob").unwrap().is_some(),
            Duration::from_secs(30),
            "the reconciler replays the isolated node's local write to every node",
        )
        .await;
    }

    for t in tasks {
        t.abort();
    }
    for m in members {
        m.crash().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_elects_a_new_leader_after_the_old_one_disappears() {
    let members = vec![start_member("n1").await, start_member("n2").await, start_member("n3").await];
    wire_mesh(&members);

    let first_leader_idx = wait_for_leader(&members, Duration::from_secs(20)).await;
    let first_term = members[first_leader_idx].node.engine.current_term();

    let mut members = members;
    let crashed = members.remove(first_leader_idx);
    crashed.crash().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(m) = members.iter().find(|m| m.node.engine.is_leader()) {
            assert!(m.node.engine.current_term() > first_term, "new leader must run in a later term");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no new leader elected after the old one crashed");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for m in members {
        m.crash().await;
    }
}
