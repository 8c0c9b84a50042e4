//! Core identifiers and the wire/log record shapes described in spec §3.
//!
//! Naming follows `pkg/raft/src/protos.rs` (`ServerId`, `Term`, `LogIndex`,
//! `LogEntry`) but `ServerId` becomes a stable string (`NODE_ID` is
//! operator-assigned, not minted by the cluster) and `LogEntryData` becomes
//! an `(op, payload)` pair keyed by the string operation catalog in spec
//! §4.2.1 instead of a closed Rust enum, since the catalog is part of the
//! wire contract and new ops must not require every peer to recompile in
//! lockstep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;

/// A single replicated record (spec §3 `LogEntry`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    /// Globally unique, proposer-minted. Used for at-most-once apply (I5).
    pub event_id: String,
    pub aggregate: String,
    pub aggregate_id: String,
    /// One of the operation catalog strings in spec §4.2.1.
    pub op: String,
    /// JSON-encoded payload; schema is determined by `op`.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Persistent Raft metadata (spec §3 `RaftState`). Every field must be
/// durable before any action that depends on it is observable (spec §5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

/// `(term, index)` pair used to identify a proposed entry, analogous to
/// `LogPosition` in the teacher crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub term: Term,
    pub index: LogIndex,
}

/// Source that most recently upserted a `ClusterNode` row (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeSource {
    Local,
    Dns,
    DockerDns,
    Gossip,
    Seed,
    Reconciler,
}

impl NodeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeSource::Local => "local",
            NodeSource::Dns => "dns",
            NodeSource::DockerDns => "docker-dns",
            NodeSource::Gossip => "gossip",
            NodeSource::Seed => "seed",
            NodeSource::Reconciler => "reconciler",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "local" => NodeSource::Local,
            "dns" => NodeSource::Dns,
            "docker-dns" => NodeSource::DockerDns,
            "gossip" => NodeSource::Gossip,
            "seed" => NodeSource::Seed,
            "reconciler" => NodeSource::Reconciler,
            _ => return None,
        })
    }
}

/// A row of the `ClusterNode` table (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: NodeId,
    pub address: String,
    pub source: NodeSource,
    pub last_seen: DateTime<Utc>,
}

/// The three roles a node can be in (spec §4.1.1). Role-specific volatile
/// data lives alongside the variant, mirroring `ServerState` in
/// `consensus.rs`.
#[derive(Debug)]
pub enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

#[derive(Debug)]
pub struct FollowerState {
    pub last_leader_id: Option<NodeId>,
}

#[derive(Debug, Default)]
pub struct CandidateState {
    pub votes_received: std::collections::HashSet<NodeId>,
    pub pre_vote: bool,
}

#[derive(Debug, Default)]
pub struct LeaderState {
    pub progress: std::collections::HashMap<NodeId, PeerProgress>,
    pub consecutive_broadcast_failures: u32,
}

/// Per-peer replication state, leader-only and volatile (spec §3).
#[derive(Debug, Clone)]
pub struct PeerProgress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub request_pending: bool,
}

impl PeerProgress {
    pub fn new(last_index: LogIndex) -> Self {
        PeerProgress {
            next_index: last_index + 1,
            match_index: 0,
            request_pending: false,
        }
    }
}
