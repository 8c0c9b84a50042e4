//! Cluster RPC wire types, HMAC signing and the outbound client (spec
//! §4.5). Generalizes the teacher's `rpc::Client`
//! (`pkg/raft/src/main.rs` imports `raft::rpc::{Client, marshal,
//! unmarshal}`) from msgpack-over-hyper to JSON-over-`reqwest`, and adds
//! the HMAC envelope the teacher crate never needed (it assumed a trusted
//! network).

use crate::errors::*;
use crate::types::{LogEntry, LogIndex, NodeId, Term};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

pub const SIGNATURE_HEADER: &str = "X-Cluster-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA-256 over the exact request body, keyed by the shared
/// cluster secret (spec §4.5).
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time-by-construction verification (comparing two hex digests
/// character-by-character would leak timing, so we compare the raw MACs).
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(given) = hex::decode(signature_hex) else { return false };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&given).is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// Pre-vote requests never mutate the responder's persistent state
    /// (spec §4.1.2 step 1).
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub leader: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub address: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub nodes: Vec<GossipNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipNode {
    pub node_id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub node_id: NodeId,
}

/// One row returned by `GET /cluster/local-events/{family}` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

/// A thin `reqwest`-based client for signed cluster RPC, mirroring the
/// teacher's `rpc::Client` role but over HTTP+JSON.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    secret: String,
}

impl RpcClient {
    pub fn new(secret: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client build");
        RpcClient { http, secret }
    }

    /// POSTs a signed JSON body and decodes a JSON response. A non-2xx or
    /// transport failure is always a transient error per spec §7 — callers
    /// are expected to retry within bounded loops, never treat this as
    /// fatal.
    pub async fn post_signed<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &Req,
    ) -> Result<Resp> {
        let bytes = serde_json::to_vec(body)?;
        let signature = sign(&self.secret, &bytes);
        let resp = self
            .http
            .post(url)
            .header(SIGNATURE_HEADER, signature)
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::from(format!("cluster rpc {} returned {}", url, resp.status())));
        }
        Ok(resp.json::<Resp>().await?)
    }

    pub async fn get_unsigned<Resp: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<Resp> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::from(format!("cluster rpc {} returned {}", url, resp.status())));
        }
        Ok(resp.json::<Resp>().await?)
    }

    /// Signs an empty body so GET endpoints other than `/raft/health` (spec
    /// §6: local-events and local-audit queries are signed like every other
    /// inter-node RPC) can still be authenticated.
    pub async fn get_signed<Resp: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<Resp> {
        let signature = sign(&self.secret, b"");
        let resp = self.http.get(url).header(SIGNATURE_HEADER, signature).send().await?;
        if !resp.status().is_success() {
            return Err(Error::from(format!("cluster rpc {} returned {}", url, resp.status())));
        }
        Ok(resp.json::<Resp>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let body = br#"{"term":1}"#;
        let sig = sign("s3cr3t", body);
        assert!(verify("s3cr3t", body, &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret_or_tampered_body() {
        let body = br#"{"term":1}"#;
        let sig = sign("s3cr3t", body);
        assert!(!verify("wrong", body, &sig));
        assert!(!verify("s3cr3t", br#"{"term":2}"#, &sig));
    }

    #[test]
    fn verify_rejects_malformed_signature() {
        assert!(!verify("s3cr3t", b"body", "not-hex!!"));
    }
}
