//! Process configuration, read from the environment per spec §6.
//!
//! Mirrors the "explicit process-config record threaded through
//! constructors, not hidden globals" guidance of spec §9: the HMAC secret,
//! node id and advertise address all live here rather than as statics.

use crate::errors::*;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub advertise_addr: String,
    pub http_addr: String,
    pub cluster_hmac_secret: String,
    pub storage_dsn: String,

    pub discovery_seeds: Vec<String>,
    pub discovery_dns_name: Option<String>,
    pub discovery_dns_port: u16,
    pub discovery_orchestrator_service: Option<String>,
    pub discovery_orchestrator_port: u16,

    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    pub log_level: String,
    pub log_format: LogFormat,

    /// Allow a 2-3 node reachable set to self-elect without contacting a
    /// majority (spec §4.1.2 degraded-mode escape valve). Off by default:
    /// strict fixed-membership is the safer of the two documented
    /// tradeoffs (spec §9 open question).
    pub allow_degraded_elections: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn require_env(name: &str) -> Result<String> {
    env_var(name).ok_or_else(|| ErrorKind::MissingConfig(name.to_string()).into())
}

impl NodeConfig {
    /// Builds configuration from the environment. `CLUSTER_HMAC_SECRET` and
    /// `NODE_ID` are required; an unset secret is a fatal boot error (spec
    /// §6).
    pub fn from_env() -> Result<Self> {
        let node_id = require_env("NODE_ID")?;
        let cluster_hmac_secret = require_env("CLUSTER_HMAC_SECRET")?;
        let advertise_addr = env_var("ADVERTISE_ADDR").unwrap_or_else(|| "127.0.0.1:8000".into());
        let http_addr = env_var("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8000".into());
        let storage_dsn = env_var("STORAGE_DSN").unwrap_or_else(|| format!("{}.sqlite3", node_id));

        let discovery_seeds = env_var("DISCOVERY_SEEDS")
            .map(|s| s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect())
            .unwrap_or_default();

        let discovery_dns_port: u16 = env_var("DISCOVERY_DNS_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(8000);
        let discovery_orchestrator_port: u16 = env_var("DISCOVERY_ORCHESTRATOR_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(8000);

        let log_format = match env_var("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(NodeConfig {
            node_id,
            advertise_addr,
            http_addr,
            cluster_hmac_secret,
            storage_dsn,
            discovery_seeds,
            discovery_dns_name: env_var("DISCOVERY_DNS_NAME"),
            discovery_dns_port,
            discovery_orchestrator_service: env_var("DISCOVERY_ORCHESTRATOR_SERVICE"),
            discovery_orchestrator_port,
            tls_cert_path: env_var("TLS_CERT_PATH"),
            tls_key_path: env_var("TLS_KEY_PATH"),
            log_level: env_var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_format,
            allow_degraded_elections: env_var("RAFT_ALLOW_DEGRADED_ELECTIONS")
                .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

/// Timing constants. Intentionally longer than textbook Raft to absorb
/// noisy container environments (spec §4.1.1 / §9).
pub mod timing {
    use super::Duration;

    pub const ELECTION_TIMEOUT_BASE: Duration = Duration::from_millis(3000);
    pub const ELECTION_TIMEOUT_JITTER_MS: u64 = 2000;
    /// Backoff added per consecutive failed election, capped.
    pub const ELECTION_BACKOFF_STEP: Duration = Duration::from_millis(500);
    pub const ELECTION_BACKOFF_MAX: Duration = Duration::from_secs(5);

    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
    pub const REPLICATION_RPC_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DISCOVERY_RPC_TIMEOUT: Duration = Duration::from_secs(2);
    pub const HEALTH_POLL_TIMEOUT: Duration = Duration::from_millis(1200);
    pub const PROPOSE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

    pub const PEER_FRESHNESS_WINDOW: Duration = Duration::from_secs(30);
    pub const PEER_LISTING_WINDOW: Duration = Duration::from_secs(120);
    pub const PEER_STORE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

    pub const DNS_DISCOVERY_INTERVAL: Duration = Duration::from_secs(15);
    pub const ORCHESTRATOR_DNS_INTERVAL: Duration = Duration::from_secs(20);
    pub const SEED_GOSSIP_INTERVAL: Duration = Duration::from_secs(25);

    pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(20);

    pub const MAX_CONSECUTIVE_BROADCAST_FAILURES: u32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_secret_is_fatal() {
        std::env::remove_var("CLUSTER_HMAC_SECRET");
        std::env::set_var("NODE_ID", "n1");
        let err = NodeConfig::from_env().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MissingConfig(name) if name == "CLUSTER_HMAC_SECRET"));
    }

    #[test]
    fn seeds_are_split_and_trimmed() {
        std::env::set_var("NODE_ID", "n1");
        std::env::set_var("CLUSTER_HMAC_SECRET", "s3cr3t");
        std::env::set_var("DISCOVERY_SEEDS", "a:1, b:2 ,,c:3");
        let cfg = NodeConfig::from_env().unwrap();
        assert_eq!(cfg.discovery_seeds, vec!["a:1", "b:2", "c:3"]);
    }
}
