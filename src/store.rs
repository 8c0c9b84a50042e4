//! Embedded transactional store: the Raft log, persistent metadata, the
//! applied-marker table and the cluster-node table (spec §3, §6).
//!
//! The teacher crate abstracts the log behind a `LogStorage` trait
//! (`consensus.rs` line 161, `Arc<LogStorage + Send + Sync>`); this crate
//! generalizes that to a `Store` trait covering every table the consensus
//! engine and discovery manager touch, backed by `rusqlite` through an
//! `r2d2` connection pool so HTTP handlers, the applier, reconcilers and
//! discovery can all reach it concurrently while SQLite's own transactions
//! provide isolation (spec §5's "expected to provide its own transactional
//! isolation").

use crate::errors::*;
use crate::types::{ClusterNode, LogEntry, LogIndex, NodeId, NodeSource, RaftState, Term};
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

pub type Pool = r2d2::Pool<SqliteConnectionManager>;

/// Everything the consensus engine, discovery manager and reconcilers need
/// from durable storage. Kept as a trait (rather than a bare struct) so
/// tests can substitute an in-memory implementation without standing up a
/// file on disk.
pub trait Store: Send + Sync {
    fn last_index(&self) -> Result<LogIndex>;
    fn first_index(&self) -> Result<LogIndex>;
    fn term_at(&self, index: LogIndex) -> Result<Option<Term>>;
    fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>>;
    fn entries_from(&self, start: LogIndex) -> Result<Vec<LogEntry>>;
    /// INSERT-OR-REPLACE keyed by `index` (spec §4.1.3 step 5).
    fn append(&self, entry: &LogEntry) -> Result<()>;
    /// Deletes every entry at or after `from_index` (spec §4.1.3 step 4).
    fn truncate_suffix(&self, from_index: LogIndex) -> Result<()>;

    fn load_raft_state(&self) -> Result<RaftState>;
    fn save_raft_state(&self, state: &RaftState) -> Result<()>;

    fn is_applied(&self, event_id: &str) -> Result<bool>;
    /// Atomically records that `event_id` applied at `index` and advances
    /// `last_applied`, matching spec I5/I6.
    fn mark_applied(&self, event_id: &str, index: LogIndex) -> Result<()>;

    fn upsert_cluster_node(&self, node: &ClusterNode) -> Result<()>;
    fn touch_last_seen(&self, node_id: &str, at: DateTime<Utc>) -> Result<()>;
    fn cluster_nodes(&self) -> Result<Vec<ClusterNode>>;
}

pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn open(dsn: &str) -> Result<Arc<Self>> {
        let manager = SqliteConnectionManager::file(dsn);
        let pool = r2d2::Pool::new(manager).map_err(|e| Error::from(format!("sqlite pool: {}", e)))?;
        let store = SqliteStore { pool };
        store.migrate()?;
        Ok(Arc::new(store))
    }

    pub fn open_in_memory() -> Result<Arc<Self>> {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::from(format!("sqlite pool: {}", e)))?;
        Self::from_pool(pool)
    }

    /// Builds a store over an already-constructed pool, so the Raft
    /// metadata tables and the domain tables (`domain::SqliteDomainStore`)
    /// can share one `r2d2::Pool`/one SQLite file instead of opening the
    /// DSN twice (spec §6: one storage DSN per node).
    pub fn from_pool(pool: Pool) -> Result<Arc<Self>> {
        let store = SqliteStore { pool };
        store.migrate()?;
        Ok(Arc::new(store))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS raft_log (
                idx INTEGER PRIMARY KEY,
                term INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                aggregate TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                op TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS raft_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS applied_marker (
                event_id TEXT PRIMARY KEY,
                applied_index INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS cluster_node (
                node_id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                source TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LogEntry> {
    let payload_text: String = row.get("payload")?;
    let ts_text: String = row.get("ts")?;
    Ok(LogEntry {
        index: row.get("idx")?,
        term: row.get("term")?,
        event_id: row.get("event_id")?,
        aggregate: row.get("aggregate")?,
        aggregate_id: row.get("aggregate_id")?,
        op: row.get("op")?,
        payload: serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null),
        timestamp: ts_text.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store for SqliteStore {
    fn last_index(&self) -> Result<LogIndex> {
        let conn = self.pool.get()?;
        let idx: Option<LogIndex> = conn
            .query_row("SELECT MAX(idx) FROM raft_log", [], |r| r.get(0))
            .optional()?
            .flatten();
        Ok(idx.unwrap_or(0))
    }

    fn first_index(&self) -> Result<LogIndex> {
        let conn = self.pool.get()?;
        let idx: Option<LogIndex> = conn
            .query_row("SELECT MIN(idx) FROM raft_log", [], |r| r.get(0))
            .optional()?
            .flatten();
        Ok(idx.unwrap_or(0))
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        let conn = self.pool.get()?;
        let term: Option<Term> = conn
            .query_row("SELECT term FROM raft_log WHERE idx = ?1", params![index], |r| r.get(0))
            .optional()?;
        Ok(term)
    }

    fn entry_at(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        let conn = self.pool.get()?;
        let entry = conn
            .query_row("SELECT * FROM raft_log WHERE idx = ?1", params![index], row_to_entry)
            .optional()?;
        Ok(entry)
    }

    fn entries_from(&self, start: LogIndex) -> Result<Vec<LogEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM raft_log WHERE idx >= ?1 ORDER BY idx ASC")?;
        let rows = stmt.query_map(params![start], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO raft_log (idx, term, event_id, aggregate, aggregate_id, op, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.index,
                entry.term,
                entry.event_id,
                entry.aggregate,
                entry.aggregate_id,
                entry.op,
                serde_json::to_string(&entry.payload)?,
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn truncate_suffix(&self, from_index: LogIndex) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM raft_log WHERE idx >= ?1", params![from_index])?;
        Ok(())
    }

    fn load_raft_state(&self) -> Result<RaftState> {
        let conn = self.pool.get()?;
        let mut get = |key: &str| -> Result<Option<String>> {
            Ok(conn
                .query_row("SELECT value FROM raft_meta WHERE key = ?1", params![key], |r| r.get(0))
                .optional()?)
        };
        Ok(RaftState {
            current_term: get("current_term")?.and_then(|v| v.parse().ok()).unwrap_or(0),
            voted_for: get("voted_for")?.filter(|v| !v.is_empty()),
            commit_index: get("commit_index")?.and_then(|v| v.parse().ok()).unwrap_or(0),
            last_applied: get("last_applied")?.and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }

    fn save_raft_state(&self, state: &RaftState) -> Result<()> {
        let conn = self.pool.get()?;
        let mut set = |key: &str, value: String| -> Result<()> {
            conn.execute(
                "INSERT INTO raft_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        };
        set("current_term", state.current_term.to_string())?;
        set("voted_for", state.voted_for.clone().unwrap_or_default())?;
        set("commit_index", state.commit_index.to_string())?;
        set("last_applied", state.last_applied.to_string())?;
        Ok(())
    }

    fn is_applied(&self, event_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM applied_marker WHERE event_id = ?1",
                params![event_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn mark_applied(&self, event_id: &str, index: LogIndex) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO applied_marker (event_id, applied_index) VALUES (?1, ?2)",
            params![event_id, index],
        )?;
        tx.execute(
            "INSERT INTO raft_meta (key, value) VALUES ('last_applied', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![index.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn upsert_cluster_node(&self, node: &ClusterNode) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO cluster_node (node_id, address, source, last_seen) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(node_id) DO UPDATE SET address = excluded.address, source = excluded.source, last_seen = excluded.last_seen",
            params![node.node_id, node.address, node.source.as_str(), node.last_seen.to_rfc3339()],
        )?;
        Ok(())
    }

    fn touch_last_seen(&self, node_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE cluster_node SET last_seen = ?2 WHERE node_id = ?1",
            params![node_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT node_id, address, source, last_seen FROM cluster_node")?;
        let rows = stmt.query_map([], |row| {
            let source: String = row.get("source")?;
            let last_seen: String = row.get("last_seen")?;
            Ok(ClusterNode {
                node_id: row.get("node_id")?,
                address: row.get("address")?,
                source: NodeSource::parse(&source).unwrap_or(NodeSource::Gossip),
                last_seen: last_seen.parse().unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeSource;

    fn sample_entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry {
            term,
            index,
            event_id: format!("evt-{}", index),
            aggregate: "user".into(),
            aggregate_id: "u1".into(),
            op: "user.create".into(),
            payload: serde_json::json!({"username": "alice"}),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn append_and_read_back_is_dense() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(&sample_entry(1, 1)).unwrap();
        store.append(&sample_entry(2, 1)).unwrap();
        assert_eq!(store.last_index().unwrap(), 2);
        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.term_at(2).unwrap(), Some(1));
        assert_eq!(store.term_at(0).unwrap(), Some(0));
    }

    #[test]
    fn append_is_insert_or_replace_by_index() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(&sample_entry(1, 1)).unwrap();
        let mut replaced = sample_entry(1, 2);
        replaced.event_id = "evt-replaced".into();
        store.append(&replaced).unwrap();
        let e = store.entry_at(1).unwrap().unwrap();
        assert_eq!(e.term, 2);
        assert_eq!(e.event_id, "evt-replaced");
    }

    #[test]
    fn truncate_suffix_removes_from_index_inclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 1..=5 {
            store.append(&sample_entry(i, 1)).unwrap();
        }
        store.truncate_suffix(3).unwrap();
        assert_eq!(store.last_index().unwrap(), 2);
        assert!(store.entry_at(3).unwrap().is_none());
    }

    #[test]
    fn applied_marker_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(!store.is_applied("evt-1").unwrap());
        store.mark_applied("evt-1", 1).unwrap();
        assert!(store.is_applied("evt-1").unwrap());
        let state = store.load_raft_state().unwrap();
        assert_eq!(state.last_applied, 1);
    }

    #[test]
    fn raft_state_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let state = RaftState {
            current_term: 4,
            voted_for: Some("n2".into()),
            commit_index: 9,
            last_applied: 8,
        };
        store.save_raft_state(&state).unwrap();
        let loaded = store.load_raft_state().unwrap();
        assert_eq!(loaded.current_term, 4);
        assert_eq!(loaded.voted_for.as_deref(), Some("n2"));
        assert_eq!(loaded.commit_index, 9);
    }

    #[test]
    fn cluster_node_upsert_replaces_address_and_source() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .upsert_cluster_node(&ClusterNode {
                node_id: "n2".into(),
                address: "10.0.0.2:8000".into(),
                source: NodeSource::Dns,
                last_seen: now,
            })
            .unwrap();
        store
            .upsert_cluster_node(&ClusterNode {
                node_id: "n2".into(),
                address: "10.0.0.3:8000".into(),
                source: NodeSource::Gossip,
                last_seen: now,
            })
            .unwrap();
        let nodes = store.cluster_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "10.0.0.3:8000");
    }
}
