//! The calendar/agenda domain schema and CRUD operations (spec §3, §4.2).
//!
//! Sits alongside `store::SqliteStore` rather than inside it: the Raft log
//! and metadata tables are engine-owned and touched only by the consensus
//! engine, while these tables are touched only by the applier (on the apply
//! path) and by reconcilers (read-only, for local-events scans). Both share
//! the same `r2d2` pool so writes through the applier and reads from HTTP
//! handlers observe SQLite's own transaction isolation (spec §5).

use crate::errors::*;
use crate::store::Pool;
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    pub group_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: String,
    pub user_id: String,
    pub rank: i64,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub owner_id: String,
    pub group_id: Option<String>,
    pub title: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub appointment_id: String,
    pub user_id: String,
    pub status: String,
    pub is_optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One row of a local-events scan (spec §4.7, `GET
/// /cluster/local-events/{family}`): a monotonic per-table cursor paired
/// with the natural-key signature reconcilers use to decide whether a peer
/// is missing the row.
#[derive(Debug, Clone)]
pub struct LocalEventRow {
    pub seq: i64,
    pub signature: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub trait DomainStore: Send + Sync {
    fn create_user(&self, user: &User) -> Result<()>;
    fn update_user_profile(&self, user_id: &str, display_name: &str, email: Option<&str>) -> Result<()>;
    fn update_user_password(&self, user_id: &str, password_hash: &str) -> Result<()>;
    fn clear_user_email_if_matches(&self, user_id: &str, email: &str) -> Result<()>;
    fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn find_user(&self, user_id: &str) -> Result<Option<User>>;
    fn ensure_user(&self, user: &User) -> Result<()>;

    fn create_group(&self, group: &Group) -> Result<()>;
    fn update_group(&self, group_id: &str, name: &str) -> Result<()>;
    fn delete_group(&self, group_id: &str) -> Result<()>;
    fn find_group_by_natural_key(&self, name: &str, creator_id: &str, group_type: &str) -> Result<Option<Group>>;
    fn find_group(&self, group_id: &str) -> Result<Option<Group>>;
    fn ensure_group(&self, group: &Group) -> Result<()>;

    fn add_group_member(&self, member: &GroupMember) -> Result<()>;
    fn update_group_member(&self, group_id: &str, user_id: &str, rank: i64) -> Result<()>;
    fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<()>;
    fn group_member_ids(&self, group_id: &str) -> Result<Vec<String>>;
    /// `(user_id, rank)` for every member, used by the group-appointment
    /// expansion hierarchy rule (spec §4.2.3).
    fn group_members_with_rank(&self, group_id: &str) -> Result<Vec<(String, i64)>>;
    fn ensure_group_member(&self, member: &GroupMember) -> Result<()>;

    fn create_appointment(&self, appt: &Appointment) -> Result<()>;
    fn update_appointment(&self, appt_id: &str, title: &str, start_ts: DateTime<Utc>, end_ts: DateTime<Utc>) -> Result<()>;
    fn delete_appointment(&self, appt_id: &str) -> Result<()>;
    fn find_appointment(&self, appt_id: &str) -> Result<Option<Appointment>>;
    fn find_appointment_by_natural_key(
        &self,
        owner_id: &str,
        group_id: Option<&str>,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        title: &str,
    ) -> Result<Option<Appointment>>;

    fn add_participant(&self, p: &Participant) -> Result<()>;
    fn set_participant_status(&self, appt_id: &str, user_id: &str, status: &str) -> Result<()>;
    fn ensure_participant(&self, p: &Participant) -> Result<()>;

    fn create_notification(&self, n: &Notification) -> Result<()>;
    fn ensure_notification(&self, n: &Notification) -> Result<()>;

    fn local_events(&self, family: &str, since_seq: i64, limit: i64) -> Result<Vec<LocalEventRow>>;

    /// Same result shape as `local_events`, filtered by wall-clock timestamp
    /// instead of a local sequence cursor — used by the wire endpoint `GET
    /// /cluster/local-events/{family}?since=<RFC3339>` (spec §6), since a
    /// remote peer has no way to address our internal `seq` values.
    fn local_events_since(&self, family: &str, since: DateTime<Utc>, limit: i64) -> Result<Vec<LocalEventRow>>;
}

pub struct SqliteDomainStore {
    pool: Pool,
}

impl SqliteDomainStore {
    pub fn new(pool: Pool) -> Result<Arc<Self>> {
        let store = SqliteDomainStore { pool };
        store.migrate()?;
        Ok(Arc::new(store))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                username TEXT UNIQUE NOT NULL,
                display_name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                email TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS groups (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                name TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                group_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(name, creator_id, group_type)
            );
            CREATE TABLE IF NOT EXISTS group_members (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                rank INTEGER NOT NULL,
                added_at TEXT NOT NULL,
                UNIQUE(group_id, user_id)
            );
            CREATE TABLE IF NOT EXISTS appointments (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                owner_id TEXT NOT NULL,
                group_id TEXT,
                title TEXT NOT NULL,
                start_ts TEXT NOT NULL,
                end_ts TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner_id, group_id, start_ts, end_ts, title)
            );
            CREATE TABLE IF NOT EXISTS participants (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                appointment_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                is_optional INTEGER NOT NULL DEFAULT 0,
                UNIQUE(appointment_id, user_id)
            );
            CREATE TABLE IF NOT EXISTS notifications (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, kind, payload)
            );
            "#,
        )?;
        Ok(())
    }
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let email: Option<String> = row.get("email")?;
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        display_name: row.get("display_name")?,
        password_hash: row.get("password_hash")?,
        email,
        created_at: parse_ts(row.get::<_, String>("created_at")?),
        updated_at: parse_ts(row.get::<_, String>("updated_at")?),
    })
}

fn row_to_group(row: &rusqlite::Row) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get("id")?,
        name: row.get("name")?,
        creator_id: row.get("creator_id")?,
        group_type: row.get("group_type")?,
        created_at: parse_ts(row.get::<_, String>("created_at")?),
        updated_at: parse_ts(row.get::<_, String>("updated_at")?),
    })
}

fn row_to_appointment(row: &rusqlite::Row) -> rusqlite::Result<Appointment> {
    Ok(Appointment {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        group_id: row.get("group_id")?,
        title: row.get("title")?,
        start_ts: parse_ts(row.get::<_, String>("start_ts")?),
        end_ts: parse_ts(row.get::<_, String>("end_ts")?),
        created_at: parse_ts(row.get::<_, String>("created_at")?),
        updated_at: parse_ts(row.get::<_, String>("updated_at")?),
    })
}

fn parse_ts(s: String) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

/// Translates a SQLite unique-constraint violation into the ignorable
/// taxonomy (spec §4.2.4) by surfacing a message `is_ignorable_apply_error`
/// recognizes, instead of the raw SQLite error text.
fn map_conflict(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(ref sqlite_err, _) = e {
        if sqlite_err.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::from("unique constraint: row already exists".to_string());
        }
    }
    Error::from(e)
}

impl DomainStore for SqliteDomainStore {
    fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO users (id, username, display_name, password_hash, email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id,
                user.username,
                user.display_name,
                user.password_hash,
                user.email,
                user.created_at.to_rfc3339(),
                user.updated_at.to_rfc3339(),
            ],
        )
        .map_err(map_conflict)?;
        Ok(())
    }

    fn update_user_profile(&self, user_id: &str, display_name: &str, email: Option<&str>) -> Result<()> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "UPDATE users SET display_name = ?2, email = ?3, updated_at = ?4 WHERE id = ?1",
            params![user_id, display_name, email, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(Error::from("member not found: user does not exist".to_string()));
        }
        Ok(())
    }

    fn update_user_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "UPDATE users SET password_hash = ?2, updated_at = ?3 WHERE id = ?1",
            params![user_id, password_hash, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(Error::from("member not found: user does not exist".to_string()));
        }
        Ok(())
    }

    fn clear_user_email_if_matches(&self, user_id: &str, email: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE users SET email = NULL, updated_at = ?3 WHERE id = ?1 AND email = ?2",
            params![user_id, email, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row("SELECT * FROM users WHERE username = ?1", params![username], row_to_user)
            .optional()?)
    }

    fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row("SELECT * FROM users WHERE id = ?1", params![user_id], row_to_user)
            .optional()?)
    }

    fn ensure_user(&self, user: &User) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO users (id, username, display_name, password_hash, email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(username) DO NOTHING",
            params![
                user.id,
                user.username,
                user.display_name,
                user.password_hash,
                user.email,
                user.created_at.to_rfc3339(),
                user.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn create_group(&self, group: &Group) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO groups (id, name, creator_id, group_type, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                group.id,
                group.name,
                group.creator_id,
                group.group_type,
                group.created_at.to_rfc3339(),
                group.updated_at.to_rfc3339(),
            ],
        )
        .map_err(map_conflict)?;
        Ok(())
    }

    fn update_group(&self, group_id: &str, name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "UPDATE groups SET name = ?2, updated_at = ?3 WHERE id = ?1",
            params![group_id, name, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(Error::from("member not found: group does not exist".to_string()));
        }
        Ok(())
    }

    fn delete_group(&self, group_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM group_members WHERE group_id = ?1", params![group_id])?;
        conn.execute("DELETE FROM groups WHERE id = ?1", params![group_id])?;
        Ok(())
    }

    fn find_group_by_natural_key(&self, name: &str, creator_id: &str, group_type: &str) -> Result<Option<Group>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT * FROM groups WHERE name = ?1 AND creator_id = ?2 AND group_type = ?3",
                params![name, creator_id, group_type],
                row_to_group,
            )
            .optional()?)
    }

    fn find_group(&self, group_id: &str) -> Result<Option<Group>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row("SELECT * FROM groups WHERE id = ?1", params![group_id], row_to_group)
            .optional()?)
    }

    fn ensure_group(&self, group: &Group) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO groups (id, name, creator_id, group_type, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name, creator_id, group_type) DO NOTHING",
            params![
                group.id,
                group.name,
                group.creator_id,
                group.group_type,
                group.created_at.to_rfc3339(),
                group.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn add_group_member(&self, member: &GroupMember) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO group_members (group_id, user_id, rank, added_at) VALUES (?1, ?2, ?3, ?4)",
            params![member.group_id, member.user_id, member.rank, member.added_at.to_rfc3339()],
        )
        .map_err(map_conflict)?;
        Ok(())
    }

    fn update_group_member(&self, group_id: &str, user_id: &str, rank: i64) -> Result<()> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "UPDATE group_members SET rank = ?3 WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id, rank],
        )?;
        if n == 0 {
            return Err(Error::from("member not found: group member does not exist".to_string()));
        }
        Ok(())
    }

    fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )?;
        Ok(())
    }

    fn group_member_ids(&self, group_id: &str) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
        let rows = stmt.query_map(params![group_id], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn group_members_with_rank(&self, group_id: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT user_id, rank FROM group_members WHERE group_id = ?1")?;
        let rows = stmt.query_map(params![group_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn ensure_group_member(&self, member: &GroupMember) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO group_members (group_id, user_id, rank, added_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id, user_id) DO NOTHING",
            params![member.group_id, member.user_id, member.rank, member.added_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn create_appointment(&self, appt: &Appointment) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO appointments (id, owner_id, group_id, title, start_ts, end_ts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                appt.id,
                appt.owner_id,
                appt.group_id,
                appt.title,
                appt.start_ts.to_rfc3339(),
                appt.end_ts.to_rfc3339(),
                appt.created_at.to_rfc3339(),
                appt.updated_at.to_rfc3339(),
            ],
        )
        .map_err(map_conflict)?;
        Ok(())
    }

    fn update_appointment(&self, appt_id: &str, title: &str, start_ts: DateTime<Utc>, end_ts: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "UPDATE appointments SET title = ?2, start_ts = ?3, end_ts = ?4, updated_at = ?5 WHERE id = ?1",
            params![appt_id, title, start_ts.to_rfc3339(), end_ts.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(Error::from("member not found: appointment does not exist".to_string()));
        }
        Ok(())
    }

    fn delete_appointment(&self, appt_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM participants WHERE appointment_id = ?1", params![appt_id])?;
        conn.execute("DELETE FROM appointments WHERE id = ?1", params![appt_id])?;
        Ok(())
    }

    fn find_appointment(&self, appt_id: &str) -> Result<Option<Appointment>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row("SELECT * FROM appointments WHERE id = ?1", params![appt_id], row_to_appointment)
            .optional()?)
    }

    fn find_appointment_by_natural_key(
        &self,
        owner_id: &str,
        group_id: Option<&str>,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        title: &str,
    ) -> Result<Option<Appointment>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                "SELECT * FROM appointments WHERE owner_id = ?1 AND group_id IS ?2 AND start_ts = ?3 AND end_ts = ?4 AND title = ?5",
                params![owner_id, group_id, start_ts.to_rfc3339(), end_ts.to_rfc3339(), title],
                row_to_appointment,
            )
            .optional()?)
    }

    fn add_participant(&self, p: &Participant) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO participants (appointment_id, user_id, status, is_optional) VALUES (?1, ?2, ?3, ?4)",
            params![p.appointment_id, p.user_id, p.status, p.is_optional],
        )
        .map_err(map_conflict)?;
        Ok(())
    }

    fn set_participant_status(&self, appt_id: &str, user_id: &str, status: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "UPDATE participants SET status = ?3 WHERE appointment_id = ?1 AND user_id = ?2",
            params![appt_id, user_id, status],
        )?;
        if n == 0 {
            return Err(Error::from("member not found: participant does not exist".to_string()));
        }
        Ok(())
    }

    fn ensure_participant(&self, p: &Participant) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO participants (appointment_id, user_id, status, is_optional) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(appointment_id, user_id) DO NOTHING",
            params![p.appointment_id, p.user_id, p.status, p.is_optional],
        )?;
        Ok(())
    }

    fn create_notification(&self, n: &Notification) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO notifications (id, user_id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![n.id, n.user_id, n.kind, serde_json::to_string(&n.payload)?, n.created_at.to_rfc3339()],
        )
        .map_err(map_conflict)?;
        Ok(())
    }

    fn ensure_notification(&self, n: &Notification) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO notifications (id, user_id, kind, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, kind, payload) DO NOTHING",
            params![n.id, n.user_id, n.kind, serde_json::to_string(&n.payload)?, n.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn local_events(&self, family: &str, since_seq: i64, limit: i64) -> Result<Vec<LocalEventRow>> {
        let conn = self.pool.get()?;
        match family {
            "users" => {
                let mut stmt = conn.prepare(
                    "SELECT seq, username, id, display_name, email, password_hash, created_at FROM users WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![since_seq, limit], |r| {
                    let seq: i64 = r.get(0)?;
                    let username: String = r.get(1)?;
                    let id: String = r.get(2)?;
                    let display_name: String = r.get(3)?;
                    let email: Option<String> = r.get(4)?;
                    let password_hash: String = r.get(5)?;
                    let created_at: String = r.get(6)?;
                    Ok(LocalEventRow {
                        seq,
                        signature: username.clone(),
                        payload: serde_json::json!({"id": id, "username": username, "display_name": display_name, "email": email, "password_hash": password_hash}),
                        created_at: parse_ts(created_at),
                    })
                })?;
                collect(rows)
            }
            "groups" => {
                // Natural signature resolves creator_id to a username (spec
                // §4.2.2) so a remote peer, which has no notion of our
                // surrogate id, can still resolve this row.
                let mut stmt = conn.prepare(
                    "SELECT g.seq, g.name, u.username, g.group_type, g.id, g.created_at
                     FROM groups g JOIN users u ON u.id = g.creator_id
                     WHERE g.seq > ?1 ORDER BY g.seq ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![since_seq, limit], |r| {
                    let seq: i64 = r.get(0)?;
                    let name: String = r.get(1)?;
                    let creator_username: String = r.get(2)?;
                    let group_type: String = r.get(3)?;
                    let id: String = r.get(4)?;
                    let created_at: String = r.get(5)?;
                    Ok(LocalEventRow {
                        seq,
                        signature: format!("{}\u{1f}{}\u{1f}{}", name, creator_username, group_type),
                        payload: serde_json::json!({"id": id, "name": name, "creator_username": creator_username, "group_type": group_type}),
                        created_at: parse_ts(created_at),
                    })
                })?;
                collect(rows)
            }
            "group_members" => {
                let mut stmt = conn.prepare(
                    "SELECT gm.seq, g.name, gu.username, g.group_type, mu.username, gm.rank, gm.added_at
                     FROM group_members gm
                     JOIN groups g ON g.id = gm.group_id
                     JOIN users gu ON gu.id = g.creator_id
                     JOIN users mu ON mu.id = gm.user_id
                     WHERE gm.seq > ?1 ORDER BY gm.seq ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![since_seq, limit], |r| {
                    let seq: i64 = r.get(0)?;
                    let group_name: String = r.get(1)?;
                    let group_creator_username: String = r.get(2)?;
                    let group_type: String = r.get(3)?;
                    let member_username: String = r.get(4)?;
                    let rank: i64 = r.get(5)?;
                    let added_at: String = r.get(6)?;
                    Ok(LocalEventRow {
                        seq,
                        signature: format!("{}\u{1f}{}\u{1f}{}\u{1f}{}", group_name, group_creator_username, group_type, member_username),
                        payload: serde_json::json!({
                            "group_name": group_name, "group_creator_username": group_creator_username,
                            "group_type": group_type, "member_username": member_username, "rank": rank
                        }),
                        created_at: parse_ts(added_at),
                    })
                })?;
                collect(rows)
            }
            "appointments" => {
                let mut stmt = conn.prepare(
                    "SELECT a.seq, ou.username, g.name, gu.username, g.group_type, a.start_ts, a.end_ts, a.title, a.id, a.created_at
                     FROM appointments a
                     JOIN users ou ON ou.id = a.owner_id
                     LEFT JOIN groups g ON g.id = a.group_id
                     LEFT JOIN users gu ON gu.id = g.creator_id
                     WHERE a.seq > ?1 ORDER BY a.seq ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![since_seq, limit], |r| {
                    let seq: i64 = r.get(0)?;
                    let owner_username: String = r.get(1)?;
                    let group_name: Option<String> = r.get(2)?;
                    let group_creator_username: Option<String> = r.get(3)?;
                    let group_type: Option<String> = r.get(4)?;
                    let start_ts: String = r.get(5)?;
                    let end_ts: String = r.get(6)?;
                    let title: String = r.get(7)?;
                    let id: String = r.get(8)?;
                    let created_at: String = r.get(9)?;
                    let group_sig = match (&group_name, &group_creator_username, &group_type) {
                        (Some(n), Some(c), Some(t)) => format!("{}\u{1f}{}\u{1f}{}", n, c, t),
                        _ => String::new(),
                    };
                    Ok(LocalEventRow {
                        seq,
                        signature: format!("{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}", owner_username, group_sig, start_ts, end_ts, title),
                        payload: serde_json::json!({
                            "id": id, "owner_username": owner_username, "group_name": group_name,
                            "group_creator_username": group_creator_username, "group_type": group_type,
                            "start_ts": start_ts, "end_ts": end_ts, "title": title
                        }),
                        created_at: parse_ts(created_at),
                    })
                })?;
                collect(rows)
            }
            "participants" => {
                let mut stmt = conn.prepare(
                    "SELECT p.seq, ou.username, g.name, gcu.username, g.group_type, a.start_ts, a.end_ts, a.title, u.username, p.status, p.is_optional
                     FROM participants p
                     JOIN appointments a ON a.id = p.appointment_id
                     JOIN users ou ON ou.id = a.owner_id
                     LEFT JOIN groups g ON g.id = a.group_id
                     LEFT JOIN users gcu ON gcu.id = g.creator_id
                     JOIN users u ON u.id = p.user_id
                     WHERE p.seq > ?1 ORDER BY p.seq ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![since_seq, limit], |r| {
                    let seq: i64 = r.get(0)?;
                    let owner_username: String = r.get(1)?;
                    let group_name: Option<String> = r.get(2)?;
                    let group_creator_username: Option<String> = r.get(3)?;
                    let group_type: Option<String> = r.get(4)?;
                    let start_ts: String = r.get(5)?;
                    let end_ts: String = r.get(6)?;
                    let title: String = r.get(7)?;
                    let participant_username: String = r.get(8)?;
                    let status: String = r.get(9)?;
                    let is_optional: bool = r.get(10)?;
                    let group_sig = match (&group_name, &group_creator_username, &group_type) {
                        (Some(n), Some(c), Some(t)) => format!("{}\u{1f}{}\u{1f}{}", n, c, t),
                        _ => String::new(),
                    };
                    Ok(LocalEventRow {
                        seq,
                        signature: format!("{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}", owner_username, group_sig, start_ts, end_ts, title, participant_username),
                        payload: serde_json::json!({
                            "owner_username": owner_username, "group_name": group_name, "group_creator_username": group_creator_username,
                            "group_type": group_type, "start_ts": start_ts, "end_ts": end_ts, "title": title,
                            "participant_username": participant_username, "status": status, "is_optional": is_optional
                        }),
                        created_at: Utc::now(),
                    })
                })?;
                collect(rows)
            }
            "notifications" => {
                let mut stmt = conn.prepare(
                    "SELECT n.seq, u.username, n.kind, n.payload, n.id, n.created_at
                     FROM notifications n JOIN users u ON u.id = n.user_id
                     WHERE n.seq > ?1 ORDER BY n.seq ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![since_seq, limit], |r| {
                    let seq: i64 = r.get(0)?;
                    let username: String = r.get(1)?;
                    let kind: String = r.get(2)?;
                    let payload: String = r.get(3)?;
                    let id: String = r.get(4)?;
                    let created_at: String = r.get(5)?;
                    Ok(LocalEventRow {
                        seq,
                        signature: format!("{}\u{1f}{}\u{1f}{}", username, kind, payload),
                        payload: serde_json::json!({"id": id, "username": username, "kind": kind, "payload": payload}),
                        created_at: parse_ts(created_at),
                    })
                })?;
                collect(rows)
            }
            _ => Err(Error::from(format!("unknown local-events family: {}", family))),
        }
    }

    fn local_events_since(&self, family: &str, since: DateTime<Utc>, limit: i64) -> Result<Vec<LocalEventRow>> {
        // Reconciliation cadence is on the order of tens of seconds (spec
        // §4.7), so a full per-cycle scan-and-filter is cheap relative to a
        // second parallel set of prepared statements per family.
        let all = self.local_events(family, 0, i64::MAX)?;
        Ok(all.into_iter().filter(|r| r.created_at > since).take(limit.max(0) as usize).collect())
    }
}

fn collect<I: Iterator<Item = rusqlite::Result<LocalEventRow>>>(rows: I) -> Result<Vec<LocalEventRow>> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn pool_from_dsn(dsn: &str) -> Result<Pool> {
    let manager = if dsn == ":memory:" {
        SqliteConnectionManager::memory()
    } else {
        SqliteConnectionManager::file(dsn)
    };
    r2d2::Pool::new(manager).map_err(|e| Error::from(format!("sqlite pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<SqliteDomainStore> {
        SqliteDomainStore::new(pool_from_dsn(":memory:").unwrap()).unwrap()
    }

    fn user(id: &str, username: &str) -> User {
        User {
            id: id.into(),
            username: username.into(),
            display_name: "Alice".into(),
            password_hash: "hash".into(),
            email: Some("a@example.com".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn create_user_then_find_by_username() {
        let s = store();
        s.create_user(&user("u1", "alice")).unwrap();
        let found = s.find_user_by_username("alice").unwrap().unwrap();
        assert_eq!(found.id, "u1");
    }

    #[test]
    fn duplicate_username_is_ignorable_conflict() {
        let s = store();
        s.create_user(&user("u1", "alice")).unwrap();
        let err = s.create_user(&user("u2", "alice")).unwrap_err();
        assert!(is_ignorable_apply_error("user.create", &err.to_string()));
    }

    #[test]
    fn ensure_group_member_is_idempotent() {
        let s = store();
        s.create_group(&Group {
            id: "g1".into(),
            name: "team".into(),
            creator_id: "u1".into(),
            group_type: "team".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .unwrap();
        let m = GroupMember { group_id: "g1".into(), user_id: "u1".into(), rank: 5, added_at: Utc::now() };
        s.ensure_group_member(&m).unwrap();
        s.ensure_group_member(&m).unwrap();
        assert_eq!(s.group_member_ids("g1").unwrap(), vec!["u1".to_string()]);
    }

    #[test]
    fn local_events_respects_watermark() {
        let s = store();
        s.create_user(&user("u1", "alice")).unwrap();
        s.create_user(&user("u2", "bob")).unwrap();
        let first = s.local_events("users", 0, 10).unwrap();
        assert_eq!(first.len(), 2);
        let since = s.local_events("users", first[0].seq, 10).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].signature, "bob");
    }
}
