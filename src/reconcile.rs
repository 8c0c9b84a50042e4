//! Background reconcilers (spec §4.7): one per entity family, replaying
//! peer-local events into the log via repair/domain operations so a node
//! that missed commits (e.g. minority-partition local writes) converges.
//!
//! Grounded on the teacher's long-lived background-task style in
//! `pkg/raft/src/main.rs` (the periodic `std::thread::sleep` poll loops
//! around `Node::start`), generalized to `tokio` tasks with a stop channel
//! per spec §5 task #6.

use crate::config::{timing, NodeConfig};
use crate::consensus::Engine;
use crate::domain::DomainStore;
use crate::errors::*;
use crate::peers::PeerStore;
use crate::rpc::{LocalEvent, RpcClient};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct Reconciler {
    config: NodeConfig,
    domain: Arc<dyn DomainStore>,
    peers: Arc<PeerStore>,
    engine: Arc<Engine>,
    rpc: RpcClient,
    cursors: Mutex<HashMap<String, DateTime<Utc>>>,
}

/// What a family resolver decided to do with one remote event.
enum Resolution {
    /// Already present locally, or this peer's own record about itself.
    Satisfied,
    /// A dependency (e.g. the owning user or appointment) isn't present
    /// locally yet; retry next cycle (spec §4.7 step 3 closing note).
    DependencyMissing,
    /// Build and propose this repair/domain entry.
    Propose { aggregate: String, aggregate_id: String, op: String, payload: serde_json::Value },
}

impl Reconciler {
    pub fn new(config: NodeConfig, domain: Arc<dyn DomainStore>, peers: Arc<PeerStore>, engine: Arc<Engine>) -> Arc<Self> {
        let rpc = RpcClient::new(config.cluster_hmac_secret.clone(), timing::DISCOVERY_RPC_TIMEOUT);
        Arc::new(Reconciler { config, domain, peers, engine, rpc, cursors: Mutex::new(HashMap::new()) })
    }

    /// Spawns every per-family loop. Returns immediately; callers hold the
    /// `JoinHandle`s only if they want to await shutdown.
    pub fn spawn_all(self: &Arc<Self>, stop: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        let families: [(&'static str, &'static str, ResolveFn); 6] = [
            ("local-audit/users", "users", resolve_user),
            ("local-events/groups", "groups", resolve_group),
            ("local-events/group-members", "group_members", resolve_group_member),
            ("local-events/appointments", "appointments", resolve_appointment),
            ("local-events/invitations", "participants", resolve_participant),
            ("local-events/notifications", "notifications", resolve_notification),
        ];
        families
            .into_iter()
            .map(|(path, cursor_key, resolve)| {
                let this = self.clone();
                let mut stop = stop.clone();
                tokio::spawn(async move {
                    loop {
                        this.run_cycle(path, cursor_key, resolve).await;
                        tokio::select! {
                            _ = tokio::time::sleep(timing::RECONCILE_INTERVAL) => {}
                            _ = stop.changed() => { if *stop.borrow() { break; } }
                        }
                    }
                })
            })
            .collect()
    }

    async fn run_cycle(&self, path: &str, cursor_key: &str, resolve: ResolveFn) {
        for peer_id in self.peers.active_peers() {
            let Some(address) = self.peers.address_of(&peer_id) else { continue };
            let since = self.cursor_for(cursor_key, &peer_id);
            let url = format!("http://{}/cluster/{}?since={}", address, path, since.to_rfc3339());
            let events: Vec<LocalEvent> = match self.rpc.get_signed(&url).await {
                Ok(e) => e,
                Err(e) => {
                    debug!(peer = %peer_id, family = %cursor_key, error = %e, "reconcile poll failed");
                    continue;
                }
            };
            let _ = self.peers.touch(&peer_id);
            if events.is_empty() {
                continue;
            }

            let mut max_seen = since;
            for event in &events {
                if event.timestamp > max_seen {
                    max_seen = event.timestamp;
                }
                if !self.engine.is_leader() {
                    // Followers poll to keep last_seen current but never
                    // propose (spec §4.7 step 2).
                    continue;
                }
                match resolve(&event.payload, self.domain.as_ref()) {
                    Ok(Resolution::Satisfied) => {}
                    Ok(Resolution::DependencyMissing) => {
                        debug!(family = %cursor_key, "dependency missing locally, retrying next cycle");
                    }
                    Ok(Resolution::Propose { aggregate, aggregate_id, op, payload }) => {
                        if let Err(e) = self.engine.propose_entry(&aggregate, &aggregate_id, &op, payload).await {
                            warn!(family = %cursor_key, op = %op, error = %e, "reconciler propose failed");
                        }
                    }
                    Err(e) => {
                        debug!(family = %cursor_key, error = %e, "skipping malformed reconcile event");
                    }
                }
            }
            self.set_cursor(cursor_key, &peer_id, max_seen);
        }
    }

    fn cursor_for(&self, family: &str, peer_id: &str) -> DateTime<Utc> {
        self.cursors
            .lock()
            .unwrap()
            .get(&format!("{}\u{1f}{}", family, peer_id))
            .copied()
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
    }

    fn set_cursor(&self, family: &str, peer_id: &str, at: DateTime<Utc>) {
        self.cursors.lock().unwrap().insert(format!("{}\u{1f}{}", family, peer_id), at);
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }
}

type ResolveFn = fn(&serde_json::Value, &dyn DomainStore) -> Result<Resolution>;

fn field_str(payload: &serde_json::Value, name: &str) -> Result<String> {
    payload
        .get(name)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::from(format!("missing required field: {}", name)))
}

fn field_opt_str(payload: &serde_json::Value, name: &str) -> Option<String> {
    payload.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

fn field_i64(payload: &serde_json::Value, name: &str) -> Result<i64> {
    payload.get(name).and_then(|v| v.as_i64()).ok_or_else(|| Error::from(format!("missing required field: {}", name)))
}

fn field_bool_or(payload: &serde_json::Value, name: &str, default: bool) -> bool {
    payload.get(name).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn resolve_user(payload: &serde_json::Value, domain: &dyn DomainStore) -> Result<Resolution> {
    let username = field_str(payload, "username")?;
    if domain.find_user_by_username(&username)?.is_some() {
        return Ok(Resolution::Satisfied);
    }
    let display_name = field_str(payload, "display_name")?;
    let password_hash = field_str(payload, "password_hash")?;
    let email = field_opt_str(payload, "email");
    Ok(Resolution::Propose {
        aggregate: "user".into(),
        aggregate_id: username.clone(),
        op: "repair.user.ensure".into(),
        payload: serde_json::json!({
            "user_id": uuid::Uuid::new_v4().to_string(),
            "username": username,
            "display_name": display_name,
            "password_hash": password_hash,
            "email": email,
        }),
    })
}

fn resolve_group(payload: &serde_json::Value, domain: &dyn DomainStore) -> Result<Resolution> {
    let name = field_str(payload, "name")?;
    let creator_username = field_str(payload, "creator_username")?;
    let group_type = field_str(payload, "group_type")?;

    let Some(creator) = domain.find_user_by_username(&creator_username)? else {
        return Ok(Resolution::DependencyMissing);
    };
    if domain.find_group_by_natural_key(&name, &creator.id, &group_type)?.is_some() {
        return Ok(Resolution::Satisfied);
    }
    Ok(Resolution::Propose {
        aggregate: "group".into(),
        aggregate_id: name.clone(),
        op: "repair.group.ensure".into(),
        payload: serde_json::json!({
            "group_id": uuid::Uuid::new_v4().to_string(),
            "name": name,
            "creator_id": creator.id,
            "group_type": group_type,
        }),
    })
}

fn resolve_group_member(payload: &serde_json::Value, domain: &dyn DomainStore) -> Result<Resolution> {
    let group_name = field_str(payload, "group_name")?;
    let group_creator_username = field_str(payload, "group_creator_username")?;
    let group_type = field_str(payload, "group_type")?;
    let member_username = field_str(payload, "member_username")?;
    let rank = field_i64(payload, "rank")?;

    let (Some(creator), Some(member)) =
        (domain.find_user_by_username(&group_creator_username)?, domain.find_user_by_username(&member_username)?)
    else {
        return Ok(Resolution::DependencyMissing);
    };
    let Some(group) = domain.find_group_by_natural_key(&group_name, &creator.id, &group_type)? else {
        return Ok(Resolution::DependencyMissing);
    };
    if domain.group_member_ids(&group.id)?.contains(&member.id) {
        return Ok(Resolution::Satisfied);
    }
    Ok(Resolution::Propose {
        aggregate: "group_member".into(),
        aggregate_id: format!("{}:{}", group.id, member.id),
        op: "repair.group.ensure_member".into(),
        payload: serde_json::json!({"group_id": group.id, "user_id": member.id, "rank": rank}),
    })
}

fn resolve_appointment_group_id(payload: &serde_json::Value, domain: &dyn DomainStore) -> Result<Option<Option<String>>> {
    let name = field_opt_str(payload, "group_name");
    let creator_username = field_opt_str(payload, "group_creator_username");
    let group_type = field_opt_str(payload, "group_type");
    match (name, creator_username, group_type) {
        (None, None, None) => Ok(Some(None)),
        (Some(name), Some(creator_username), Some(group_type)) => {
            let Some(creator) = domain.find_user_by_username(&creator_username)? else { return Ok(None) };
            match domain.find_group_by_natural_key(&name, &creator.id, &group_type)? {
                Some(group) => Ok(Some(Some(group.id))),
                None => Ok(None),
            }
        }
        _ => Ok(Some(None)),
    }
}

fn resolve_appointment(payload: &serde_json::Value, domain: &dyn DomainStore) -> Result<Resolution> {
    let owner_username = field_str(payload, "owner_username")?;
    let title = field_str(payload, "title")?;
    let start_ts: DateTime<Utc> = field_str(payload, "start_ts")?.parse().map_err(|_| Error::from("bad start_ts"))?;
    let end_ts: DateTime<Utc> = field_str(payload, "end_ts")?.parse().map_err(|_| Error::from("bad end_ts"))?;

    let Some(owner) = domain.find_user_by_username(&owner_username)? else {
        return Ok(Resolution::DependencyMissing);
    };
    let Some(group_id) = resolve_appointment_group_id(payload, domain)? else {
        return Ok(Resolution::DependencyMissing);
    };
    if domain.find_appointment_by_natural_key(&owner.id, group_id.as_deref(), start_ts, end_ts, &title)?.is_some() {
        return Ok(Resolution::Satisfied);
    }
    let appointment_id = uuid::Uuid::new_v4().to_string();
    match &group_id {
        Some(group_id) => Ok(Resolution::Propose {
            aggregate: "appointment".into(),
            aggregate_id: appointment_id.clone(),
            op: "appointment.create_group".into(),
            payload: serde_json::json!({
                "appointment_id": appointment_id, "owner_id": owner.id, "group_id": group_id,
                "title": title, "start_ts": start_ts, "end_ts": end_ts,
            }),
        }),
        None => Ok(Resolution::Propose {
            aggregate: "appointment".into(),
            aggregate_id: appointment_id.clone(),
            op: "appointment.create_personal".into(),
            payload: serde_json::json!({
                "appointment_id": appointment_id, "owner_id": owner.id, "title": title,
                "start_ts": start_ts, "end_ts": end_ts,
            }),
        }),
    }
}

fn resolve_participant(payload: &serde_json::Value, domain: &dyn DomainStore) -> Result<Resolution> {
    let owner_username = field_str(payload, "owner_username")?;
    let title = field_str(payload, "title")?;
    let start_ts: DateTime<Utc> = field_str(payload, "start_ts")?.parse().map_err(|_| Error::from("bad start_ts"))?;
    let end_ts: DateTime<Utc> = field_str(payload, "end_ts")?.parse().map_err(|_| Error::from("bad end_ts"))?;
    let participant_username = field_str(payload, "participant_username")?;
    let status = field_str(payload, "status")?;
    let is_optional = field_bool_or(payload, "is_optional", false);

    let Some(owner) = domain.find_user_by_username(&owner_username)? else {
        return Ok(Resolution::DependencyMissing);
    };
    let Some(group_id) = resolve_appointment_group_id(payload, domain)? else {
        return Ok(Resolution::DependencyMissing);
    };
    let Some(appointment) = domain.find_appointment_by_natural_key(&owner.id, group_id.as_deref(), start_ts, end_ts, &title)? else {
        return Ok(Resolution::DependencyMissing);
    };
    let Some(participant) = domain.find_user_by_username(&participant_username)? else {
        return Ok(Resolution::DependencyMissing);
    };
    Ok(Resolution::Propose {
        aggregate: "participant".into(),
        aggregate_id: format!("{}:{}", appointment.id, participant.id),
        op: "repair.appointment.ensure_participant".into(),
        payload: serde_json::json!({"appointment_id": appointment.id, "user_id": participant.id, "status": status, "is_optional": is_optional}),
    })
}

fn resolve_notification(payload: &serde_json::Value, domain: &dyn DomainStore) -> Result<Resolution> {
    let username = field_str(payload, "username")?;
    let kind = field_str(payload, "kind")?;
    let payload_text = field_str(payload, "payload")?;

    let Some(user) = domain.find_user_by_username(&username)? else {
        return Ok(Resolution::DependencyMissing);
    };
    let payload_value: serde_json::Value = serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null);
    Ok(Resolution::Propose {
        aggregate: "notification".into(),
        aggregate_id: uuid::Uuid::new_v4().to_string(),
        op: "repair.notification.ensure".into(),
        payload: serde_json::json!({
            "notification_id": uuid::Uuid::new_v4().to_string(),
            "user_id": user.id,
            "kind": kind,
            "payload": payload_value,
        }),
    })
}
