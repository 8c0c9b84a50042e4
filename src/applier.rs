//! The operation catalog and deterministic applier (spec §4.2).
//!
//! The teacher crate treats a log entry's payload as an opaque
//! `Vec<u8>` handed to a caller-supplied state machine (`pkg/core`'s
//! generic `StateMachine` trait, referenced from `pkg/raft/src/main.rs`).
//! This module is that state machine: every committed `LogEntry.op` is
//! matched against the catalog below and turned into one deterministic
//! mutation of the domain tables in `domain.rs`. Every operation here must
//! be safe to re-apply (I5): mutations either use the table's natural-key
//! unique index to make a repeat a no-op, or return an error
//! `errors::is_ignorable_apply_error` recognizes when they detect the
//! repeat a different way.

use crate::domain::{Appointment, DomainStore, Group, GroupMember, Notification, Participant, User};
use crate::errors::*;
use crate::types::LogEntry;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Owner rank assigned to a group's creator at `group.create` time (spec
/// §4.2.1): a hierarchical group's owner outranks every member that can be
/// added beneath them, a flat group's owner ranks level with everyone else.
fn owner_rank_for_group_type(group_type: &str) -> i64 {
    if group_type == "hierarchical" {
        5
    } else {
        0
    }
}

pub trait Applier: Send + Sync {
    fn apply(&self, entry: &LogEntry) -> Result<()>;
}

/// Used in tests that only exercise the consensus engine's replication and
/// election behavior, where the business payload is irrelevant.
pub struct NoopApplier;

impl Applier for NoopApplier {
    fn apply(&self, _entry: &LogEntry) -> Result<()> {
        Ok(())
    }
}

pub struct OperationApplier {
    domain: Arc<dyn DomainStore>,
}

impl OperationApplier {
    pub fn new(domain: Arc<dyn DomainStore>) -> Arc<Self> {
        Arc::new(OperationApplier { domain })
    }

    /// Notifies an appointment's owner of a participant's accept/reject
    /// decision (operation table row "invitation.accept / .reject", spec
    /// §4.2.1). The appointment should always exist by the time a decision
    /// applies (log order is total), but this degrades to a no-op rather
    /// than failing the whole apply if it somehow doesn't.
    fn notify_owner_of_decision(&self, appointment_id: &str, participant_id: &str, kind: &str, at: DateTime<Utc>) -> Result<()> {
        let Some(appointment) = self.domain.find_appointment(appointment_id)? else { return Ok(()) };
        if let Err(e) = self.domain.create_notification(&Notification {
            id: Uuid::new_v4().to_string(),
            user_id: appointment.owner_id,
            kind: kind.into(),
            payload: serde_json::json!({"appointment_id": appointment_id, "participant_id": participant_id}),
            created_at: at,
        }) {
            let msg = e.to_string().to_ascii_lowercase();
            if !msg.contains("unique constraint") && !msg.contains("already exists") {
                return Err(e);
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct UserCreatePayload {
    user_id: String,
    username: String,
    display_name: String,
    password_hash: String,
    email: Option<String>,
}

#[derive(Deserialize)]
struct UserUpdateProfilePayload {
    user_id: String,
    display_name: String,
    email: Option<String>,
}

#[derive(Deserialize)]
struct UserUpdatePasswordPayload {
    user_id: String,
    password_hash: String,
}

#[derive(Deserialize)]
struct UserClearEmailPayload {
    user_id: String,
    email: String,
}

#[derive(Deserialize)]
struct GroupCreatePayload {
    group_id: String,
    name: String,
    creator_id: String,
    group_type: String,
}

#[derive(Deserialize)]
struct GroupUpdatePayload {
    group_id: String,
    name: String,
}

#[derive(Deserialize)]
struct GroupDeletePayload {
    group_id: String,
}

#[derive(Deserialize)]
struct GroupMemberAddPayload {
    group_id: String,
    user_id: String,
    rank: i64,
}

#[derive(Deserialize)]
struct GroupMemberUpdatePayload {
    group_id: String,
    user_id: String,
    rank: i64,
}

#[derive(Deserialize)]
struct GroupMemberRemovePayload {
    group_id: String,
    user_id: String,
}

#[derive(Deserialize)]
struct AppointmentCreatePersonalPayload {
    appointment_id: String,
    owner_id: String,
    title: String,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
}

#[derive(Deserialize)]
struct AppointmentCreateGroupPayload {
    appointment_id: String,
    owner_id: String,
    group_id: String,
    title: String,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
}

#[derive(Deserialize)]
struct AppointmentUpdatePayload {
    appointment_id: String,
    title: String,
    start_ts: DateTime<Utc>,
    end_ts: DateTime<Utc>,
}

#[derive(Deserialize)]
struct AppointmentDeletePayload {
    appointment_id: String,
}

#[derive(Deserialize)]
struct InvitationDecisionPayload {
    appointment_id: String,
    user_id: String,
}

#[derive(Deserialize)]
struct RepairUserEnsurePayload {
    user_id: String,
    username: String,
    display_name: String,
    password_hash: String,
    email: Option<String>,
}

#[derive(Deserialize)]
struct RepairGroupEnsureMemberPayload {
    group_id: String,
    user_id: String,
    rank: i64,
}

#[derive(Deserialize)]
struct RepairGroupEnsurePayload {
    group_id: String,
    name: String,
    creator_id: String,
    group_type: String,
}

#[derive(Deserialize)]
struct RepairAppointmentEnsureParticipantPayload {
    appointment_id: String,
    user_id: String,
    status: String,
    is_optional: bool,
}

#[derive(Deserialize)]
struct RepairNotificationEnsurePayload {
    notification_id: String,
    user_id: String,
    kind: String,
    payload: serde_json::Value,
}

fn parse<'a, T: Deserialize<'a>>(entry: &'a LogEntry) -> Result<T> {
    serde_json::from_value(entry.payload.clone()).map_err(|e| Error::from(format!("malformed payload for {}: {}", entry.op, e)))
}

impl Applier for OperationApplier {
    fn apply(&self, entry: &LogEntry) -> Result<()> {
        match entry.op.as_str() {
            "_noop" => Ok(()),

            "user.create" => {
                let p: UserCreatePayload = parse(entry)?;
                self.domain.create_user(&User {
                    id: p.user_id,
                    username: p.username,
                    display_name: p.display_name,
                    password_hash: p.password_hash,
                    email: p.email,
                    created_at: entry.timestamp,
                    updated_at: entry.timestamp,
                })
            }
            "user.update_profile" => {
                let p: UserUpdateProfilePayload = parse(entry)?;
                self.domain.update_user_profile(&p.user_id, &p.display_name, p.email.as_deref())
            }
            "user.update_password" => {
                let p: UserUpdatePasswordPayload = parse(entry)?;
                self.domain.update_user_password(&p.user_id, &p.password_hash)
            }

            "group.create" => {
                let p: GroupCreatePayload = parse(entry)?;
                self.domain.create_group(&Group {
                    id: p.group_id.clone(),
                    name: p.name,
                    creator_id: p.creator_id.clone(),
                    group_type: p.group_type.clone(),
                    created_at: entry.timestamp,
                    updated_at: entry.timestamp,
                })?;
                self.domain.add_group_member(&GroupMember {
                    group_id: p.group_id,
                    user_id: p.creator_id,
                    rank: owner_rank_for_group_type(&p.group_type),
                    added_at: entry.timestamp,
                })
            }
            "group.update" => {
                let p: GroupUpdatePayload = parse(entry)?;
                self.domain.update_group(&p.group_id, &p.name)
            }
            "group.delete" => {
                let p: GroupDeletePayload = parse(entry)?;
                self.domain.delete_group(&p.group_id)
            }
            "group.member_add" => {
                let p: GroupMemberAddPayload = parse(entry)?;
                self.domain.add_group_member(&GroupMember {
                    group_id: p.group_id,
                    user_id: p.user_id,
                    rank: p.rank,
                    added_at: entry.timestamp,
                })
            }
            "group.member_update" => {
                let p: GroupMemberUpdatePayload = parse(entry)?;
                self.domain.update_group_member(&p.group_id, &p.user_id, p.rank)
            }
            "group.member_remove" => {
                let p: GroupMemberRemovePayload = parse(entry)?;
                self.domain.remove_group_member(&p.group_id, &p.user_id)
            }

            "appointment.create_personal" => {
                let p: AppointmentCreatePersonalPayload = parse(entry)?;
                self.domain.create_appointment(&Appointment {
                    id: p.appointment_id.clone(),
                    owner_id: p.owner_id.clone(),
                    group_id: None,
                    title: p.title,
                    start_ts: p.start_ts,
                    end_ts: p.end_ts,
                    created_at: entry.timestamp,
                    updated_at: entry.timestamp,
                })?;
                self.domain.add_participant(&Participant {
                    appointment_id: p.appointment_id,
                    user_id: p.owner_id,
                    status: "accepted".into(),
                    is_optional: false,
                })
            }
            "appointment.create_group" => {
                let p: AppointmentCreateGroupPayload = parse(entry)?;
                self.domain.create_appointment(&Appointment {
                    id: p.appointment_id.clone(),
                    owner_id: p.owner_id.clone(),
                    group_id: Some(p.group_id.clone()),
                    title: p.title,
                    start_ts: p.start_ts,
                    end_ts: p.end_ts,
                    created_at: entry.timestamp,
                    updated_at: entry.timestamp,
                })?;
                // Expansion (spec §4.2.3): every current group member becomes a
                // participant, status set by the hierarchy rule (rank > owner
                // rank -> pending, otherwise auto); non-owner members each get
                // an invite notification.
                let members = self.domain.group_members_with_rank(&p.group_id)?;
                let owner_rank = members.iter().find(|(id, _)| *id == p.owner_id).map(|(_, rank)| *rank).unwrap_or(0);
                for (member_id, rank) in members {
                    let status = if rank > owner_rank { "pending" } else { "auto" };
                    self.domain.ensure_participant(&Participant {
                        appointment_id: p.appointment_id.clone(),
                        user_id: member_id.clone(),
                        status: status.into(),
                        is_optional: false,
                    })?;
                    if member_id != p.owner_id {
                        // A retried apply of this same entry may have already
                        // created this notification; don't let that collision
                        // abort the loop before later members are ensured.
                        if let Err(e) = self.domain.create_notification(&Notification {
                            id: Uuid::new_v4().to_string(),
                            user_id: member_id,
                            kind: "invite".into(),
                            payload: serde_json::json!({"appointment_id": p.appointment_id, "group_id": p.group_id}),
                            created_at: entry.timestamp,
                        }) {
                            let msg = e.to_string().to_ascii_lowercase();
                            if !msg.contains("unique constraint") && !msg.contains("already exists") {
                                return Err(e);
                            }
                        }
                    }
                }
                Ok(())
            }
            "appointment.update" => {
                let p: AppointmentUpdatePayload = parse(entry)?;
                self.domain.update_appointment(&p.appointment_id, &p.title, p.start_ts, p.end_ts)
            }
            "appointment.delete" => {
                let p: AppointmentDeletePayload = parse(entry)?;
                self.domain.delete_appointment(&p.appointment_id)
            }

            "invitation.accept" => {
                let p: InvitationDecisionPayload = parse(entry)?;
                self.domain.set_participant_status(&p.appointment_id, &p.user_id, "accepted")?;
                self.notify_owner_of_decision(&p.appointment_id, &p.user_id, "invitation_accepted", entry.timestamp)
            }
            "invitation.reject" => {
                let p: InvitationDecisionPayload = parse(entry)?;
                self.domain.set_participant_status(&p.appointment_id, &p.user_id, "rejected")?;
                self.notify_owner_of_decision(&p.appointment_id, &p.user_id, "invitation_rejected", entry.timestamp)
            }

            "repair.user.ensure" => {
                let p: RepairUserEnsurePayload = parse(entry)?;
                self.domain.ensure_user(&User {
                    id: p.user_id,
                    username: p.username,
                    display_name: p.display_name,
                    password_hash: p.password_hash,
                    email: p.email,
                    created_at: entry.timestamp,
                    updated_at: entry.timestamp,
                })
            }
            "repair.user.clear_email_if_matches" => {
                let p: UserClearEmailPayload = parse(entry)?;
                self.domain.clear_user_email_if_matches(&p.user_id, &p.email)
            }
            "repair.group.ensure_member" => {
                let p: RepairGroupEnsureMemberPayload = parse(entry)?;
                self.domain.ensure_group_member(&GroupMember {
                    group_id: p.group_id,
                    user_id: p.user_id,
                    rank: p.rank,
                    added_at: entry.timestamp,
                })
            }
            // Supplemental op (not in the distilled catalog): the group-level
            // analogue of `repair.user.ensure`, used by the groups reconciler
            // when a peer is missing a whole group row, not just a membership
            // edge (see SPEC_FULL.md §4.2.1).
            "repair.group.ensure" => {
                let p: RepairGroupEnsurePayload = parse(entry)?;
                self.domain.ensure_group(&Group {
                    id: p.group_id,
                    name: p.name,
                    creator_id: p.creator_id,
                    group_type: p.group_type,
                    created_at: entry.timestamp,
                    updated_at: entry.timestamp,
                })
            }
            "repair.appointment.ensure_participant" => {
                let p: RepairAppointmentEnsureParticipantPayload = parse(entry)?;
                self.domain.ensure_participant(&Participant {
                    appointment_id: p.appointment_id,
                    user_id: p.user_id,
                    status: p.status,
                    is_optional: p.is_optional,
                })
            }
            "repair.notification.ensure" => {
                let p: RepairNotificationEnsurePayload = parse(entry)?;
                self.domain.ensure_notification(&Notification {
                    id: p.notification_id,
                    user_id: p.user_id,
                    kind: p.kind,
                    payload: p.payload,
                    created_at: entry.timestamp,
                })
            }

            other => Err(Error::from(format!("unknown operation: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{pool_from_dsn, SqliteDomainStore};

    fn applier() -> (Arc<OperationApplier>, Arc<dyn DomainStore>) {
        let domain: Arc<dyn DomainStore> = SqliteDomainStore::new(pool_from_dsn(":memory:").unwrap()).unwrap();
        (OperationApplier::new(domain.clone()), domain)
    }

    fn entry(op: &str, payload: serde_json::Value) -> LogEntry {
        LogEntry {
            term: 1,
            index: 1,
            event_id: uuid::Uuid::new_v4().to_string(),
            aggregate: "test".into(),
            aggregate_id: "1".into(),
            op: op.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn user_create_then_duplicate_is_ignorable() {
        let (applier, _) = applier();
        let e = entry(
            "user.create",
            serde_json::json!({"user_id": "u1", "username": "alice", "display_name": "Alice", "password_hash": "h"}),
        );
        applier.apply(&e).unwrap();
        let dup = entry(
            "user.create",
            serde_json::json!({"user_id": "u2", "username": "alice", "display_name": "Alice 2", "password_hash": "h"}),
        );
        let err = applier.apply(&dup).unwrap_err();
        assert!(is_ignorable_apply_error("user.create", &err.to_string()));
    }

    #[test]
    fn group_create_adds_the_creator_as_owner_ranked_member() {
        let (applier, domain) = applier();
        applier
            .apply(&entry(
                "user.create",
                serde_json::json!({"user_id": "u1", "username": "alice", "display_name": "Alice", "password_hash": "h"}),
            ))
            .unwrap();
        applier
            .apply(&entry(
                "group.create",
                serde_json::json!({"group_id": "g1", "name": "team", "creator_id": "u1", "group_type": "hierarchical"}),
            ))
            .unwrap();

        assert_eq!(domain.group_members_with_rank("g1").unwrap(), vec![("u1".to_string(), 5)]);
    }

    #[test]
    fn group_appointment_expands_to_all_members_by_hierarchy_rule() {
        let (applier, domain) = applier();
        for (id, username) in [("u1", "alice"), ("u2", "bob"), ("u3", "carol")] {
            applier
                .apply(&entry(
                    "user.create",
                    serde_json::json!({"user_id": id, "username": username, "display_name": username, "password_hash": "h"}),
                ))
                .unwrap();
        }
        applier
            .apply(&entry(
                "group.create",
                serde_json::json!({"group_id": "g1", "name": "team", "creator_id": "u1", "group_type": "hierarchical"}),
            ))
            .unwrap();
        // Higher rank than the owner (5) -> pending; lower -> auto.
        applier
            .apply(&entry("group.member_add", serde_json::json!({"group_id": "g1", "user_id": "u2", "rank": 10})))
            .unwrap();
        applier
            .apply(&entry("group.member_add", serde_json::json!({"group_id": "g1", "user_id": "u3", "rank": 3})))
            .unwrap();
        applier
            .apply(&entry(
                "appointment.create_group",
                serde_json::json!({
                    "appointment_id": "a1", "owner_id": "u1", "group_id": "g1", "title": "standup",
                    "start_ts": Utc::now().to_rfc3339(), "end_ts": Utc::now().to_rfc3339()
                }),
            ))
            .unwrap();

        let rows = domain.local_events("participants", 0, 10).unwrap();
        assert_eq!(rows.len(), 3);
        let status_for = |username: &str| {
            rows.iter().find(|r| r.payload["participant_username"] == username).unwrap().payload["status"].as_str().unwrap().to_string()
        };
        assert_eq!(status_for("alice"), "auto");
        assert_eq!(status_for("bob"), "pending");
        assert_eq!(status_for("carol"), "auto");

        let notifications = domain.local_events("notifications", 0, 10).unwrap();
        assert_eq!(notifications.len(), 2, "invite notifications for bob and carol, not the owner");
    }

    #[test]
    fn invitation_accept_notifies_the_appointment_owner() {
        let (applier, domain) = applier();
        for (id, username) in [("u1", "alice"), ("u2", "bob")] {
            applier
                .apply(&entry(
                    "user.create",
                    serde_json::json!({"user_id": id, "username": username, "display_name": username, "password_hash": "h"}),
                ))
                .unwrap();
        }
        applier
            .apply(&entry(
                "group.create",
                serde_json::json!({"group_id": "g1", "name": "team", "creator_id": "u1", "group_type": "hierarchical"}),
            ))
            .unwrap();
        applier
            .apply(&entry("group.member_add", serde_json::json!({"group_id": "g1", "user_id": "u2", "rank": 10})))
            .unwrap();
        applier
            .apply(&entry(
                "appointment.create_group",
                serde_json::json!({
                    "appointment_id": "a1", "owner_id": "u1", "group_id": "g1", "title": "standup",
                    "start_ts": Utc::now().to_rfc3339(), "end_ts": Utc::now().to_rfc3339()
                }),
            ))
            .unwrap();

        applier.apply(&entry("invitation.accept", serde_json::json!({"appointment_id": "a1", "user_id": "u2"}))).unwrap();

        let notifications = domain.local_events("notifications", 0, 10).unwrap();
        assert!(notifications.iter().any(|n| n.payload["kind"] == "invitation_accepted" && n.payload["username"] == "alice"));
    }

    #[test]
    fn unknown_operation_is_apply_fatal() {
        let (applier, _) = applier();
        let err = applier.apply(&entry("totally.unknown", serde_json::Value::Null)).unwrap_err();
        assert!(!is_ignorable_apply_error("totally.unknown", &err.to_string()));
    }
}
