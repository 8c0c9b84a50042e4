//! Crate-wide error type, in the `error_chain` style used by the original
//! raft package (`pkg/raft/src/lib.rs`).
//!
//! The taxonomy in `ErrorKind` mirrors spec §7: transient network errors are
//! never represented here (callers retry them inline and never propagate
//! them as an `Err` out of the engine); everything that *does* cross a
//! module boundary as an error gets one variant below.

error_chain! {
    foreign_links {
        Io(std::io::Error);
        Sqlite(rusqlite::Error);
        SqlitePool(r2d2::Error);
        Json(serde_json::Error);
        Http(reqwest::Error);
    }

    errors {
        /// The local node is not the leader; `leader_hint` is the best known
        /// guess so callers can redirect (spec §4.6).
        NotLeader(leader_hint: Option<String>) {
            description("not leader")
            display("not leader (hint: {:?})", leader_hint)
        }

        /// A previous commit is stuck behind an apply-fatal error (spec I7 /
        /// §4.1.4 case 4). Propose must keep failing until it is resolved.
        ApplyError(index: u64) {
            description("apply error blocks further commits")
            display("apply error at or before index {}", index)
        }

        /// Leadership was lost while a Propose call was waiting for its
        /// entry to apply (spec §4.1.5 step 4).
        LeadershipLost {
            description("leadership lost while waiting for proposal to apply")
        }

        /// The engine could not replicate to a majority of the active peer
        /// set within the Propose deadline.
        NoMajority {
            description("failed to reach a majority of the active peer set")
        }

        /// A non-ignorable applier failure (spec §4.2.4 "anything else").
        ApplyFatal(detail: String) {
            description("applier returned a non-ignorable error")
            display("apply-fatal: {}", detail)
        }

        /// HMAC verification failed or was missing on an inbound cluster RPC.
        BadSignature {
            description("missing or invalid cluster RPC signature")
        }

        /// A required piece of configuration was absent at boot (spec §6).
        MissingConfig(name: String) {
            description("missing required configuration")
            display("missing required configuration: {}", name)
        }
    }
}

/// Classifies an applier failure per spec §4.2.4. `true` means "treat as
/// success, mark the EventID applied, advance `last_applied`". `op` is the
/// log entry's operation name; "member not found" is only ignorable on
/// `group.member_remove` (spec §4.2.4), since every other op's "member not
/// found" means its actual target row is missing and must halt the apply
/// loop (I7).
pub fn is_ignorable_apply_error(op: &str, message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    if lower.contains("unique constraint") || lower.contains("already exists") || lower.contains("apply conflict") {
        return true;
    }
    op == "group.member_remove" && lower.contains("member not found")
}
