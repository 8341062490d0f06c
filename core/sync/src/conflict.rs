//! Conflict resolution.
//!
//! Invoked when the server rejects an update because its version moved on.
//! A [`ConflictPolicy`] decides whether the server or the local edit wins;
//! every decision is written to a persistent audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use outbox_common::{EntityType, Error, LocalId, Payload, Result};
use outbox_remote::RemoteEntity;
use outbox_storage::{KvStore, Namespace};

use crate::queue::OpKind;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Newer of server update time and local mutation time wins.
    #[default]
    LastWriteWins,
    /// Never resolve automatically; fail the op for the user to handle.
    AlwaysSurface,
}

impl ConflictStrategy {
    /// Policy implementing the strategy.
    pub fn policy(self) -> Arc<dyn ConflictPolicy> {
        match self {
            ConflictStrategy::LastWriteWins => Arc::new(LastWriteWins),
            ConflictStrategy::AlwaysSurface => Arc::new(AlwaysSurface),
        }
    }
}

/// What the policy sees about a conflict.
#[derive(Debug, Clone)]
pub struct ConflictContext<'a> {
    pub local_id: &'a LocalId,
    pub entity_type: EntityType,
    pub op_kind: OpKind,
    pub local_payload: &'a Payload,
    pub local_version: u64,
    /// Origin time of the local mutation carried by the op.
    pub local_mutated_at: DateTime<Utc>,
    /// The op was already sent as a forced overwrite.
    pub already_forced: bool,
    /// Current server state.
    pub server: &'a RemoteEntity,
}

/// Outcome of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictDecision {
    /// Discard the local op and adopt the server state.
    KeepRemote,
    /// Resend the local state as a forced overwrite.
    ForceLocal,
    /// Fail the op and leave the record dirty for the user.
    Surface,
}

/// Pluggable conflict policy.
///
/// Implementations must be deterministic: the same context always yields
/// the same decision.
pub trait ConflictPolicy: Send + Sync {
    /// Policy name, recorded in the audit trail.
    fn name(&self) -> &str;

    /// Decide a conflict.
    fn resolve(&self, ctx: &ConflictContext<'_>) -> ConflictDecision;
}

/// Whole-record last-write-wins by server-confirmed update time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictPolicy for LastWriteWins {
    fn name(&self) -> &str {
        "last-write-wins"
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> ConflictDecision {
        if ctx.server.updated_at > ctx.local_mutated_at {
            ConflictDecision::KeepRemote
        } else if ctx.already_forced {
            // Lost a second race even with the check bypassed.
            ConflictDecision::Surface
        } else {
            ConflictDecision::ForceLocal
        }
    }
}

/// Leave every conflict to the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSurface;

impl ConflictPolicy for AlwaysSurface {
    fn name(&self) -> &str {
        "always-surface"
    }

    fn resolve(&self, _ctx: &ConflictContext<'_>) -> ConflictDecision {
        ConflictDecision::Surface
    }
}

/// One resolved conflict, as shown to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictAuditEntry {
    pub seq: u64,
    pub local_id: LocalId,
    pub entity_type: EntityType,
    pub op_kind: OpKind,
    pub local_version: u64,
    pub local_mutated_at: DateTime<Utc>,
    pub server_version: u64,
    pub server_updated_at: DateTime<Utc>,
    pub decision: ConflictDecision,
    pub policy: String,
    pub detected_at: DateTime<Utc>,
}

impl ConflictAuditEntry {
    /// Build an entry from a resolved context.
    pub fn new(
        ctx: &ConflictContext<'_>,
        decision: ConflictDecision,
        policy: &str,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            local_id: ctx.local_id.clone(),
            entity_type: ctx.entity_type,
            op_kind: ctx.op_kind,
            local_version: ctx.local_version,
            local_mutated_at: ctx.local_mutated_at,
            server_version: ctx.server.version,
            server_updated_at: ctx.server.updated_at,
            decision,
            policy: policy.to_string(),
            detected_at,
        }
    }
}

/// Persistent conflict audit trail.
pub struct ConflictAudit {
    kv: Arc<dyn KvStore>,
    entries: Vec<ConflictAuditEntry>,
}

impl ConflictAudit {
    /// Load the trail from the store.
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let mut entries = Vec::new();
        for (key, bytes) in kv.scan(Namespace::Conflicts).await? {
            let entry: ConflictAuditEntry = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("conflict {}: {}", key, e)))?;
            entries.push(entry);
        }
        Ok(Self { kv, entries })
    }

    /// Append an entry, assigning its sequence number.
    pub async fn record(&mut self, mut entry: ConflictAuditEntry) -> Result<()> {
        entry.seq = self.entries.last().map(|e| e.seq + 1).unwrap_or(1);
        let key = format!("{:020}", entry.seq);
        self.kv
            .put(Namespace::Conflicts, &key, serde_json::to_vec(&entry)?)
            .await?;
        self.entries.push(entry);
        Ok(())
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[ConflictAuditEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use outbox_common::ServerId;
    use outbox_storage::MemoryKv;
    use proptest::prelude::*;
    use serde_json::json;

    fn server(updated_at: DateTime<Utc>) -> RemoteEntity {
        RemoteEntity {
            server_id: ServerId::new("srv-1"),
            payload: json!({"name": "server"}),
            version: 5,
            updated_at,
        }
    }

    fn ctx<'a>(
        id: &'a LocalId,
        payload: &'a Payload,
        server: &'a RemoteEntity,
        local_mutated_at: DateTime<Utc>,
        already_forced: bool,
    ) -> ConflictContext<'a> {
        ConflictContext {
            local_id: id,
            entity_type: EntityType::Project,
            op_kind: OpKind::Update,
            local_payload: payload,
            local_version: 3,
            local_mutated_at,
            already_forced,
            server,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_newer_server_wins() {
        let id = LocalId::new("p1").unwrap();
        let payload = json!({});
        let remote = server(at(12));
        let decision = LastWriteWins.resolve(&ctx(&id, &payload, &remote, at(10), false));
        assert_eq!(decision, ConflictDecision::KeepRemote);
    }

    #[test]
    fn test_newer_local_forces_once() {
        let id = LocalId::new("p1").unwrap();
        let payload = json!({});
        let remote = server(at(10));
        assert_eq!(
            LastWriteWins.resolve(&ctx(&id, &payload, &remote, at(12), false)),
            ConflictDecision::ForceLocal
        );
        assert_eq!(
            LastWriteWins.resolve(&ctx(&id, &payload, &remote, at(12), true)),
            ConflictDecision::Surface
        );
    }

    #[test]
    fn test_tie_goes_to_local() {
        let id = LocalId::new("p1").unwrap();
        let payload = json!({});
        let remote = server(at(10));
        assert_eq!(
            LastWriteWins.resolve(&ctx(&id, &payload, &remote, at(10), false)),
            ConflictDecision::ForceLocal
        );
    }

    #[test]
    fn test_always_surface() {
        let id = LocalId::new("p1").unwrap();
        let payload = json!({});
        let remote = server(at(12));
        let policy = ConflictStrategy::AlwaysSurface.policy();
        assert_eq!(policy.name(), "always-surface");
        assert_eq!(
            policy.resolve(&ctx(&id, &payload, &remote, at(10), false)),
            ConflictDecision::Surface
        );
    }

    proptest! {
        #[test]
        fn prop_resolution_is_deterministic(
            local_offset in -10_000i64..10_000,
            server_offset in -10_000i64..10_000,
            forced in any::<bool>(),
        ) {
            let id = LocalId::new("p1").unwrap();
            let payload = json!({});
            let base = at(0);
            let remote = server(base + TimeDelta::seconds(server_offset));
            let local_at = base + TimeDelta::seconds(local_offset);

            let first = LastWriteWins.resolve(&ctx(&id, &payload, &remote, local_at, forced));
            let second = LastWriteWins.resolve(&ctx(&id, &payload, &remote, local_at, forced));
            prop_assert_eq!(first, second);
            if server_offset > local_offset {
                prop_assert_eq!(first, ConflictDecision::KeepRemote);
            }
        }
    }

    #[tokio::test]
    async fn test_audit_persists() {
        let kv = MemoryKv::new();
        let mut audit = ConflictAudit::load(Arc::new(kv.clone())).await.unwrap();

        let id = LocalId::new("p1").unwrap();
        let payload = json!({});
        let remote = server(at(12));
        let context = ctx(&id, &payload, &remote, at(10), false);
        for _ in 0..2 {
            let entry = ConflictAuditEntry::new(
                &context,
                ConflictDecision::KeepRemote,
                LastWriteWins.name(),
                at(13),
            );
            audit.record(entry).await.unwrap();
        }

        let reloaded = ConflictAudit::load(Arc::new(kv)).await.unwrap();
        assert_eq!(reloaded.entries().len(), 2);
        assert_eq!(reloaded.entries()[1].seq, 2);
        assert_eq!(reloaded.entries()[0].server_version, 5);
    }
}
