//! Durable mutation queue.
//!
//! Ordered log of pending create/update/delete intents. Each op is stored
//! under its zero-padded op id so a scan returns them in creation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use outbox_common::{EntityType, Error, LocalId, OpId, Payload, Result};
use outbox_remote::IdempotencyKey;
use outbox_storage::{KvStore, Namespace};

use crate::coalesce::OpState;

const NEXT_OP_ID_KEY: &str = "next_op_id";
const INSTALLATION_ID_KEY: &str = "installation_id";

/// Kind of queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle state of a queued op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpStatus {
    /// Waiting for dispatch (possibly until `next_retry_at`).
    Pending,
    /// A request is on the wire.
    InFlight,
    /// Gave up; needs a new edit or an explicit retry.
    Failed,
    /// Confirmed by the server. Purged right after.
    Done,
}

/// One queued local intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOp {
    pub op_id: OpId,
    pub local_id: LocalId,
    pub entity_type: EntityType,
    pub kind: OpKind,
    /// Full desired state when the op was last written.
    pub payload_snapshot: Payload,
    /// Record version the snapshot corresponds to.
    pub record_version: u64,
    /// Referenced records that had no server id when the op was written.
    pub depends_on: BTreeSet<LocalId>,
    pub status: OpStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Origin time of the latest local mutation folded into this op.
    pub mutated_at: DateTime<Utc>,
    /// A request for this op may have been applied by the server.
    #[serde(default)]
    pub maybe_applied: bool,
    /// Next dispatch bypasses the optimistic version check.
    #[serde(default)]
    pub force: bool,
}

impl MutationOp {
    /// Whether the op still needs work.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            OpStatus::Pending | OpStatus::InFlight | OpStatus::Failed
        )
    }

    /// Coalescing view of the op.
    pub fn state(&self) -> OpState {
        OpState {
            kind: self.kind,
            status: self.status,
            maybe_applied: self.maybe_applied,
        }
    }

    /// Ready for dispatch at `now`, ignoring dependencies.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OpStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Fold a new local mutation into this op.
    ///
    /// Resets failure bookkeeping: the new payload has never been tried.
    pub fn replace(
        &mut self,
        kind: OpKind,
        payload: Payload,
        record_version: u64,
        depends_on: BTreeSet<LocalId>,
        now: DateTime<Utc>,
    ) {
        self.kind = kind;
        self.payload_snapshot = payload;
        self.record_version = record_version;
        self.depends_on = depends_on;
        self.mutated_at = now;
        self.status = OpStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.next_retry_at = None;
        self.force = false;
    }

    /// Mark the op as permanently failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = OpStatus::Failed;
        self.last_error = Some(error.into());
        self.next_retry_at = None;
    }
}

/// Parameters for a new op.
pub struct NewOp {
    pub local_id: LocalId,
    pub entity_type: EntityType,
    pub kind: OpKind,
    pub payload: Payload,
    pub record_version: u64,
    pub depends_on: BTreeSet<LocalId>,
}

/// Durable, ordered queue of mutation ops.
pub struct MutationQueue {
    kv: Arc<dyn KvStore>,
    ops: BTreeMap<OpId, MutationOp>,
    next_op_id: OpId,
    installation_id: String,
}

impl MutationQueue {
    /// Load the queue and its counters.
    ///
    /// A fresh store gets a new installation id, used to derive idempotency
    /// keys that stay unique across reinstalls.
    ///
    /// # Errors
    /// - Storage failure
    /// - Corrupt op entry
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let mut ops = BTreeMap::new();
        for (key, bytes) in kv.scan(Namespace::Ops).await? {
            let op: MutationOp = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("op {}: {}", key, e)))?;
            ops.insert(op.op_id, op);
        }

        let stored_next = match kv.get(Namespace::Meta, NEXT_OP_ID_KEY).await? {
            Some(bytes) => serde_json::from_slice::<u64>(&bytes)?,
            None => 1,
        };
        // The counter write may have been lost; never reuse an op id.
        let after_last = ops.keys().next_back().map(|id| id.0 + 1).unwrap_or(1);
        let next_op_id = OpId(stored_next.max(after_last));

        let installation_id = match kv.get(Namespace::Meta, INSTALLATION_ID_KEY).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|e| Error::Serialization(format!("installation id: {}", e)))?,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                kv.put(Namespace::Meta, INSTALLATION_ID_KEY, id.clone().into_bytes())
                    .await?;
                info!("New installation {}", id);
                id
            }
        };

        debug!("Loaded {} queued ops, next {}", ops.len(), next_op_id);
        Ok(Self {
            kv,
            ops,
            next_op_id,
            installation_id,
        })
    }

    /// Identifier of this device's store.
    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    /// Idempotency key for a dispatch of `op`.
    pub fn idempotency_key(&self, op: &MutationOp) -> IdempotencyKey {
        let key = IdempotencyKey::for_op(&self.installation_id, op.op_id);
        if op.force {
            key.forced()
        } else {
            key
        }
    }

    /// Append a new op with a fresh id.
    ///
    /// The counter is persisted before the op so an id is never handed out
    /// twice, even across a crash.
    pub async fn push(&mut self, new: NewOp, now: DateTime<Utc>) -> Result<OpId> {
        let op_id = self.next_op_id;
        let next = op_id.next();
        self.kv
            .put(Namespace::Meta, NEXT_OP_ID_KEY, serde_json::to_vec(&next.0)?)
            .await?;
        self.next_op_id = next;

        let op = MutationOp {
            op_id,
            local_id: new.local_id,
            entity_type: new.entity_type,
            kind: new.kind,
            payload_snapshot: new.payload,
            record_version: new.record_version,
            depends_on: new.depends_on,
            status: OpStatus::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            mutated_at: now,
            maybe_applied: false,
            force: false,
        };
        self.save(op).await?;
        Ok(op_id)
    }

    /// Persist a modified op.
    pub async fn save(&mut self, op: MutationOp) -> Result<()> {
        let bytes = serde_json::to_vec(&op)?;
        self.kv
            .put(Namespace::Ops, &op.op_id.storage_key(), bytes)
            .await?;
        self.ops.insert(op.op_id, op);
        Ok(())
    }

    /// Remove an op.
    pub async fn remove(&mut self, op_id: OpId) -> Result<Option<MutationOp>> {
        self.kv.delete(Namespace::Ops, &op_id.storage_key()).await?;
        Ok(self.ops.remove(&op_id))
    }

    /// Get an op.
    pub fn get(&self, op_id: OpId) -> Option<&MutationOp> {
        self.ops.get(&op_id)
    }

    /// Ops queued for a record, oldest first.
    pub fn ops_for(&self, local_id: &LocalId) -> Vec<&MutationOp> {
        self.ops
            .values()
            .filter(|op| op.local_id == *local_id)
            .collect()
    }

    /// The op currently representing a record's pending intent.
    pub fn active(&self, local_id: &LocalId) -> Option<&MutationOp> {
        self.ops.values().find(|op| op.local_id == *local_id)
    }

    /// The op buffered behind a dispatched active op.
    pub fn successor(&self, local_id: &LocalId) -> Option<&MutationOp> {
        self.ops
            .values()
            .filter(|op| op.local_id == *local_id)
            .nth(1)
    }

    /// Active ops, one per record, in op id order.
    pub fn active_ops(&self) -> Vec<&MutationOp> {
        let mut seen = BTreeSet::new();
        self.ops
            .values()
            .filter(|op| seen.insert(op.local_id.clone()))
            .collect()
    }

    /// All ops in op id order.
    pub fn iter(&self) -> impl Iterator<Item = &MutationOp> {
        self.ops.values()
    }

    /// Number of queued ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Revert in-flight ops to pending after an abandoned pass.
    ///
    /// The in-memory state is always reverted; persisting is best effort
    /// since reopening reverts in-flight ops anyway. Returns the first
    /// storage error.
    pub async fn release_in_flight(&mut self, op_ids: &[OpId]) -> Result<()> {
        let mut first_error = None;
        for op_id in op_ids {
            let Some(op) = self.ops.get_mut(op_id) else {
                continue;
            };
            if op.status != OpStatus::InFlight {
                continue;
            }
            op.status = OpStatus::Pending;
            op.maybe_applied = true;

            let op = op.clone();
            let persisted = match serde_json::to_vec(&op) {
                Ok(bytes) => {
                    self.kv
                        .put(Namespace::Ops, &op.op_id.storage_key(), bytes)
                        .await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = persisted {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
