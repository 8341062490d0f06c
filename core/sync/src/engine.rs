//! Public sync engine.
//!
//! [`SyncEngine`] is the single serialized entry point the application
//! talks to. Local mutations, sync passes and queries all go through one
//! state lock, so coalescing never races a running pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outbox_common::{EntityType, Error, LocalId, Payload, ReferenceSchema, Result};
use outbox_remote::RemoteApi;
use outbox_storage::KvStore;

use crate::clock::{Clock, SystemClock};
use crate::coalesce::{coalesce, Slot, Transition};
use crate::conflict::{ConflictAudit, ConflictAuditEntry, ConflictPolicy, ConflictStrategy};
use crate::coordinator::{self, SyncReport};
use crate::events::{EventBus, SyncEvent};
use crate::queue::{MutationOp, MutationQueue, NewOp, OpKind, OpStatus};
use crate::record::{LocalRecord, RecordStore};
use crate::resolver;
use crate::retry::RetryConfig;
use crate::scheduler::{self, SchedulerHandle, SyncMode};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Requests kept on the wire at once.
    pub max_concurrency: usize,
    /// Per-request timeout. A timeout counts as a transient failure.
    pub request_timeout: Duration,
    /// Backoff for transient failures.
    pub retry: RetryConfig,
    /// Conflict resolution strategy.
    pub conflict_strategy: ConflictStrategy,
    /// When the background scheduler starts passes.
    pub sync_mode: SyncMode,
}

impl SyncConfig {
    /// Set the concurrency limit.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Set the scheduler mode.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            conflict_strategy: ConflictStrategy::default(),
            sync_mode: SyncMode::Manual,
        }
    }
}

/// Sync state of one record, for UI badges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub local_id: LocalId,
    pub dirty: bool,
    pub deleted: bool,
    pub server_id: Option<outbox_common::ServerId>,
    /// Final queued intent, if any.
    pub pending_op_kind: Option<OpKind>,
    /// Status of the op the coordinator works on next.
    pub op_status: Option<OpStatus>,
    pub last_error: Option<String>,
    pub queued_ops: usize,
}

/// Result of [`SyncEngine::pull`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    /// Server entities new to this device.
    pub inserted: usize,
    /// Clean local records refreshed to the server state.
    pub refreshed: usize,
    /// Records with local edits, left for the push path.
    pub skipped_dirty: usize,
}

/// State guarded by the engine lock.
pub(crate) struct EngineState {
    pub(crate) store: RecordStore,
    pub(crate) queue: MutationQueue,
    pub(crate) audit: ConflictAudit,
}

pub(crate) struct EngineInner {
    pub(crate) state: tokio::sync::Mutex<EngineState>,
    pub(crate) remote: Arc<dyn RemoteApi>,
    pub(crate) config: SyncConfig,
    pub(crate) schema: ReferenceSchema,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: Arc<dyn ConflictPolicy>,
    pub(crate) events: EventBus,
    pub(crate) connectivity: watch::Receiver<bool>,
    /// Serializes sync passes.
    pub(crate) pass_lock: tokio::sync::Mutex<()>,
    /// Signalled on every local mutation.
    pub(crate) changed: Notify,
    health: Mutex<Option<String>>,
    current_pass: Mutex<Option<CancellationToken>>,
    pub(crate) shutdown: CancellationToken,
}

impl EngineInner {
    pub(crate) fn set_health(&self, health: Option<String>) {
        *self.health.lock().unwrap_or_else(|p| p.into_inner()) = health;
    }

    /// Token of the running pass, replaced when a pass starts or ends.
    pub(crate) fn current_pass(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.current_pass.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    kv: Arc<dyn KvStore>,
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    schema: ReferenceSchema,
    policy: Option<Arc<dyn ConflictPolicy>>,
    connectivity: Option<watch::Receiver<bool>>,
}

impl SyncEngineBuilder {
    /// Set the configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the foreign-key schema.
    pub fn schema(mut self, schema: ReferenceSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Use a custom conflict policy instead of the configured strategy.
    pub fn policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the connectivity signal. Without one the engine assumes it is
    /// always online.
    pub fn connectivity(mut self, connectivity: watch::Receiver<bool>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Load durable state, recover from any interrupted pass and start the
    /// engine.
    ///
    /// # Errors
    /// - Storage failure or corrupt entries
    pub async fn open(self) -> Result<SyncEngine> {
        let mut store = RecordStore::load(self.kv.clone()).await?;
        let mut queue = MutationQueue::load(self.kv.clone()).await?;
        let audit = ConflictAudit::load(self.kv.clone()).await?;

        let now = self.clock.now();
        let repaired = recover(&mut store, &mut queue, &self.schema, now).await?;
        info!(
            "Sync engine opened: {} records, {} queued ops, {} repaired ({} store, {} remote)",
            store.len(),
            queue.len(),
            repaired,
            self.kv.name(),
            self.remote.name()
        );

        let connectivity = self.connectivity.unwrap_or_else(|| watch::channel(true).1);
        let policy = self
            .policy
            .unwrap_or_else(|| self.config.conflict_strategy.policy());

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                state: tokio::sync::Mutex::new(EngineState {
                    store,
                    queue,
                    audit,
                }),
                remote: self.remote,
                config: self.config,
                schema: self.schema,
                clock: self.clock,
                policy,
                events: EventBus::new(),
                connectivity,
                pass_lock: tokio::sync::Mutex::new(()),
                changed: Notify::new(),
                health: Mutex::new(None),
                current_pass: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

/// Offline-first sync engine.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Start building an engine over a store and a remote API.
    pub fn builder(kv: Arc<dyn KvStore>, remote: Arc<dyn RemoteApi>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            kv,
            remote,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            schema: ReferenceSchema::default(),
            policy: None,
            connectivity: None,
        }
    }

    /// Open an engine with the system clock and the default schema.
    pub async fn open(
        kv: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteApi>,
        config: SyncConfig,
        connectivity: watch::Receiver<bool>,
    ) -> Result<Self> {
        Self::builder(kv, remote)
            .config(config)
            .connectivity(connectivity)
            .open()
            .await
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Apply a local mutation optimistically and queue it for sync.
    ///
    /// `local_id` may be omitted for a create, in which case a fresh id is
    /// generated. The record is written before the queue so a crash between
    /// the two is repaired on the next open.
    ///
    /// # Errors
    /// - `InvalidInput` for a create of an existing id, a non-object
    ///   payload, a missing id or a type mismatch
    /// - `NotFound` if an update or delete names an unknown record
    /// - `StaleRecord` if the record has a queued delete
    /// - Storage failure
    pub async fn apply_local_mutation(
        &self,
        entity_type: EntityType,
        local_id: Option<LocalId>,
        kind: OpKind,
        payload: Payload,
    ) -> Result<LocalId> {
        if kind != OpKind::Delete && !payload.is_object() {
            return Err(Error::InvalidInput(format!(
                "{} payload must be a JSON object",
                entity_type
            )));
        }

        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        let EngineState { store, queue, .. } = &mut *state;

        let local_id = match (kind, local_id) {
            (OpKind::Create, Some(id)) if store.get(&id).is_some() => {
                return Err(Error::InvalidInput(format!("{} already exists", id)));
            }
            (OpKind::Create, Some(id)) => id,
            (OpKind::Create, None) => LocalId::generate(),
            (_, None) => {
                return Err(Error::InvalidInput(format!(
                    "{:?} requires a local id",
                    kind
                )));
            }
            (_, Some(id)) => id,
        };

        let existing = store.get(&local_id).cloned();
        if let Some(record) = &existing {
            if record.entity_type != entity_type {
                return Err(Error::InvalidInput(format!(
                    "{} is a {}, not a {}",
                    local_id, record.entity_type, entity_type
                )));
            }
            if record.deleted {
                return Err(Error::StaleRecord(local_id.to_string()));
            }
        } else if kind != OpKind::Create {
            return Err(Error::NotFound(format!("record {}", local_id)));
        }

        let active = queue.active(&local_id).map(MutationOp::state);
        let successor = queue.successor(&local_id).map(MutationOp::state);
        let (slot, transition) = coalesce(active, successor, kind);
        let target = match slot {
            Slot::Active => queue.active(&local_id),
            Slot::Successor => queue.successor(&local_id),
        }
        .map(|op| op.op_id);

        let record = match existing {
            None => LocalRecord::new_local(local_id.clone(), entity_type, payload, now),
            Some(mut record) => {
                if kind == OpKind::Delete {
                    record.apply_delete(now);
                } else {
                    record.apply_update(payload, now);
                }
                record
            }
        };
        let depends_on = match kind {
            OpKind::Delete => BTreeSet::new(),
            _ => resolver::dependencies(&self.inner.schema, store, entity_type, &record.payload),
        };
        if depends_on.contains(&local_id) {
            return Err(Error::IntegrityViolation(format!("{} references itself", local_id)));
        }

        match (transition, target) {
            (Transition::Stale, _) => return Err(Error::StaleRecord(local_id.to_string())),
            (Transition::Invalid, _) => {
                return Err(Error::InvalidInput(format!(
                    "cannot {:?} {}",
                    kind, local_id
                )));
            }
            (Transition::Cancel, Some(op_id)) => {
                // Never reached the server: forget it entirely.
                store.purge(&local_id).await?;
                queue.remove(op_id).await?;
                debug!("Cancelled unsent create of {}", local_id);
            }
            (Transition::Replace(new_kind), Some(op_id)) => {
                let Some(mut op) = queue.get(op_id).cloned() else {
                    return Err(Error::NotFound(format!("{}", op_id)));
                };
                let snapshot = record.payload.clone();
                let version = record.version;
                store.put(record).await?;
                op.replace(new_kind, snapshot, version, depends_on, now);
                queue.save(op).await?;
                debug!("Coalesced {:?} of {} into {}", kind, local_id, op_id);
            }
            (Transition::Append, _) => {
                let new = NewOp {
                    local_id: local_id.clone(),
                    entity_type,
                    kind,
                    payload: record.payload.clone(),
                    record_version: record.version,
                    depends_on,
                };
                store.put(record).await?;
                let op_id = queue.push(new, now).await?;
                debug!("Queued {} {:?} for {}", op_id, kind, local_id);
            }
            (Transition::Cancel | Transition::Replace(_), None) => {
                return Err(Error::NotFound(format!("queued op for {}", local_id)));
            }
        }

        drop(state);
        self.inner.changed.notify_one();
        Ok(local_id)
    }

    /// Sync state of a record.
    ///
    /// # Errors
    /// - `NotFound` if the record is unknown
    pub async fn get_sync_status(&self, local_id: &LocalId) -> Result<SyncStatus> {
        let state = self.inner.state.lock().await;
        let record = state
            .store
            .get(local_id)
            .ok_or_else(|| Error::NotFound(format!("record {}", local_id)))?;
        let ops = state.queue.ops_for(local_id);
        let active = ops.first();

        Ok(SyncStatus {
            local_id: local_id.clone(),
            dirty: record.dirty,
            deleted: record.deleted,
            server_id: record.server_id.clone(),
            pending_op_kind: ops.last().map(|op| op.kind),
            op_status: active.map(|op| op.status),
            last_error: active.and_then(|op| op.last_error.clone()),
            queued_ops: ops.len(),
        })
    }

    /// Register a callback for sync events.
    pub fn on_sync_event<F>(&self, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_listener(Arc::new(listener));
    }

    /// Receive sync events on a channel.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Run a sync pass now.
    ///
    /// # Errors
    /// - `Offline` without connectivity
    /// - Storage failure (also reported through [`SyncEngine::health`])
    pub async fn force_sync_now(&self) -> Result<SyncReport> {
        self.sync_with(self.inner.shutdown.child_token()).await
    }

    pub(crate) async fn sync_with(&self, cancel: CancellationToken) -> Result<SyncReport> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        coordinator::run_pass(&self.inner, &cancel).await
    }

    /// Cancel the running pass, if any. In-flight ops revert to pending.
    pub fn cancel_pass(&self) {
        if let Some(token) = self.inner.current_pass().take() {
            token.cancel();
        }
    }

    /// Cancel any running pass and refuse new ones.
    pub fn shutdown(&self) {
        info!("Sync engine shutting down");
        self.inner.shutdown.cancel();
    }

    /// Start the background scheduler for the configured mode.
    pub fn spawn_scheduler(&self) -> SchedulerHandle {
        scheduler::spawn(self.clone())
    }

    /// Fetch every entity of a type from the server.
    ///
    /// Unknown entities become clean local records; known clean records are
    /// refreshed. Records with local edits are left alone. Parents should be
    /// pulled before their children so references map back to local ids.
    ///
    /// # Errors
    /// - `Offline` without connectivity
    /// - Remote or storage failure
    pub async fn pull(&self, entity_type: EntityType) -> Result<PullReport> {
        if !self.is_online() {
            return Err(Error::Offline);
        }
        let entities = self
            .inner
            .remote
            .list_entities(entity_type)
            .await
            .map_err(Error::from)?;

        let mut report = PullReport::default();
        let mut state = self.inner.state.lock().await;
        let EngineState { store, queue, .. } = &mut *state;

        for entity in entities {
            let payload =
                resolver::incoming_payload(&self.inner.schema, store, entity_type, &entity.payload)?;
            match store.find_by_server_id(&entity.server_id).cloned() {
                Some(record) => {
                    if record.dirty || queue.active(&record.local_id).is_some() {
                        report.skipped_dirty += 1;
                    } else if record.remote_version != Some(entity.version) {
                        store
                            .overwrite_from_remote(
                                &record.local_id,
                                payload,
                                entity.version,
                                entity.updated_at,
                            )
                            .await?;
                        report.refreshed += 1;
                    }
                }
                None => {
                    let record = LocalRecord::new_synced(
                        LocalId::generate(),
                        entity_type,
                        entity.server_id,
                        payload,
                        entity.version,
                        entity.updated_at,
                    );
                    store.put(record).await?;
                    report.inserted += 1;
                }
            }
        }

        info!(
            "Pulled {}: {} new, {} refreshed, {} skipped",
            entity_type, report.inserted, report.refreshed, report.skipped_dirty
        );
        Ok(report)
    }

    /// Put a permanently failed op back in line.
    ///
    /// # Errors
    /// - `NotFound` if the record has no failed op
    pub async fn retry_failed(&self, local_id: &LocalId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let Some(mut op) = state
            .queue
            .active(local_id)
            .filter(|op| op.status == OpStatus::Failed)
            .cloned()
        else {
            return Err(Error::NotFound(format!("failed op for {}", local_id)));
        };

        op.status = OpStatus::Pending;
        op.attempts = 0;
        op.last_error = None;
        op.next_retry_at = None;
        info!("Retrying {} for {}", op.op_id, local_id);
        state.queue.save(op).await?;

        drop(state);
        self.inner.changed.notify_one();
        Ok(())
    }

    /// Every queued op, oldest first.
    pub async fn pending_ops(&self) -> Vec<MutationOp> {
        self.inner.state.lock().await.queue.iter().cloned().collect()
    }

    /// Current local state of a record, tombstones included.
    pub async fn get_record(&self, local_id: &LocalId) -> Option<LocalRecord> {
        self.inner.state.lock().await.store.get(local_id).cloned()
    }

    /// Live records of a type matching `predicate`.
    pub async fn query<F>(&self, entity_type: EntityType, predicate: F) -> Vec<LocalRecord>
    where
        F: Fn(&LocalRecord) -> bool,
    {
        self.inner.state.lock().await.store.query(entity_type, predicate)
    }

    /// Every conflict resolved so far, oldest first.
    pub async fn conflict_audit(&self) -> Vec<ConflictAuditEntry> {
        self.inner.state.lock().await.audit.entries().to_vec()
    }

    /// Last global sync-health error, cleared by the next successful pass.
    pub fn health(&self) -> Option<String> {
        self.inner
            .health
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether the connectivity signal reports online.
    pub fn is_online(&self) -> bool {
        *self.inner.connectivity.borrow()
    }

    /// Identifier of this device's store.
    pub async fn installation_id(&self) -> String {
        self.inner.state.lock().await.queue.installation_id().to_string()
    }

    /// Time until the earliest scheduled retry, if one lies in the future.
    pub(crate) async fn next_retry_delay(&self) -> Option<Duration> {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock().await;
        state
            .queue
            .active_ops()
            .into_iter()
            .filter(|op| op.status == OpStatus::Pending)
            .filter_map(|op| op.next_retry_at)
            .filter(|at| *at > now)
            .min()
            .and_then(|at| (at - now).to_std().ok())
    }
}

/// Bring the queue back in line with the record store after a restart.
///
/// Returns the number of repairs made.
async fn recover(
    store: &mut RecordStore,
    queue: &mut MutationQueue,
    schema: &ReferenceSchema,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut repaired = 0;

    // Ops whose record is gone, and requests interrupted mid-flight.
    let ops: Vec<MutationOp> = queue.iter().cloned().collect();
    for mut op in ops {
        if store.get(&op.local_id).is_none() {
            warn!("Dropping {} for missing record {}", op.op_id, op.local_id);
            queue.remove(op.op_id).await?;
            repaired += 1;
        } else if op.status == OpStatus::InFlight {
            info!("{} for {} was in flight; will resend", op.op_id, op.local_id);
            op.status = OpStatus::Pending;
            op.maybe_applied = true;
            queue.save(op).await?;
            repaired += 1;
        }
    }

    let records: Vec<LocalRecord> = store.iter().cloned().collect();
    for record in records {
        let local_id = &record.local_id;
        let ops: Vec<MutationOp> = queue.ops_for(local_id).into_iter().cloned().collect();

        if ops.is_empty() {
            repaired += derive_missing_op(store, queue, schema, &record, now).await?;
            continue;
        }

        // A create confirmed before the crash but never removed.
        let active = &ops[0];
        if active.kind == OpKind::Create && record.server_id.is_some() {
            if !record.dirty || ops.len() > 1 {
                info!("Removing confirmed create {} of {}", active.op_id, local_id);
                queue.remove(active.op_id).await?;
            } else {
                // Fresh op, so the create's idempotency key is never reused.
                let kind = if record.deleted { OpKind::Delete } else { OpKind::Update };
                let depends_on = match kind {
                    OpKind::Delete => BTreeSet::new(),
                    _ => resolver::dependencies(schema, store, record.entity_type, &record.payload),
                };
                queue.remove(active.op_id).await?;
                let op_id = queue
                    .push(
                        NewOp {
                            local_id: local_id.clone(),
                            entity_type: record.entity_type,
                            kind,
                            payload: record.payload.clone(),
                            record_version: record.version,
                            depends_on,
                        },
                        now,
                    )
                    .await?;
                info!("Replaced confirmed create {} of {} with {} {:?}", active.op_id, local_id, op_id, kind);
            }
            repaired += 1;
            continue;
        }
        if active.kind == OpKind::Update && record.server_id.is_some() && !record.dirty {
            info!("Removing confirmed update {} of {}", active.op_id, local_id);
            queue.remove(active.op_id).await?;
            repaired += 1;
            continue;
        }

        // The record was written but the queue write was lost.
        let Some(last) = ops.last() else {
            continue;
        };
        if record.dirty && last.record_version < record.version && last.kind != OpKind::Delete {
            repaired += catch_up(store, queue, schema, &record, last, ops.len(), now).await?;
        }
    }

    Ok(repaired)
}

/// Re-derive the op for a dirty record that has none.
async fn derive_missing_op(
    store: &mut RecordStore,
    queue: &mut MutationQueue,
    schema: &ReferenceSchema,
    record: &LocalRecord,
    now: DateTime<Utc>,
) -> Result<usize> {
    let kind = match (record.deleted, record.server_id.is_some(), record.dirty) {
        (true, false, _) | (true, true, false) => {
            info!("Purging tombstone {}", record.local_id);
            store.purge(&record.local_id).await?;
            return Ok(1);
        }
        (_, _, false) => return Ok(0),
        (true, true, true) => OpKind::Delete,
        (false, false, true) => OpKind::Create,
        (false, true, true) => OpKind::Update,
    };

    let depends_on = match kind {
        OpKind::Delete => BTreeSet::new(),
        _ => resolver::dependencies(schema, store, record.entity_type, &record.payload),
    };
    let op_id = queue
        .push(
            NewOp {
                local_id: record.local_id.clone(),
                entity_type: record.entity_type,
                kind,
                payload: record.payload.clone(),
                record_version: record.version,
                depends_on,
            },
            now,
        )
        .await?;
    info!("Re-derived {} {:?} for dirty {}", op_id, kind, record.local_id);
    Ok(1)
}

/// Bring the last queued op up to the record's current version.
async fn catch_up(
    store: &RecordStore,
    queue: &mut MutationQueue,
    schema: &ReferenceSchema,
    record: &LocalRecord,
    last: &MutationOp,
    queued: usize,
    now: DateTime<Utc>,
) -> Result<usize> {
    let depends_on = match record.deleted {
        true => BTreeSet::new(),
        false => resolver::dependencies(schema, store, record.entity_type, &record.payload),
    };

    if !last.state().dispatched() {
        let kind = match (record.deleted, last.kind) {
            (true, OpKind::Create) => {
                // Unsent create of a record deleted since: nothing to send.
                return Ok(0);
            }
            (true, _) => OpKind::Delete,
            (false, kind) => kind,
        };
        let mut op = last.clone();
        op.replace(kind, record.payload.clone(), record.version, depends_on, now);
        info!("Refreshed {} of {} to v{}", op.op_id, record.local_id, record.version);
        queue.save(op).await?;
        return Ok(1);
    }

    if queued > 1 {
        return Ok(0);
    }
    let kind = if record.deleted { OpKind::Delete } else { OpKind::Update };
    let op_id = queue
        .push(
            NewOp {
                local_id: record.local_id.clone(),
                entity_type: record.entity_type,
                kind,
                payload: record.payload.clone(),
                record_version: record.version,
                depends_on,
            },
            now,
        )
        .await?;
    info!("Queued successor {} for {}", op_id, record.local_id);
    Ok(1)
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("remote", &self.inner.remote.name())
            .field("config", &self.inner.config)
            .finish()
    }
}
