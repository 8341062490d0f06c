//! Sync pass coordinator.
//!
//! Drains the mutation queue against the remote API: picks eligible ops from
//! the resolver, keeps up to `max_concurrency` requests on the wire, and
//! folds each outcome back into the record store and queue. All queue and
//! store access goes through the engine's state lock; the lock is never held
//! across a network call.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use outbox_common::{EntityType, Error, LocalId, OpId, Payload, Result, ServerId};
use outbox_remote::{
    CreateAck, DeleteAck, IdempotencyKey, RemoteApi, RemoteEntity, RemoteError, RemoteResult,
    UpdateAck,
};

use crate::conflict::{ConflictAuditEntry, ConflictContext, ConflictDecision};
use crate::engine::{EngineInner, EngineState};
use crate::events::SyncEvent;
use crate::queue::{MutationOp, OpKind, OpStatus};
use crate::resolver;

/// Summary of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Ops confirmed by the server.
    pub ops_done: usize,
    /// Ops that failed permanently.
    pub ops_failed: usize,
    /// Conflicts handed to the policy.
    pub conflicts: usize,
    /// Transient failures rescheduled with backoff.
    pub retried: usize,
    /// Ops still waiting on a parent's server id.
    pub held: usize,
    pub duration: Duration,
    /// The pass was cut short by cancellation or connectivity loss.
    pub cancelled: bool,
}

/// The remote call an op turns into.
#[derive(Debug, Clone)]
enum Request {
    Create,
    Update {
        server_id: ServerId,
        if_version: Option<u64>,
    },
    Delete {
        server_id: ServerId,
    },
}

/// Everything needed to send one op, captured under the state lock.
#[derive(Debug, Clone)]
struct Dispatch {
    op_id: OpId,
    local_id: LocalId,
    entity_type: EntityType,
    kind: OpKind,
    record_version: u64,
    payload: Payload,
    request: Request,
    force: bool,
    key: IdempotencyKey,
}

#[derive(Debug)]
enum Ack {
    Created(CreateAck),
    Updated(UpdateAck),
    Deleted(DeleteAck),
}

impl Dispatch {
    async fn send(&self, remote: &dyn RemoteApi, timeout: Duration) -> RemoteResult<Ack> {
        let call = async {
            match &self.request {
                Request::Create => remote
                    .create_entity(self.entity_type, &self.payload, &self.key)
                    .await
                    .map(Ack::Created),
                Request::Update {
                    server_id,
                    if_version,
                } => remote
                    .update_entity(
                        self.entity_type,
                        server_id,
                        &self.payload,
                        *if_version,
                        self.force,
                        &self.key,
                    )
                    .await
                    .map(Ack::Updated),
                Request::Delete { server_id } => remote
                    .delete_entity(self.entity_type, server_id, &self.key)
                    .await
                    .map(Ack::Deleted),
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}

type Completion = (Dispatch, RemoteResult<Ack>);

/// Mutable bookkeeping of a running pass.
struct Pass {
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    outstanding: BTreeSet<OpId>,
    /// Dispatches per op in this pass.
    dispatches: HashMap<OpId, u32>,
    report: SyncReport,
    events: Vec<SyncEvent>,
}

/// Run one sync pass.
///
/// Passes are serialized; a second caller waits for the running pass to end.
///
/// # Errors
/// - `Offline` if connectivity is down when the pass starts
/// - Storage errors, which abort the pass and set the health error
pub(crate) async fn run_pass(inner: &EngineInner, cancel: &CancellationToken) -> Result<SyncReport> {
    let _running = inner.pass_lock.lock().await;

    let mut connectivity = inner.connectivity.clone();
    if !*connectivity.borrow_and_update() {
        return Err(Error::Offline);
    }
    let mut watching = true;
    *inner.current_pass() = Some(cancel.clone());

    let started = Instant::now();
    let mut pass = Pass {
        in_flight: FuturesUnordered::new(),
        outstanding: BTreeSet::new(),
        dispatches: HashMap::new(),
        report: SyncReport::default(),
        events: Vec::new(),
    };
    info!("Sync pass started");

    let mut outcome: Result<()> = loop {
        let refilled = refill(inner, &mut pass).await;
        flush_events(inner, &mut pass.events);
        if let Err(e) = refilled {
            break Err(e);
        }
        if pass.in_flight.is_empty() {
            break Ok(());
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Sync pass cancelled with {} requests in flight", pass.outstanding.len());
                pass.report.cancelled = true;
                break Ok(());
            }

            changed = connectivity.changed(), if watching => {
                match changed {
                    Ok(()) if !*connectivity.borrow_and_update() => {
                        warn!("Connectivity lost with {} requests in flight", pass.outstanding.len());
                        pass.report.cancelled = true;
                        break Ok(());
                    }
                    Ok(()) => {}
                    Err(_) => watching = false,
                }
            }

            Some((dispatch, result)) = pass.in_flight.next() => {
                let op_id = dispatch.op_id;
                let applied = apply_outcome(inner, &mut pass, dispatch, result).await;
                flush_events(inner, &mut pass.events);
                // An op whose outcome could not be stored stays outstanding
                // and is released below.
                if let Err(e) = applied {
                    break Err(e);
                }
                pass.outstanding.remove(&op_id);
            }
        }
    };

    // Abandon whatever is still on the wire.
    drop(std::mem::take(&mut pass.in_flight));
    if !pass.outstanding.is_empty() {
        let abandoned: Vec<OpId> = pass.outstanding.iter().copied().collect();
        let released = inner.state.lock().await.queue.release_in_flight(&abandoned).await;
        debug!("Released {} in-flight ops", abandoned.len());
        if let Err(e) = released {
            warn!("Failed to persist released ops: {}", e);
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }

    *inner.current_pass() = None;
    pass.report.duration = started.elapsed();
    match outcome {
        Ok(()) => {
            inner.set_health(None);
            let report = pass.report;
            info!(
                "Sync pass finished in {:?}: {} done, {} failed, {} conflicts, {} retried, {} held",
                report.duration,
                report.ops_done,
                report.ops_failed,
                report.conflicts,
                report.retried,
                report.held
            );
            inner.events.emit(SyncEvent::PassCompleted(report.clone()));
            Ok(report)
        }
        Err(e) => {
            error!("Sync pass aborted: {}", e);
            inner.set_health(Some(e.to_string()));
            inner.events.emit(SyncEvent::HealthError(e.to_string()));
            Err(e)
        }
    }
}

fn flush_events(inner: &EngineInner, events: &mut Vec<SyncEvent>) {
    for event in events.drain(..) {
        inner.events.emit(event);
    }
}

/// Dispatch eligible ops until the concurrency limit is reached.
async fn refill(inner: &EngineInner, pass: &mut Pass) -> Result<()> {
    let capacity = inner.config.max_concurrency.max(1);
    if pass.outstanding.len() >= capacity {
        return Ok(());
    }

    let now = inner.clock.now();
    let mut state = inner.state.lock().await;
    let EngineState { store, queue, .. } = &mut *state;

    let plan = resolver::plan(queue, store, now);
    pass.report.held = plan.held.len();

    for (op_id, reason) in plan.violations {
        let Some(op) = queue.get(op_id).cloned() else {
            continue;
        };
        error!("{} for {} cannot be sent: {}", op_id, op.local_id, reason);
        fail_permanently(pass, store, queue, op, Error::IntegrityViolation(reason)).await?;
    }

    for op_id in plan.ready {
        if pass.outstanding.len() >= capacity {
            break;
        }
        let Some(mut op) = queue.get(op_id).cloned() else {
            continue;
        };

        // One attempt per pass; a forced overwrite gets one more.
        let sent = pass.dispatches.get(&op_id).copied().unwrap_or(0);
        let limit = if op.force { 2 } else { 1 };
        if sent >= limit {
            continue;
        }
        if op.kind == OpKind::Delete && store.get(&op.local_id).is_none() {
            // Confirmed earlier; only the queue entry outlived a failed write.
            debug!("Dropping settled {} for {}", op_id, op.local_id);
            queue.remove(op_id).await?;
            continue;
        }

        let dispatch = match prepare(inner, store, queue.idempotency_key(&op), &op) {
            Ok(dispatch) => dispatch,
            Err(e) => {
                error!("{} for {} cannot be sent: {}", op_id, op.local_id, e);
                fail_permanently(pass, store, queue, op, e).await?;
                continue;
            }
        };

        op.status = OpStatus::InFlight;
        queue.save(op).await?;
        pass.dispatches.insert(op_id, sent + 1);
        pass.outstanding.insert(op_id);

        debug!(
            "Dispatching {} {:?} {} {}",
            op_id, dispatch.kind, dispatch.entity_type, dispatch.local_id
        );
        let remote = Arc::clone(&inner.remote);
        let timeout = inner.config.request_timeout;
        pass.in_flight.push(Box::pin(async move {
            let result = dispatch.send(remote.as_ref(), timeout).await;
            (dispatch, result)
        }));
    }

    Ok(())
}

/// Capture the request for `op`.
fn prepare(
    inner: &EngineInner,
    store: &crate::record::RecordStore,
    key: IdempotencyKey,
    op: &MutationOp,
) -> Result<Dispatch> {
    let record = store
        .get(&op.local_id)
        .ok_or_else(|| Error::IntegrityViolation(format!("record {} is gone", op.local_id)))?;

    let server_id = || {
        record.server_id.clone().ok_or_else(|| {
            Error::IntegrityViolation(format!("{} has no server id", op.local_id))
        })
    };
    let (request, payload) = match op.kind {
        OpKind::Create => (
            Request::Create,
            resolver::outgoing_payload(&inner.schema, store, op)?,
        ),
        OpKind::Update => (
            Request::Update {
                server_id: server_id()?,
                if_version: record.remote_version,
            },
            resolver::outgoing_payload(&inner.schema, store, op)?,
        ),
        OpKind::Delete => (
            Request::Delete {
                server_id: server_id()?,
            },
            Payload::Null,
        ),
    };

    Ok(Dispatch {
        op_id: op.op_id,
        local_id: op.local_id.clone(),
        entity_type: op.entity_type,
        kind: op.kind,
        record_version: op.record_version,
        payload,
        request,
        force: op.force,
        key,
    })
}

fn failed_event(op: &MutationOp, error: String, permanent: bool) -> SyncEvent {
    SyncEvent::OpFailed {
        op_id: op.op_id,
        local_id: op.local_id.clone(),
        kind: op.kind,
        error,
        permanent,
    }
}

/// Fold one response into the store and queue.
async fn apply_outcome(
    inner: &EngineInner,
    pass: &mut Pass,
    dispatch: Dispatch,
    result: RemoteResult<Ack>,
) -> Result<()> {
    let now = inner.clock.now();
    let mut state = inner.state.lock().await;
    let EngineState {
        store,
        queue,
        audit,
    } = &mut *state;

    let Some(mut op) = queue.get(dispatch.op_id).cloned() else {
        warn!("{} vanished while in flight", dispatch.op_id);
        return Ok(());
    };
    let local_id = dispatch.local_id.clone();

    let confirmed = match result {
        Ok(Ack::Created(ack)) => Ok((ack.server_id, ack.version)),
        Ok(Ack::Updated(ack)) => match &dispatch.request {
            Request::Update { server_id, .. } => Ok((server_id.clone(), ack.version)),
            _ => Err(Error::IntegrityViolation(format!(
                "unexpected update acknowledgement for {}",
                dispatch.op_id
            ))),
        },
        Ok(Ack::Deleted(ack)) => {
            debug!("{} deleted ({:?})", local_id, ack);
            store.purge(&local_id).await?;
            queue.remove(op.op_id).await?;
            pass.report.ops_done += 1;
            pass.events.push(SyncEvent::OpDone {
                op_id: op.op_id,
                local_id,
                kind: op.kind,
            });
            return Ok(());
        }
        Err(e) if e.is_transient() => {
            op.attempts += 1;
            op.maybe_applied = true;
            op.last_error = Some(e.to_string());
            let retry = &inner.config.retry;
            let permanent = retry.exhausted(op.attempts);
            if permanent {
                error!("{} for {} gave up after {} attempts: {}", op.op_id, local_id, op.attempts, e);
                op.status = OpStatus::Failed;
                op.next_retry_at = None;
                pass.report.ops_failed += 1;
            } else {
                let at = retry.next_retry_at(op.attempts, now);
                warn!(
                    "{} for {} failed (attempt {}), retrying at {}: {}",
                    op.op_id, local_id, op.attempts, at, e
                );
                op.status = OpStatus::Pending;
                op.next_retry_at = Some(at);
                pass.report.retried += 1;
            }
            queue.save(op.clone()).await?;
            pass.events.push(failed_event(&op, e.to_string(), permanent));
            return Ok(());
        }
        Err(RemoteError::Conflict(server)) if op.kind != OpKind::Create => {
            return resolve_conflict(inner, pass, store, queue, audit, op, dispatch, *server, now)
                .await;
        }
        Err(e) => Err(Error::from(e)),
    };

    match confirmed {
        Ok((server_id, remote_version)) => {
            match store
                .mark_synced(&local_id, server_id, remote_version, dispatch.record_version)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_global() => return Err(e),
                Err(e) => return fail_permanently(pass, store, queue, op, e).await,
            }
            queue.remove(op.op_id).await?;
            debug!("{} for {} confirmed at v{}", op.op_id, local_id, remote_version);
            pass.report.ops_done += 1;
            pass.events.push(SyncEvent::OpDone {
                op_id: op.op_id,
                local_id,
                kind: op.kind,
            });
            Ok(())
        }
        Err(e) => {
            warn!("{} for {} rejected: {}", op.op_id, local_id, e);
            fail_permanently(pass, store, queue, op, e).await
        }
    }
}

/// Park `op` as failed until a new edit or an explicit retry.
///
/// A create the server never applied, with a delete queued behind it, has
/// nothing left to sync: both ops are dropped and the record is purged.
async fn fail_permanently(
    pass: &mut Pass,
    store: &mut crate::record::RecordStore,
    queue: &mut crate::queue::MutationQueue,
    mut op: MutationOp,
    error: Error,
) -> Result<()> {
    pass.report.ops_failed += 1;
    pass.events.push(failed_event(&op, error.to_string(), true));

    let cancelled_delete = queue
        .successor(&op.local_id)
        .filter(|next| op.kind == OpKind::Create && !op.maybe_applied && next.kind == OpKind::Delete)
        .map(|next| next.op_id);
    if let Some(delete_id) = cancelled_delete {
        info!(
            "{} was rejected and {} deleted it locally; dropping both",
            op.op_id, delete_id
        );
        queue.remove(delete_id).await?;
        queue.remove(op.op_id).await?;
        store.purge(&op.local_id).await?;
        return Ok(());
    }

    op.fail(error.to_string());
    queue.save(op).await
}

#[allow(clippy::too_many_arguments)]
async fn resolve_conflict(
    inner: &EngineInner,
    pass: &mut Pass,
    store: &mut crate::record::RecordStore,
    queue: &mut crate::queue::MutationQueue,
    audit: &mut crate::conflict::ConflictAudit,
    mut op: MutationOp,
    dispatch: Dispatch,
    server: RemoteEntity,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let local_id = op.local_id.clone();
    let context = ConflictContext {
        local_id: &local_id,
        entity_type: op.entity_type,
        op_kind: op.kind,
        local_payload: &op.payload_snapshot,
        local_version: op.record_version,
        local_mutated_at: op.mutated_at,
        already_forced: dispatch.force,
        server: &server,
    };
    let decision = inner.policy.resolve(&context);
    let entry = ConflictAuditEntry::new(&context, decision, inner.policy.name(), now);
    audit.record(entry).await?;

    info!(
        "Conflict on {} ({:?}, server v{}): {:?} by {}",
        local_id,
        op.kind,
        server.version,
        decision,
        inner.policy.name()
    );
    pass.report.conflicts += 1;
    pass.events.push(SyncEvent::Conflict {
        local_id: local_id.clone(),
        decision,
    });

    match decision {
        ConflictDecision::KeepRemote => {
            if queue.successor(&local_id).is_some() {
                // A newer local edit is queued behind this op and stays.
                store.adopt_remote_version(&local_id, server.version).await?;
            } else {
                let payload =
                    resolver::incoming_payload(&inner.schema, store, op.entity_type, &server.payload)?;
                store
                    .overwrite_from_remote(&local_id, payload, server.version, server.updated_at)
                    .await?;
            }
            queue.remove(op.op_id).await?;
            Ok(())
        }
        ConflictDecision::ForceLocal => {
            store.adopt_remote_version(&local_id, server.version).await?;
            op.force = true;
            op.status = OpStatus::Pending;
            op.next_retry_at = None;
            queue.save(op).await?;
            Ok(())
        }
        ConflictDecision::Surface => {
            let error = Error::Conflict(format!(
                "{} changed on server (v{} at {})",
                local_id, server.version, server.updated_at
            ));
            fail_permanently(pass, store, queue, op, error).await
        }
    }
}
