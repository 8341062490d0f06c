//! Dependency resolver.
//!
//! Orders active ops so that an op referencing another record by foreign
//! key is only dispatched once the parent's create has returned a server id,
//! and swaps local ids for server ids in outgoing payloads.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use outbox_common::{EntityType, Error, LocalId, OpId, Payload, ReferenceSchema, Result, ServerId};

use crate::queue::{MutationOp, MutationQueue, OpStatus};
use crate::record::RecordStore;

/// Dispatch plan for one refill of a sync pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Ops eligible now, in dependency order.
    pub ready: Vec<OpId>,
    /// Pending ops waiting on a parent without a server id.
    pub held: Vec<OpId>,
    /// Ops that can never be dispatched, with the reason.
    pub violations: Vec<(OpId, String)>,
}

/// Referenced records that have no server id yet.
pub fn dependencies(
    schema: &ReferenceSchema,
    store: &RecordStore,
    entity_type: EntityType,
    payload: &Payload,
) -> BTreeSet<LocalId> {
    schema
        .referenced_ids(entity_type, payload)
        .into_iter()
        .filter_map(|(id, _)| LocalId::new(id).ok())
        .filter(|id| store.get(id).is_some_and(|r| r.server_id.is_none()))
        .collect()
}

/// Group active ops into topological levels.
///
/// An edge runs from a parent's active op to each op depending on that
/// parent while it still lacks a server id. Returns the levels and the ops
/// left over on a cycle.
pub fn batches(queue: &MutationQueue, store: &RecordStore) -> (Vec<Vec<OpId>>, Vec<OpId>) {
    let active = queue.active_ops();
    let by_local: BTreeMap<&LocalId, OpId> =
        active.iter().map(|op| (&op.local_id, op.op_id)).collect();

    let mut indegree: BTreeMap<OpId, usize> = active.iter().map(|op| (op.op_id, 0)).collect();
    let mut children: BTreeMap<OpId, Vec<OpId>> = BTreeMap::new();
    for op in &active {
        for parent in &op.depends_on {
            let unsynced = store.get(parent).is_some_and(|r| r.server_id.is_none());
            if let (true, Some(parent_op)) = (unsynced, by_local.get(parent)) {
                children.entry(*parent_op).or_default().push(op.op_id);
                *indegree.entry(op.op_id).or_default() += 1;
            }
        }
    }

    let mut levels = Vec::new();
    let mut frontier: Vec<OpId> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for id in &frontier {
            indegree.remove(id);
            for child in children.get(id).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*child);
                    }
                }
            }
        }
        next.sort();
        levels.push(std::mem::replace(&mut frontier, next));
    }

    let cyclic = indegree.into_keys().collect();
    (levels, cyclic)
}

/// Decide which ops may be dispatched at `now`.
pub fn plan(queue: &MutationQueue, store: &RecordStore, now: DateTime<Utc>) -> Plan {
    let (levels, cyclic) = batches(queue, store);
    let mut plan = Plan::default();

    for op_id in cyclic {
        if let Some(op) = queue.get(op_id).filter(|op| op.status == OpStatus::Pending) {
            plan.violations
                .push((op_id, format!("dependency cycle through {}", op.local_id)));
        }
    }

    for op_id in levels.into_iter().flatten() {
        let Some(op) = queue.get(op_id) else {
            continue;
        };
        if op.status != OpStatus::Pending {
            continue;
        }

        let mut held = false;
        let mut missing = None;
        for parent in &op.depends_on {
            match store.get(parent) {
                None => {
                    missing = Some(parent);
                    break;
                }
                Some(record) if record.server_id.is_none() => held = true,
                Some(_) => {}
            }
        }

        if let Some(parent) = missing {
            plan.violations
                .push((op_id, format!("missing parent record {}", parent)));
        } else if held {
            plan.held.push(op_id);
        } else if op.is_due(now) {
            plan.ready.push(op_id);
        }
    }

    plan
}

/// Payload to send for `op`, with references swapped for server ids.
///
/// Values that name no local record pass through unchanged.
///
/// # Errors
/// - `IntegrityViolation` if a referenced record has the wrong type or no
///   server id yet
pub fn outgoing_payload(
    schema: &ReferenceSchema,
    store: &RecordStore,
    op: &MutationOp,
) -> Result<Payload> {
    schema.rewrite(op.entity_type, &op.payload_snapshot, |id, target| {
        let Some(parent) = LocalId::new(id).ok().and_then(|local| store.get(&local)) else {
            return Ok(None);
        };
        if parent.entity_type != target {
            return Err(Error::IntegrityViolation(format!(
                "{} references {} as a {}, but it is a {}",
                op.local_id, id, target, parent.entity_type
            )));
        }
        match &parent.server_id {
            Some(server_id) => Ok(Some(server_id.as_str().to_string())),
            None => Err(Error::IntegrityViolation(format!(
                "parent {} of {} has no server id",
                id, op.local_id
            ))),
        }
    })
}

/// Server payload with known server ids swapped back to local ids.
pub fn incoming_payload(
    schema: &ReferenceSchema,
    store: &RecordStore,
    entity_type: EntityType,
    payload: &Payload,
) -> Result<Payload> {
    schema.rewrite(entity_type, payload, |id, _| {
        Ok(store
            .find_by_server_id(&ServerId::new(id))
            .map(|record| record.local_id.as_str().to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{NewOp, OpKind};
    use crate::record::LocalRecord;
    use outbox_storage::{KvStore, MemoryKv};
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        schema: ReferenceSchema,
        store: RecordStore,
        queue: MutationQueue,
    }

    impl Fixture {
        async fn new() -> Self {
            let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
            Self {
                schema: ReferenceSchema::default(),
                store: RecordStore::load(kv.clone()).await.unwrap(),
                queue: MutationQueue::load(kv).await.unwrap(),
            }
        }

        async fn create(&mut self, id: &str, entity_type: EntityType, payload: Payload) -> OpId {
            let depends_on = dependencies(&self.schema, &self.store, entity_type, &payload);
            self.store
                .put(LocalRecord::new_local(
                    LocalId::new(id).unwrap(),
                    entity_type,
                    payload.clone(),
                    Utc::now(),
                ))
                .await
                .unwrap();
            self.queue
                .push(
                    NewOp {
                        local_id: LocalId::new(id).unwrap(),
                        entity_type,
                        kind: OpKind::Create,
                        payload,
                        record_version: 1,
                        depends_on,
                    },
                    Utc::now(),
                )
                .await
                .unwrap()
        }

        async fn synced(&mut self, id: &str, server_id: &str) {
            self.store
                .mark_synced(&LocalId::new(id).unwrap(), ServerId::new(server_id), 1, 1)
                .await
                .unwrap();
            let op_id = self.queue.active(&LocalId::new(id).unwrap()).unwrap().op_id;
            self.queue.remove(op_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_child_held_until_parent_synced() {
        let mut f = Fixture::new().await;
        let p = f.create("p1", EntityType::Project, json!({"name": "P"})).await;
        let t = f
            .create("t1", EntityType::Task, json!({"projectId": "p1"}))
            .await;

        let plan = plan(&f.queue, &f.store, Utc::now());
        assert_eq!(plan.ready, vec![p]);
        assert_eq!(plan.held, vec![t]);

        f.synced("p1", "srv-1").await;
        let plan = super::plan(&f.queue, &f.store, Utc::now());
        assert_eq!(plan.ready, vec![t]);
        assert!(plan.held.is_empty());
    }

    #[tokio::test]
    async fn test_batches_follow_dependency_chain() {
        let mut f = Fixture::new().await;
        let c = f.create("c1", EntityType::Client, json!({"name": "C"})).await;
        let p = f
            .create("p1", EntityType::Project, json!({"clientId": "c1"}))
            .await;
        let t = f
            .create("t1", EntityType::Task, json!({"projectId": "p1"}))
            .await;
        let other = f.create("c2", EntityType::Client, json!({"name": "D"})).await;

        let (levels, cyclic) = batches(&f.queue, &f.store);
        assert!(cyclic.is_empty());
        assert_eq!(levels, vec![vec![c, other], vec![p], vec![t]]);
    }

    #[tokio::test]
    async fn test_cycle_is_a_violation() {
        let mut f = Fixture::new().await;
        // Seed the records first so each op sees the other as unsynced.
        for (id, parent) in [("p1", "p2"), ("p2", "p1")] {
            f.store
                .put(LocalRecord::new_local(
                    LocalId::new(id).unwrap(),
                    EntityType::Project,
                    json!({"clientId": parent}),
                    Utc::now(),
                ))
                .await
                .unwrap();
        }
        for (id, parent) in [("p1", "p2"), ("p2", "p1")] {
            f.queue
                .push(
                    NewOp {
                        local_id: LocalId::new(id).unwrap(),
                        entity_type: EntityType::Project,
                        kind: OpKind::Create,
                        payload: json!({}),
                        record_version: 1,
                        depends_on: [LocalId::new(parent).unwrap()].into_iter().collect(),
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }

        let plan = plan(&f.queue, &f.store, Utc::now());
        assert!(plan.ready.is_empty());
        assert_eq!(plan.violations.len(), 2);
        assert!(plan.violations[0].1.contains("cycle"));
    }

    #[tokio::test]
    async fn test_missing_parent_is_a_violation() {
        let mut f = Fixture::new().await;
        f.create("p1", EntityType::Project, json!({})).await;
        let t = f
            .create("t1", EntityType::Task, json!({"projectId": "p1"}))
            .await;
        // Parent vanishes (created and deleted offline).
        let p_op = f.queue.active(&LocalId::new("p1").unwrap()).unwrap().op_id;
        f.queue.remove(p_op).await.unwrap();
        f.store.purge(&LocalId::new("p1").unwrap()).await.unwrap();

        let plan = plan(&f.queue, &f.store, Utc::now());
        assert_eq!(plan.violations.len(), 1);
        assert_eq!(plan.violations[0].0, t);
    }

    #[tokio::test]
    async fn test_backoff_delays_eligibility() {
        let mut f = Fixture::new().await;
        let p = f.create("p1", EntityType::Project, json!({})).await;
        let now = Utc::now();

        let mut op = f.queue.get(p).unwrap().clone();
        op.next_retry_at = Some(now + chrono::TimeDelta::seconds(4));
        f.queue.save(op).await.unwrap();

        assert!(plan(&f.queue, &f.store, now).ready.is_empty());
        assert_eq!(
            plan(&f.queue, &f.store, now + chrono::TimeDelta::seconds(4)).ready,
            vec![p]
        );
    }

    #[tokio::test]
    async fn test_outgoing_payload_swaps_ids() {
        let mut f = Fixture::new().await;
        f.create("p1", EntityType::Project, json!({})).await;
        let t = f
            .create(
                "t1",
                EntityType::Task,
                json!({"title": "Write", "projectId": "p1"}),
            )
            .await;

        let op = f.queue.get(t).unwrap().clone();
        assert!(matches!(
            outgoing_payload(&f.schema, &f.store, &op),
            Err(Error::IntegrityViolation(_))
        ));

        f.synced("p1", "srv-9").await;
        let sent = outgoing_payload(&f.schema, &f.store, &op).unwrap();
        assert_eq!(sent["projectId"], "srv-9");
        assert_eq!(sent["title"], "Write");
    }

    #[tokio::test]
    async fn test_outgoing_payload_passes_server_ids_through() {
        let mut f = Fixture::new().await;
        let t = f
            .create("t1", EntityType::Task, json!({"projectId": "srv-77"}))
            .await;
        let op = f.queue.get(t).unwrap().clone();
        assert!(op.depends_on.is_empty());
        let sent = outgoing_payload(&f.schema, &f.store, &op).unwrap();
        assert_eq!(sent["projectId"], "srv-77");
    }

    #[tokio::test]
    async fn test_empty_reference_names_no_record() {
        let mut f = Fixture::new().await;
        let t = f
            .create("t1", EntityType::Task, json!({"projectId": ""}))
            .await;
        let op = f.queue.get(t).unwrap().clone();
        assert!(op.depends_on.is_empty());
        let sent = outgoing_payload(&f.schema, &f.store, &op).unwrap();
        assert_eq!(sent["projectId"], "");
    }

    #[tokio::test]
    async fn test_outgoing_payload_checks_target_type() {
        let mut f = Fixture::new().await;
        f.create("c1", EntityType::Client, json!({})).await;
        f.synced("c1", "srv-1").await;
        let t = f
            .create("t1", EntityType::Task, json!({"projectId": "c1"}))
            .await;
        let op = f.queue.get(t).unwrap().clone();
        assert!(matches!(
            outgoing_payload(&f.schema, &f.store, &op),
            Err(Error::IntegrityViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_incoming_payload_maps_back() {
        let mut f = Fixture::new().await;
        f.create("p1", EntityType::Project, json!({})).await;
        f.synced("p1", "srv-3").await;

        let local = incoming_payload(
            &f.schema,
            &f.store,
            EntityType::Task,
            &json!({"projectId": "srv-3"}),
        )
        .unwrap();
        assert_eq!(local["projectId"], "p1");
    }
}
