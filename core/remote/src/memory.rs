//! In-memory fake server for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};

use outbox_common::{EntityType, Payload, ReferenceSchema, ServerId};

use crate::api::{
    CreateAck, DeleteAck, IdempotencyKey, RemoteApi, RemoteEntity, RemoteError, RemoteResult,
    UpdateAck,
};

/// Kind of request seen by the fake server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMethod {
    Create,
    Update,
    Delete,
    List,
}

/// A request as received, before any failure injection.
#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub method: CallMethod,
    pub entity_type: EntityType,
    pub server_id: Option<ServerId>,
    pub payload: Option<Payload>,
    pub if_version: Option<u64>,
    pub force: bool,
    pub key: Option<IdempotencyKey>,
}

impl RemoteCall {
    fn new(method: CallMethod, entity_type: EntityType) -> Self {
        Self {
            method,
            entity_type,
            server_id: None,
            payload: None,
            if_version: None,
            force: false,
            key: None,
        }
    }
}

enum Injected {
    /// Fail before the server applies anything.
    Fail(RemoteError),
    /// Apply the request, then lose the response.
    ApplyThenFail(RemoteError),
}

#[derive(Debug, Clone)]
enum Replay {
    Create(CreateAck),
    Update(UpdateAck),
    Delete(DeleteAck),
}

#[derive(Debug, Clone)]
struct StoredEntity {
    entity_type: EntityType,
    payload: Payload,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl StoredEntity {
    fn to_remote(&self, server_id: &str) -> RemoteEntity {
        RemoteEntity {
            server_id: ServerId::new(server_id),
            payload: self.payload.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Default)]
struct ServerState {
    entities: BTreeMap<String, StoredEntity>,
    next_id: u64,
    replays: HashMap<IdempotencyKey, Replay>,
    calls: Vec<RemoteCall>,
    injected: VecDeque<Injected>,
    fixed_now: Option<DateTime<Utc>>,
    reference_checks: Option<ReferenceSchema>,
    in_flight: usize,
    max_in_flight: usize,
}

impl ServerState {
    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("srv-{}", self.next_id)
    }

    /// Reject payloads pointing at entities the server does not know.
    fn check_references(&self, entity_type: EntityType, payload: &Payload) -> RemoteResult<()> {
        if !payload.is_object() {
            return Err(RemoteError::Validation {
                status: 422,
                detail: "payload must be a JSON object".to_string(),
            });
        }
        let Some(schema) = &self.reference_checks else {
            return Ok(());
        };
        for (id, target) in schema.referenced_ids(entity_type, payload) {
            let known = self
                .entities
                .get(&id)
                .is_some_and(|entity| entity.entity_type == target);
            if !known {
                return Err(RemoteError::Validation {
                    status: 422,
                    detail: format!("unknown {} reference {}", target, id),
                });
            }
        }
        Ok(())
    }
}

/// In-process fake of the remote API.
///
/// Honors idempotency keys and optimistic versions the way a real server
/// would. Tests can script failures, hold requests in flight, inspect the
/// request log and edit entities "from another device".
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<ServerState>>,
    gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
    calls_changed: Arc<Notify>,
}

impl MemoryRemote {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject creates and updates whose references are unknown server ids.
    pub fn with_reference_checks(self, schema: ReferenceSchema) -> Self {
        self.lock().reference_checks = Some(schema);
        self
    }

    /// Pin the server clock. `None` returns to wall-clock time.
    pub fn set_now(&self, now: Option<DateTime<Utc>>) {
        self.lock().fixed_now = now;
    }

    /// Fail the next mutating request without applying it.
    pub fn fail_next(&self, err: RemoteError) {
        self.lock().injected.push_back(Injected::Fail(err));
    }

    /// Fail the next `n` mutating requests without applying them.
    pub fn fail_next_n(&self, n: usize, err: RemoteError) {
        let mut state = self.lock();
        for _ in 0..n {
            state.injected.push_back(Injected::Fail(err.clone()));
        }
    }

    /// Apply the next mutating request, then report `err` to the caller.
    pub fn apply_then_fail(&self, err: RemoteError) {
        self.lock().injected.push_back(Injected::ApplyThenFail(err));
    }

    /// Park every subsequent request until released.
    pub fn hold(&self) {
        *self.gate_lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` parked requests proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.gate_lock().as_ref() {
            gate.add_permits(n);
        }
    }

    /// Stop holding requests and release every parked one.
    pub fn release_all(&self) {
        if let Some(gate) = self.gate_lock().take() {
            gate.close();
        }
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Requests of one kind, in arrival order.
    pub fn calls_of(&self, method: CallMethod) -> Vec<RemoteCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    /// Highest number of requests that were in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Wait until at least `n` requests have arrived.
    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.calls_changed.notified();
            if self.lock().calls.len() >= n {
                return;
            }
            notified.await;
        }
    }

    /// Current server state of an entity.
    pub fn entity(&self, server_id: &ServerId) -> Option<RemoteEntity> {
        self.lock()
            .entities
            .get(server_id.as_str())
            .map(|entity| entity.to_remote(server_id.as_str()))
    }

    /// Number of entities of a type held by the server.
    pub fn count(&self, entity_type: EntityType) -> usize {
        self.lock()
            .entities
            .values()
            .filter(|entity| entity.entity_type == entity_type)
            .count()
    }

    /// Create an entity as if another device had synced it.
    pub fn insert_remote(
        &self,
        entity_type: EntityType,
        payload: Payload,
        updated_at: DateTime<Utc>,
    ) -> ServerId {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.entities.insert(
            id.clone(),
            StoredEntity {
                entity_type,
                payload,
                version: 1,
                updated_at,
            },
        );
        ServerId::new(id)
    }

    /// Overwrite an entity as if another device had edited it.
    ///
    /// Returns the new server state, or `None` if the entity is unknown.
    pub fn edit_remote(
        &self,
        server_id: &ServerId,
        payload: Payload,
        updated_at: DateTime<Utc>,
    ) -> Option<RemoteEntity> {
        let mut state = self.lock();
        let entity = state.entities.get_mut(server_id.as_str())?;
        entity.payload = payload;
        entity.version += 1;
        entity.updated_at = updated_at;
        Some(entity.to_remote(server_id.as_str()))
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate_lock(&self) -> MutexGuard<'_, Option<Arc<Semaphore>>> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Log the request, wait at the gate, then pop any scripted failure.
    async fn enter(&self, call: RemoteCall) -> Option<Injected> {
        let mutating = call.method != CallMethod::List;
        {
            let mut state = self.lock();
            state.calls.push(call);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        self.calls_changed.notify_waiters();

        let gate = self.gate_lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut state = self.lock();
        state.in_flight -= 1;
        if mutating {
            state.injected.pop_front()
        } else {
            None
        }
    }

    /// Run `apply` under the scripted failure, if any.
    fn finish<T>(
        &self,
        injected: Option<Injected>,
        apply: impl FnOnce(&mut ServerState) -> RemoteResult<T>,
    ) -> RemoteResult<T> {
        match injected {
            Some(Injected::Fail(err)) => Err(err),
            Some(Injected::ApplyThenFail(err)) => {
                apply(&mut *self.lock())?;
                Err(err)
            }
            None => apply(&mut *self.lock()),
        }
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_entity(
        &self,
        entity_type: EntityType,
        payload: &Payload,
        key: &IdempotencyKey,
    ) -> RemoteResult<CreateAck> {
        let mut call = RemoteCall::new(CallMethod::Create, entity_type);
        call.payload = Some(payload.clone());
        call.key = Some(key.clone());
        let injected = self.enter(call).await;

        self.finish(injected, |state| {
            if let Some(Replay::Create(ack)) = state.replays.get(key) {
                return Ok(ack.clone());
            }
            state.check_references(entity_type, payload)?;

            let id = state.allocate_id();
            let updated_at = state.now();
            state.entities.insert(
                id.clone(),
                StoredEntity {
                    entity_type,
                    payload: payload.clone(),
                    version: 1,
                    updated_at,
                },
            );
            let ack = CreateAck {
                server_id: ServerId::new(id),
                version: 1,
                updated_at,
            };
            state.replays.insert(key.clone(), Replay::Create(ack.clone()));
            Ok(ack)
        })
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        server_id: &ServerId,
        payload: &Payload,
        if_version: Option<u64>,
        force: bool,
        key: &IdempotencyKey,
    ) -> RemoteResult<UpdateAck> {
        let mut call = RemoteCall::new(CallMethod::Update, entity_type);
        call.server_id = Some(server_id.clone());
        call.payload = Some(payload.clone());
        call.if_version = if_version;
        call.force = force;
        call.key = Some(key.clone());
        let injected = self.enter(call).await;

        self.finish(injected, |state| {
            if let Some(Replay::Update(ack)) = state.replays.get(key) {
                return Ok(ack.clone());
            }
            state.check_references(entity_type, payload)?;

            let now = state.now();
            let entity = match state.entities.get_mut(server_id.as_str()) {
                Some(entity) if entity.entity_type == entity_type => entity,
                _ => return Err(RemoteError::NotFound),
            };
            if !force && if_version != Some(entity.version) {
                return Err(RemoteError::Conflict(Box::new(
                    entity.to_remote(server_id.as_str()),
                )));
            }

            entity.payload = payload.clone();
            entity.version += 1;
            entity.updated_at = now;
            let ack = UpdateAck {
                version: entity.version,
                updated_at: now,
            };
            state.replays.insert(key.clone(), Replay::Update(ack.clone()));
            Ok(ack)
        })
    }

    async fn delete_entity(
        &self,
        entity_type: EntityType,
        server_id: &ServerId,
        key: &IdempotencyKey,
    ) -> RemoteResult<DeleteAck> {
        let mut call = RemoteCall::new(CallMethod::Delete, entity_type);
        call.server_id = Some(server_id.clone());
        call.key = Some(key.clone());
        let injected = self.enter(call).await;

        self.finish(injected, |state| {
            if let Some(Replay::Delete(ack)) = state.replays.get(key) {
                return Ok(*ack);
            }
            let exists = state
                .entities
                .get(server_id.as_str())
                .is_some_and(|entity| entity.entity_type == entity_type);
            let ack = if exists {
                state.entities.remove(server_id.as_str());
                DeleteAck::Deleted
            } else {
                DeleteAck::AlreadyGone
            };
            state.replays.insert(key.clone(), Replay::Delete(ack));
            Ok(ack)
        })
    }

    async fn list_entities(&self, entity_type: EntityType) -> RemoteResult<Vec<RemoteEntity>> {
        self.enter(RemoteCall::new(CallMethod::List, entity_type))
            .await;

        Ok(self
            .lock()
            .entities
            .iter()
            .filter(|(_, entity)| entity.entity_type == entity_type)
            .map(|(id, entity)| entity.to_remote(id))
            .collect())
    }
}
