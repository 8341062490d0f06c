//! Local record store.
//!
//! Durable mapping from local id to the latest local snapshot of an entity
//! plus its sync metadata. Pure data layer: nothing here touches the network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use outbox_common::{EntityType, Error, LocalId, Payload, Result, ServerId};
use outbox_storage::{KvStore, Namespace};

/// Local snapshot of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    /// Client-generated identifier.
    pub local_id: LocalId,
    /// Server identifier, set once the create is confirmed. Never reassigned.
    pub server_id: Option<ServerId>,
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Current local state.
    pub payload: Payload,
    /// Local revision, bumped on every local mutation.
    pub version: u64,
    /// Last version confirmed by the server.
    pub remote_version: Option<u64>,
    /// Local state differs from the last confirmed remote state.
    pub dirty: bool,
    /// Tombstone: kept until the delete is confirmed remotely.
    pub deleted: bool,
    /// Wall-clock time of the last local mutation.
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    /// A record created on this device, not yet known to the server.
    pub fn new_local(
        local_id: LocalId,
        entity_type: EntityType,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id,
            server_id: None,
            entity_type,
            payload,
            version: 1,
            remote_version: None,
            dirty: true,
            deleted: false,
            updated_at: now,
        }
    }

    /// A record pulled from the server, already in sync.
    pub fn new_synced(
        local_id: LocalId,
        entity_type: EntityType,
        server_id: ServerId,
        payload: Payload,
        remote_version: u64,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id,
            server_id: Some(server_id),
            entity_type,
            payload,
            version: 1,
            remote_version: Some(remote_version),
            dirty: false,
            deleted: false,
            updated_at,
        }
    }

    /// Apply a local edit.
    pub fn apply_update(&mut self, payload: Payload, now: DateTime<Utc>) {
        self.payload = payload;
        self.version += 1;
        self.dirty = true;
        self.updated_at = now;
    }

    /// Turn the record into a tombstone.
    pub fn apply_delete(&mut self, now: DateTime<Utc>) {
        self.deleted = true;
        self.version += 1;
        self.dirty = true;
        self.updated_at = now;
    }
}

/// Durable record store with an in-memory read cache.
///
/// Every write goes to the key-value store first and only then to the
/// cache, so a failed write leaves both untouched.
pub struct RecordStore {
    kv: Arc<dyn KvStore>,
    records: BTreeMap<LocalId, LocalRecord>,
    by_server_id: HashMap<ServerId, LocalId>,
}

impl RecordStore {
    /// Load every record from the store.
    ///
    /// # Errors
    /// - Storage read failure
    /// - Corrupt record entry
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let mut records = BTreeMap::new();
        let mut by_server_id = HashMap::new();

        for (key, bytes) in kv.scan(Namespace::Records).await? {
            let record: LocalRecord = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("record {}: {}", key, e)))?;
            if let Some(server_id) = &record.server_id {
                by_server_id.insert(server_id.clone(), record.local_id.clone());
            }
            records.insert(record.local_id.clone(), record);
        }

        debug!("Loaded {} local records", records.len());
        Ok(Self {
            kv,
            records,
            by_server_id,
        })
    }

    /// Insert or replace a record.
    ///
    /// # Errors
    /// - `IntegrityViolation` if the write would change an assigned server id
    /// - Storage write failure
    pub async fn put(&mut self, record: LocalRecord) -> Result<()> {
        if let Some(existing) = self.records.get(&record.local_id) {
            if existing.server_id.is_some() && existing.server_id != record.server_id {
                return Err(Error::IntegrityViolation(format!(
                    "server id of {} cannot change",
                    record.local_id
                )));
            }
        }

        let bytes = serde_json::to_vec(&record)?;
        self.kv
            .put(Namespace::Records, record.local_id.as_str(), bytes)
            .await?;

        if let Some(server_id) = &record.server_id {
            self.by_server_id
                .insert(server_id.clone(), record.local_id.clone());
        }
        self.records.insert(record.local_id.clone(), record);
        Ok(())
    }

    /// Get a record.
    pub fn get(&self, local_id: &LocalId) -> Option<&LocalRecord> {
        self.records.get(local_id)
    }

    /// Get a record by the id the server assigned to it.
    pub fn find_by_server_id(&self, server_id: &ServerId) -> Option<&LocalRecord> {
        self.by_server_id
            .get(server_id)
            .and_then(|local_id| self.records.get(local_id))
    }

    /// Snapshot of live records of a type matching `predicate`.
    ///
    /// Tombstones are excluded.
    pub fn query<F>(&self, entity_type: EntityType, predicate: F) -> Vec<LocalRecord>
    where
        F: Fn(&LocalRecord) -> bool,
    {
        self.records
            .values()
            .filter(|r| r.entity_type == entity_type && !r.deleted && predicate(r))
            .cloned()
            .collect()
    }

    /// Iterate over every record, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = &LocalRecord> {
        self.records.values()
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record a confirmed create or update.
    ///
    /// `synced_version` is the local version the confirmed request carried;
    /// the record stays dirty if it was edited again in the meantime.
    ///
    /// # Errors
    /// - `NotFound` if the record is gone
    /// - `IntegrityViolation` if a different server id is already assigned
    pub async fn mark_synced(
        &mut self,
        local_id: &LocalId,
        server_id: ServerId,
        remote_version: u64,
        synced_version: u64,
    ) -> Result<()> {
        let mut record = self.require(local_id)?.clone();
        if record.server_id.as_ref().is_some_and(|id| *id != server_id) {
            return Err(Error::IntegrityViolation(format!(
                "{} already has server id {}, server returned {}",
                local_id,
                record.server_id.as_ref().map(ServerId::as_str).unwrap_or_default(),
                server_id
            )));
        }
        record.server_id = Some(server_id);
        record.remote_version = Some(remote_version);
        record.dirty = record.version != synced_version;
        self.put(record).await
    }

    /// Turn a record into a tombstone.
    pub async fn mark_deleted(&mut self, local_id: &LocalId, now: DateTime<Utc>) -> Result<()> {
        let mut record = self.require(local_id)?.clone();
        record.apply_delete(now);
        self.put(record).await
    }

    /// Replace local state with the server's after the server won a conflict.
    pub async fn overwrite_from_remote(
        &mut self,
        local_id: &LocalId,
        payload: Payload,
        remote_version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut record = self.require(local_id)?.clone();
        record.payload = payload;
        record.remote_version = Some(remote_version);
        record.dirty = false;
        record.deleted = false;
        record.updated_at = updated_at;
        self.put(record).await
    }

    /// Adopt a newer server version without touching local state.
    pub async fn adopt_remote_version(
        &mut self,
        local_id: &LocalId,
        remote_version: u64,
    ) -> Result<()> {
        let mut record = self.require(local_id)?.clone();
        record.remote_version = Some(remote_version);
        self.put(record).await
    }

    /// Physically remove a record.
    pub async fn purge(&mut self, local_id: &LocalId) -> Result<()> {
        self.kv.delete(Namespace::Records, local_id.as_str()).await?;
        if let Some(record) = self.records.remove(local_id) {
            if let Some(server_id) = record.server_id {
                self.by_server_id.remove(&server_id);
            }
        }
        Ok(())
    }

    fn require(&self, local_id: &LocalId) -> Result<&LocalRecord> {
        self.records
            .get(local_id)
            .ok_or_else(|| Error::NotFound(format!("record {}", local_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_storage::MemoryKv;
    use serde_json::json;

    fn kv() -> (MemoryKv, Arc<dyn KvStore>) {
        let kv = MemoryKv::new();
        let shared: Arc<dyn KvStore> = Arc::new(kv.clone());
        (kv, shared)
    }

    fn project(id: &str) -> LocalRecord {
        LocalRecord::new_local(
            LocalId::new(id).unwrap(),
            EntityType::Project,
            json!({"name": id}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_put_get_and_reload() {
        let (_, shared) = kv();
        let mut store = RecordStore::load(shared.clone()).await.unwrap();
        store.put(project("p1")).await.unwrap();

        let record = store.get(&LocalId::new("p1").unwrap()).unwrap();
        assert!(record.dirty);
        assert_eq!(record.version, 1);

        let reloaded = RecordStore::load(shared).await.unwrap();
        assert_eq!(reloaded.get(&LocalId::new("p1").unwrap()), Some(record));
    }

    #[tokio::test]
    async fn test_mark_synced_clears_dirty_for_matching_version() {
        let (_, shared) = kv();
        let mut store = RecordStore::load(shared).await.unwrap();
        store.put(project("p1")).await.unwrap();

        let id = LocalId::new("p1").unwrap();
        store
            .mark_synced(&id, ServerId::new("srv-1"), 1, 1)
            .await
            .unwrap();

        let record = store.get(&id).unwrap();
        assert!(!record.dirty);
        assert_eq!(record.remote_version, Some(1));
        assert_eq!(
            store.find_by_server_id(&ServerId::new("srv-1")).unwrap().local_id,
            id
        );
    }

    #[tokio::test]
    async fn test_mark_synced_keeps_later_edits_dirty() {
        let (_, shared) = kv();
        let mut store = RecordStore::load(shared).await.unwrap();
        let mut record = project("p1");
        record.apply_update(json!({"name": "renamed"}), Utc::now());
        store.put(record).await.unwrap();

        let id = LocalId::new("p1").unwrap();
        // The confirmed request carried version 1; the record is at 2.
        store
            .mark_synced(&id, ServerId::new("srv-1"), 1, 1)
            .await
            .unwrap();
        assert!(store.get(&id).unwrap().dirty);
    }

    #[tokio::test]
    async fn test_server_id_is_immutable() {
        let (_, shared) = kv();
        let mut store = RecordStore::load(shared).await.unwrap();
        store.put(project("p1")).await.unwrap();
        let id = LocalId::new("p1").unwrap();
        store
            .mark_synced(&id, ServerId::new("srv-1"), 1, 1)
            .await
            .unwrap();

        let result = store.mark_synced(&id, ServerId::new("srv-2"), 2, 1).await;
        assert!(matches!(result, Err(Error::IntegrityViolation(_))));

        let mut cleared = store.get(&id).unwrap().clone();
        cleared.server_id = None;
        assert!(matches!(
            store.put(cleared).await,
            Err(Error::IntegrityViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_query_skips_tombstones_and_other_types() {
        let (_, shared) = kv();
        let mut store = RecordStore::load(shared).await.unwrap();
        store.put(project("p1")).await.unwrap();
        store.put(project("p2")).await.unwrap();
        store
            .put(LocalRecord::new_local(
                LocalId::new("t1").unwrap(),
                EntityType::Task,
                json!({"projectId": "p1"}),
                Utc::now(),
            ))
            .await
            .unwrap();
        store
            .mark_deleted(&LocalId::new("p2").unwrap(), Utc::now())
            .await
            .unwrap();

        let projects = store.query(EntityType::Project, |_| true);
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].local_id, LocalId::new("p1").unwrap());

        let named = store.query(EntityType::Project, |r| r.payload["name"] == "zzz");
        assert!(named.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_untouched() {
        let (mem, shared) = kv();
        let mut store = RecordStore::load(shared).await.unwrap();
        store.put(project("p1")).await.unwrap();

        mem.set_fail_writes(true);
        let id = LocalId::new("p1").unwrap();
        assert!(store.mark_deleted(&id, Utc::now()).await.is_err());
        assert!(!store.get(&id).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_purge() {
        let (mem, shared) = kv();
        let mut store = RecordStore::load(shared).await.unwrap();
        store.put(project("p1")).await.unwrap();
        let id = LocalId::new("p1").unwrap();
        store
            .mark_synced(&id, ServerId::new("srv-1"), 1, 1)
            .await
            .unwrap();

        store.purge(&id).await.unwrap();
        assert!(store.get(&id).is_none());
        assert!(store.find_by_server_id(&ServerId::new("srv-1")).is_none());
        assert!(mem.is_empty(Namespace::Records));
    }

    #[tokio::test]
    async fn test_overwrite_from_remote_resurrects_tombstone() {
        let (_, shared) = kv();
        let mut store = RecordStore::load(shared).await.unwrap();
        store.put(project("p1")).await.unwrap();
        let id = LocalId::new("p1").unwrap();
        store.mark_deleted(&id, Utc::now()).await.unwrap();

        store
            .overwrite_from_remote(&id, json!({"name": "server"}), 4, Utc::now())
            .await
            .unwrap();
        let record = store.get(&id).unwrap();
        assert!(!record.deleted);
        assert!(!record.dirty);
        assert_eq!(record.payload["name"], "server");
        assert_eq!(record.remote_version, Some(4));
    }
}
