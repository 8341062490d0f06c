//! In-memory key-value store for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::kv::{KvStore, Namespace};
use outbox_common::{Error, Result};

type Table = BTreeMap<(Namespace, String), Vec<u8>>;

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop. Clones share the same underlying map, so a test can keep a
/// handle and "restart" an engine on the same data.
#[derive(Clone, Default)]
pub struct MemoryKv {
    table: Arc<RwLock<Table>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryKv {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a full disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of keys in a namespace.
    pub fn len(&self, ns: Namespace) -> usize {
        self.read()
            .map(|table| table.keys().filter(|(n, _)| *n == ns).count())
            .unwrap_or(0)
    }

    /// Check if a namespace is empty.
    pub fn is_empty(&self, ns: Namespace) -> bool {
        self.len(ns) == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Table>> {
        self.table
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Table>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("simulated storage full".to_string()));
        }
        self.table
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(&(ns, key.to_string())).cloned())
    }

    async fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> Result<()> {
        self.write()?.insert((ns, key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        self.write()?.remove(&(ns, key.to_string()));
        Ok(())
    }

    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .read()?
            .iter()
            .filter(|((n, _), _)| *n == ns)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}
