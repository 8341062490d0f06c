//! Key-value store trait definition.

use async_trait::async_trait;

use outbox_common::Result;

/// Logical keyspaces used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Local record snapshots keyed by local id.
    Records,
    /// Queued mutation ops keyed by zero-padded op id.
    Ops,
    /// Conflict audit entries keyed by zero-padded sequence.
    Conflicts,
    /// Engine bookkeeping (op counter, installation id).
    Meta,
}

impl Namespace {
    /// Stable name persisted by backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Records => "records",
            Namespace::Ops => "ops",
            Namespace::Conflicts => "conflicts",
            Namespace::Meta => "meta",
        }
    }
}

/// Durable async key-value store.
///
/// Implementations must make every successful write durable before
/// returning and must keep per-key writes atomic: a reader observes either
/// the old value or the new one, never a mix.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Read a value.
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a value.
    ///
    /// # Errors
    /// - Storage full or unavailable
    async fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, ns: Namespace, key: &str) -> Result<()>;

    /// All entries in a namespace, sorted by key.
    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>>;
}
