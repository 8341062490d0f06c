//! Remote API trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use outbox_common::{EntityType, OpId, Payload, ServerId};

/// Server acknowledgement of a create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAck {
    #[serde(rename = "id")]
    pub server_id: ServerId,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Server acknowledgement of an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAck {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAck {
    /// The entity existed and was removed.
    Deleted,
    /// The entity was already gone (404). Treated as success.
    AlreadyGone,
}

/// Authoritative server state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    #[serde(rename = "id")]
    pub server_id: ServerId,
    pub payload: Payload,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Token letting the server recognize a retried request.
///
/// Derived deterministically from the installation id and the op id, so
/// every retry of the same op sends the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key for an op queued on a given installation.
    pub fn for_op(installation: &str, op_id: OpId) -> Self {
        Self(format!("{}-{}", installation, op_id.0))
    }

    /// Key for a forced overwrite of the same op.
    ///
    /// A server may have cached the conflict answered under the original
    /// key, so the forced attempt is sent under its own key.
    pub fn forced(&self) -> Self {
        Self(format!("{}-force", self.0))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a single failed remote request.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection failure, 5xx, 408 or 429.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The server rejected the request (4xx).
    #[error("validation failed ({status}): {detail}")]
    Validation { status: u16, detail: String },

    /// Version mismatch; carries the server's current state.
    #[error("version conflict, server is at v{}", .0.version)]
    Conflict(Box<RemoteEntity>),

    /// The target entity does not exist.
    #[error("entity not found")]
    NotFound,
}

impl RemoteError {
    /// Returns true if the request may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout)
    }
}

impl From<RemoteError> for outbox_common::Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transient(msg) => outbox_common::Error::TransientNetwork(msg),
            RemoteError::Timeout => outbox_common::Error::Timeout,
            RemoteError::Validation { status, detail } => {
                outbox_common::Error::Validation { status, detail }
            }
            RemoteError::Conflict(entity) => outbox_common::Error::Conflict(format!(
                "{} changed on server (v{})",
                entity.server_id, entity.version
            )),
            RemoteError::NotFound => {
                outbox_common::Error::NotFound("entity not found on server".to_string())
            }
        }
    }
}

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Remote API client trait.
///
/// Implementations must be stateless with respect to the engine: the
/// coordinator calls them concurrently for independent ops.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Client name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Create an entity.
    ///
    /// # Postconditions
    /// - A replay with the same key returns the original acknowledgement
    ///   without creating a second entity
    async fn create_entity(
        &self,
        entity_type: EntityType,
        payload: &Payload,
        key: &IdempotencyKey,
    ) -> RemoteResult<CreateAck>;

    /// Replace an entity's state.
    ///
    /// `if_version` is the optimistic-concurrency token; a mismatch yields
    /// [`RemoteError::Conflict`] unless `force` is set.
    async fn update_entity(
        &self,
        entity_type: EntityType,
        server_id: &ServerId,
        payload: &Payload,
        if_version: Option<u64>,
        force: bool,
        key: &IdempotencyKey,
    ) -> RemoteResult<UpdateAck>;

    /// Delete an entity. A missing entity is reported as `AlreadyGone`.
    async fn delete_entity(
        &self,
        entity_type: EntityType,
        server_id: &ServerId,
        key: &IdempotencyKey,
    ) -> RemoteResult<DeleteAck>;

    /// List every entity of a type.
    async fn list_entities(&self, entity_type: EntityType) -> RemoteResult<Vec<RemoteEntity>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = IdempotencyKey::for_op("dev-1", OpId(42));
        let b = IdempotencyKey::for_op("dev-1", OpId(42));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "dev-1-42");
        assert_ne!(a, IdempotencyKey::for_op("dev-1", OpId(43)));
        assert_eq!(a.forced().as_str(), "dev-1-42-force");
    }

    #[test]
    fn test_remote_entity_wire_format() {
        let json = json!({
            "id": "srv-7",
            "payload": {"name": "Acme"},
            "version": 3,
            "updatedAt": "2024-05-01T10:00:00Z"
        });
        let entity: RemoteEntity = serde_json::from_value(json).unwrap();
        assert_eq!(entity.server_id, ServerId::new("srv-7"));
        assert_eq!(entity.version, 3);
    }

    #[test]
    fn test_error_conversion() {
        let err: outbox_common::Error = RemoteError::Timeout.into();
        assert!(matches!(err, outbox_common::Error::Timeout));
        assert!(err.is_retryable());

        let err: outbox_common::Error = RemoteError::Validation {
            status: 422,
            detail: "bad".into(),
        }
        .into();
        assert!(!err.is_retryable());
    }
}
