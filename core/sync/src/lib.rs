//! Outbox Sync Engine
//!
//! Offline-first synchronization for locally edited records:
//! - Local record store with optimistic writes
//! - Durable mutation queue with coalescing
//! - Dependency-ordered dispatch with local-to-server id rewriting
//! - Retry with exponential backoff and idempotency keys
//! - Pluggable conflict resolution with an audit trail
//! - Background scheduling on reconnect, timer or local change

pub mod clock;
pub mod coalesce;
pub mod conflict;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod queue;
pub mod record;
pub mod resolver;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use coalesce::{coalesce, OpState, Slot, Transition};
pub use conflict::{
    AlwaysSurface, ConflictAudit, ConflictAuditEntry, ConflictContext, ConflictDecision,
    ConflictPolicy, ConflictStrategy, LastWriteWins,
};
pub use coordinator::SyncReport;
pub use engine::{PullReport, SyncConfig, SyncEngine, SyncEngineBuilder, SyncStatus};
pub use events::{EventBus, SyncEvent, SyncListener};
pub use queue::{MutationOp, MutationQueue, NewOp, OpKind, OpStatus};
pub use record::{LocalRecord, RecordStore};
pub use resolver::Plan;
pub use retry::RetryConfig;
pub use scheduler::{SchedulerHandle, SyncMode};
