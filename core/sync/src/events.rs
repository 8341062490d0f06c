//! Sync events for UI feedback.

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use outbox_common::{LocalId, OpId};

use crate::conflict::ConflictDecision;
use crate::coordinator::SyncReport;
use crate::queue::OpKind;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the UI may want to show.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The server confirmed an op.
    OpDone {
        op_id: OpId,
        local_id: LocalId,
        kind: OpKind,
    },
    /// An op failed. `permanent` ops wait for a new edit or an explicit
    /// retry; the others are rescheduled.
    OpFailed {
        op_id: OpId,
        local_id: LocalId,
        kind: OpKind,
        error: String,
        permanent: bool,
    },
    /// A conflict was resolved (or surfaced).
    Conflict {
        local_id: LocalId,
        decision: ConflictDecision,
    },
    /// A sync pass finished.
    PassCompleted(SyncReport),
    /// Storage failed and a pass was aborted.
    HealthError(String),
}

/// Callback registered with [`EventBus::add_listener`].
pub type SyncListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Fan-out of sync events to callbacks and channel subscribers.
pub struct EventBus {
    listeners: RwLock<Vec<SyncListener>>,
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Register a callback. Callbacks run synchronously on the emitting task
    /// and must not block.
    pub fn add_listener(&self, listener: SyncListener) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Channel receiving every event emitted from now on.
    ///
    /// A subscriber that falls more than 256 events behind sees
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event.
    pub fn emit(&self, event: SyncEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in &listeners {
            listener(&event);
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_listeners_and_subscribers_both_receive() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.add_listener(Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::HealthError("disk full".to_string()));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::HealthError("disk full".to_string())
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::Conflict {
            local_id: LocalId::new("p1").unwrap(),
            decision: ConflictDecision::KeepRemote,
        });
    }
}
