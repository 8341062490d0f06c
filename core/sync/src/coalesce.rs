//! Coalescing rules for the mutation queue.
//!
//! A pure transition table: given the state of the ops already queued for a
//! record and the kind of a new local mutation, decide what the queue should
//! hold afterwards. No storage, no networking.

use crate::queue::{OpKind, OpStatus};

/// What the queue knows about one queued op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpState {
    pub kind: OpKind,
    pub status: OpStatus,
    /// A request for this op may have reached the server.
    pub maybe_applied: bool,
}

impl OpState {
    /// Whether the op's payload may already be on the wire.
    pub fn dispatched(&self) -> bool {
        self.status == OpStatus::InFlight || self.maybe_applied
    }
}

/// Which queued op a transition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The record's active op.
    Active,
    /// The op buffered behind a dispatched active op.
    Successor,
}

/// Outcome of folding a new mutation into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing queued in the slot: append a new op.
    Append,
    /// Rewrite the queued op in place with this kind and the new payload.
    Replace(OpKind),
    /// Drop the queued op; the record never existed remotely.
    Cancel,
    /// A delete is queued; the mutation is rejected.
    Stale,
    /// The mutation makes no sense for the record (e.g. a second create).
    Invalid,
}

/// Fold `incoming` into the ops queued for a record.
pub fn coalesce(
    active: Option<OpState>,
    successor: Option<OpState>,
    incoming: OpKind,
) -> (Slot, Transition) {
    match transition(active, incoming) {
        Transition::Append if active.is_some() => {
            // The active op is dispatched; fold into the buffered successor.
            (Slot::Successor, transition(successor, incoming))
        }
        other => (Slot::Active, other),
    }
}

/// The transition table for a single slot.
///
/// Returns `Append` for a dispatched op: nothing in this slot can absorb the
/// mutation, which then goes to the next slot.
fn transition(existing: Option<OpState>, incoming: OpKind) -> Transition {
    let Some(existing) = existing else {
        return Transition::Append;
    };

    match (existing.kind, incoming) {
        (_, OpKind::Create) => Transition::Invalid,
        (OpKind::Delete, _) => Transition::Stale,
        _ if existing.dispatched() => Transition::Append,
        (OpKind::Create, OpKind::Update) => Transition::Replace(OpKind::Create),
        (OpKind::Create, OpKind::Delete) => Transition::Cancel,
        (OpKind::Update, OpKind::Update) => Transition::Replace(OpKind::Update),
        (OpKind::Update, OpKind::Delete) => Transition::Replace(OpKind::Delete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn op(kind: OpKind, status: OpStatus) -> Option<OpState> {
        Some(OpState {
            kind,
            status,
            maybe_applied: false,
        })
    }

    #[test]
    fn test_pending_rows() {
        use OpKind::*;
        let pending = OpStatus::Pending;

        assert_eq!(coalesce(None, None, Create), (Slot::Active, Transition::Append));
        assert_eq!(
            coalesce(op(Create, pending), None, Update),
            (Slot::Active, Transition::Replace(Create))
        );
        assert_eq!(
            coalesce(op(Create, pending), None, Delete),
            (Slot::Active, Transition::Cancel)
        );
        assert_eq!(
            coalesce(op(Update, pending), None, Update),
            (Slot::Active, Transition::Replace(Update))
        );
        assert_eq!(
            coalesce(op(Update, pending), None, Delete),
            (Slot::Active, Transition::Replace(Delete))
        );
        for incoming in [Update, Delete] {
            assert_eq!(
                coalesce(op(Delete, pending), None, incoming),
                (Slot::Active, Transition::Stale)
            );
        }
    }

    #[test]
    fn test_failed_ops_are_replaceable() {
        assert_eq!(
            coalesce(op(OpKind::Update, OpStatus::Failed), None, OpKind::Update),
            (Slot::Active, Transition::Replace(OpKind::Update))
        );
        assert_eq!(
            coalesce(op(OpKind::Create, OpStatus::Failed), None, OpKind::Delete),
            (Slot::Active, Transition::Cancel)
        );
    }

    #[test]
    fn test_in_flight_buffers_successor() {
        let in_flight = op(OpKind::Create, OpStatus::InFlight);
        assert_eq!(
            coalesce(in_flight, None, OpKind::Update),
            (Slot::Successor, Transition::Append)
        );
        // A delete behind an in-flight create cannot cancel it.
        assert_eq!(
            coalesce(in_flight, None, OpKind::Delete),
            (Slot::Successor, Transition::Append)
        );
        assert_eq!(
            coalesce(in_flight, op(OpKind::Update, OpStatus::Pending), OpKind::Update),
            (Slot::Successor, Transition::Replace(OpKind::Update))
        );
        assert_eq!(
            coalesce(in_flight, op(OpKind::Delete, OpStatus::Pending), OpKind::Update),
            (Slot::Successor, Transition::Stale)
        );
    }

    #[test]
    fn test_maybe_applied_counts_as_dispatched() {
        let retried = Some(OpState {
            kind: OpKind::Update,
            status: OpStatus::Pending,
            maybe_applied: true,
        });
        assert_eq!(
            coalesce(retried, None, OpKind::Update),
            (Slot::Successor, Transition::Append)
        );
    }

    #[test]
    fn test_in_flight_delete_is_terminal() {
        assert_eq!(
            coalesce(op(OpKind::Delete, OpStatus::InFlight), None, OpKind::Update),
            (Slot::Active, Transition::Stale)
        );
    }

    #[test]
    fn test_second_create_is_invalid() {
        assert_eq!(
            coalesce(op(OpKind::Update, OpStatus::Pending), None, OpKind::Create),
            (Slot::Active, Transition::Invalid)
        );
    }

    /// Minimal queue model driven only by the transition table.
    fn apply(queue: &mut Vec<OpState>, incoming: OpKind) -> Transition {
        let (slot, transition) = coalesce(queue.first().copied(), queue.get(1).copied(), incoming);
        let index = match slot {
            Slot::Active => 0,
            Slot::Successor => 1,
        };
        match transition {
            Transition::Append => queue.push(OpState {
                kind: incoming,
                status: OpStatus::Pending,
                maybe_applied: false,
            }),
            Transition::Replace(kind) => queue[index].kind = kind,
            Transition::Cancel => {
                queue.remove(index);
            }
            Transition::Stale | Transition::Invalid => {}
        }
        transition
    }

    fn edit() -> impl Strategy<Value = OpKind> {
        prop_oneof![3 => Just(OpKind::Update), 1 => Just(OpKind::Delete)]
    }

    proptest! {
        #[test]
        fn prop_undispatched_create_never_splits(edits in prop::collection::vec(edit(), 0..16)) {
            let mut queue = Vec::new();
            apply(&mut queue, OpKind::Create);
            for kind in edits {
                if apply(&mut queue, kind) == Transition::Cancel {
                    // The record is gone; later edits are rejected upstream.
                    prop_assert!(queue.is_empty());
                    break;
                }
                prop_assert_eq!(queue.len(), 1);
                prop_assert_eq!(queue[0].kind, OpKind::Create);
            }
        }

        #[test]
        fn prop_at_most_two_ops_per_record(
            edits in prop::collection::vec(edit(), 0..16),
            dispatch_at in 0usize..16,
        ) {
            let mut queue = Vec::new();
            apply(&mut queue, OpKind::Create);
            for (i, kind) in edits.into_iter().enumerate() {
                if i == dispatch_at {
                    if let Some(active) = queue.first_mut() {
                        active.status = OpStatus::InFlight;
                    }
                }
                apply(&mut queue, kind);
                prop_assert!(queue.len() <= 2);
                let in_flight = queue.iter().filter(|op| op.status == OpStatus::InFlight).count();
                prop_assert!(in_flight <= 1);
            }
        }
    }
}
