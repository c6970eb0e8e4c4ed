//! Double-buffered state handoff
//!
//! Update threads stage state edits through cloned [`HandoffWriter`]s; the
//! render thread calls [`StateHandoff::swap`] once per frame to take
//! everything staged so far. Writers append under a `parking_lot::Mutex`,
//! so a swap waits only for writers already inside the lock and never sees
//! a partially staged batch.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::state_tree::{NodeId, StateOp};

/// Edits for one node, applied as one commit
#[derive(Clone, Debug, PartialEq)]
pub struct StagedUpdate {
    /// Target node
    pub node: NodeId,
    /// Edits to stage and commit
    pub ops: Vec<StateOp>,
}

/// Writer side of the handoff
#[derive(Clone, Debug)]
pub struct HandoffWriter {
    pending: Arc<Mutex<Vec<StagedUpdate>>>,
}

impl HandoffWriter {
    /// Stage edits for one node
    pub fn stage(&self, node: NodeId, ops: Vec<StateOp>) {
        self.pending.lock().push(StagedUpdate { node, ops });
    }

    /// Stage several updates atomically with respect to `swap`
    pub fn stage_batch(&self, updates: impl IntoIterator<Item = StagedUpdate>) {
        let updates: Vec<StagedUpdate> = updates.into_iter().collect();
        self.pending.lock().extend(updates);
    }
}

/// Render-thread side of the handoff
#[derive(Debug, Default)]
pub struct StateHandoff {
    pending: Arc<Mutex<Vec<StagedUpdate>>>,
    front: Vec<StagedUpdate>,
}

impl StateHandoff {
    /// Create an empty handoff
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer for another thread
    pub fn writer(&self) -> HandoffWriter {
        HandoffWriter {
            pending: Arc::clone(&self.pending),
        }
    }

    /// Exchange buffers and take everything staged so far, in staging order
    pub fn swap(&mut self) -> std::vec::Drain<'_, StagedUpdate> {
        self.front.clear();
        core::mem::swap(&mut *self.pending.lock(), &mut self.front);
        self.front.drain(..)
    }

    /// Number of updates waiting for the next swap
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SlotId, StateValue};

    #[test]
    fn test_swap_takes_staged_in_order() {
        let mut handoff = StateHandoff::new();
        let writer = handoff.writer();
        let a = NodeId::new(0, 0);
        let b = NodeId::new(1, 0);

        writer.stage(a, vec![StateOp::Define(SlotId(0), StateValue::Int(1))]);
        writer.stage(b, vec![StateOp::Undefine(SlotId(0))]);
        assert_eq!(handoff.pending_len(), 2);

        let taken: Vec<_> = handoff.swap().collect();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].node, a);
        assert_eq!(taken[1].node, b);
        assert_eq!(handoff.pending_len(), 0);
        assert_eq!(handoff.swap().count(), 0);
    }

    #[test]
    fn test_writers_on_other_threads() {
        let mut handoff = StateHandoff::new();
        let threads: Vec<_> = (0..4u32)
            .map(|t| {
                let writer = handoff.writer();
                std::thread::spawn(move || {
                    for i in 0..25u32 {
                        writer.stage(
                            NodeId::new(t * 100 + i, 0),
                            vec![StateOp::Define(SlotId(0), StateValue::Int(i as i64))],
                        );
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(handoff.swap().count(), 100);
    }
}
