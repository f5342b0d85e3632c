//! Queue of local mutations waiting to be pushed.

use appstate_protocol::{Mutation, PatchType};
use std::collections::{HashMap, VecDeque};

/// A local mutation queued for push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    /// Queue sequence number, increasing across all collections.
    pub seq: u64,
    /// Target collection.
    pub patch_type: PatchType,
    /// The mutation.
    pub mutation: Mutation,
}

impl AsRef<Mutation> for PendingMutation {
    fn as_ref(&self) -> &Mutation {
        &self.mutation
    }
}

/// Per-collection queues of pending mutations.
///
/// # Invariants
///
/// - Entries are in enqueue order
/// - At most one entry per index: a newer mutation supersedes the older one
/// - Acknowledged entries are removed
#[derive(Debug)]
pub struct PendingQueue {
    queues: HashMap<PatchType, VecDeque<PendingMutation>>,
    next_seq: u64,
}

impl PendingQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Queues a mutation, replacing any pending one with the same index.
    ///
    /// Returns the assigned sequence number.
    pub fn enqueue(&mut self, patch_type: PatchType, mutation: Mutation) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let queue = self.queues.entry(patch_type).or_default();
        queue.retain(|p| p.mutation.index != mutation.index);
        queue.push_back(PendingMutation {
            seq,
            patch_type,
            mutation,
        });
        seq
    }

    /// Returns the collection's pending mutations in enqueue order.
    pub fn pending(&self, patch_type: PatchType) -> Vec<PendingMutation> {
        self.queues
            .get(&patch_type)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of pending mutations in a collection.
    pub fn pending_count(&self, patch_type: PatchType) -> usize {
        self.queues.get(&patch_type).map_or(0, VecDeque::len)
    }

    /// Returns true if the collection has nothing to push.
    pub fn is_empty(&self, patch_type: PatchType) -> bool {
        self.pending_count(patch_type) == 0
    }

    /// Removes every entry of the collection with `seq <= up_to`.
    pub fn acknowledge_up_to(&mut self, patch_type: PatchType, up_to: u64) {
        if let Some(queue) = self.queues.get_mut(&patch_type) {
            queue.retain(|p| p.seq > up_to);
        }
    }

    /// Removes specific entries, e.g. ones that lost a conflict.
    pub fn remove(&mut self, patch_type: PatchType, seqs: &[u64]) {
        if seqs.is_empty() {
            return;
        }
        if let Some(queue) = self.queues.get_mut(&patch_type) {
            queue.retain(|p| !seqs.contains(&p.seq));
        }
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appstate_protocol::{action_names, MutationIndex, SyncAction, SyncActionValue};

    fn mute(jid: &str, timestamp: u64) -> Mutation {
        Mutation::set(
            MutationIndex::new(action_names::MUTE, [jid]),
            SyncActionValue::new(
                timestamp,
                SyncAction::Mute {
                    muted: true,
                    mute_end_timestamp: None,
                },
            ),
            2,
        )
    }

    #[test]
    fn enqueue_assigns_sequence() {
        let mut queue = PendingQueue::new();
        assert_eq!(queue.enqueue(PatchType::Regular, mute("a", 1)), 1);
        assert_eq!(queue.enqueue(PatchType::RegularLow, mute("b", 1)), 2);
        assert_eq!(queue.enqueue(PatchType::Regular, mute("c", 1)), 3);

        assert_eq!(queue.pending_count(PatchType::Regular), 2);
        assert_eq!(queue.pending_count(PatchType::RegularLow), 1);
        assert!(queue.is_empty(PatchType::CriticalBlock));
    }

    #[test]
    fn newer_mutation_supersedes_same_index() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PatchType::Regular, mute("a", 1));
        queue.enqueue(PatchType::Regular, mute("b", 1));
        queue.enqueue(PatchType::Regular, mute("a", 5));

        let pending = queue.pending(PatchType::Regular);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].mutation, mute("b", 1));
        assert_eq!(pending[1].mutation, mute("a", 5));
        assert_eq!(pending[1].seq, 3);
    }

    #[test]
    fn acknowledge_up_to() {
        let mut queue = PendingQueue::new();
        queue.enqueue(PatchType::Regular, mute("a", 1));
        queue.enqueue(PatchType::Regular, mute("b", 1));
        queue.enqueue(PatchType::Regular, mute("c", 1));

        queue.acknowledge_up_to(PatchType::Regular, 2);
        let pending = queue.pending(PatchType::Regular);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 3);
    }

    #[test]
    fn remove_by_sequence() {
        let mut queue = PendingQueue::new();
        let a = queue.enqueue(PatchType::Regular, mute("a", 1));
        queue.enqueue(PatchType::Regular, mute("b", 1));

        queue.remove(PatchType::Regular, &[a]);
        assert_eq!(queue.pending_count(PatchType::Regular), 1);
        assert_eq!(queue.pending(PatchType::Regular)[0].mutation, mute("b", 1));
    }
}
