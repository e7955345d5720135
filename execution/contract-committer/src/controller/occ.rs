// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    controller::{CommitDecision, ConflictController},
    state::GlobalState,
    types::{ChangeSet, CommitId},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};
use tracing::trace;

/// Finalized change lists kept around for `change_list` when nobody collects them.
const DEFAULT_RETENTION: usize = 4096;

/// Optimistic concurrency control over [`GlobalState`].
///
/// An attempt is valid if every key it read still has the version it observed. Commits
/// finalize strictly in id order: an accepted attempt whose predecessors are not final
/// yet waits, and is validated again when its turn comes since a predecessor may have
/// written what it read. Finalizing applies the writes to the global state.
pub struct OccController {
    state: Arc<GlobalState>,
    // Lowest id that is not final.
    next: CommitId,
    recorded: HashMap<CommitId, ChangeSet>,
    accepted: BTreeSet<CommitId>,
    redo: Vec<CommitId>,
    done: Vec<CommitId>,
    finalized: BTreeMap<CommitId, ChangeSet>,
    retention: usize,
}

impl OccController {
    pub fn new(state: Arc<GlobalState>) -> Self {
        Self {
            state,
            next: 0,
            recorded: HashMap::new(),
            accepted: BTreeSet::new(),
            redo: Vec::new(),
            done: Vec::new(),
            finalized: BTreeMap::new(),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Lowest id that is not final.
    pub fn next_commit_id(&self) -> CommitId {
        self.next
    }

    fn validate(&self, change_set: &ChangeSet) -> bool {
        change_set
            .reads
            .iter()
            .all(|(key, version)| self.state.version_of(key) == *version)
    }

    fn invalidate(&mut self, commit_id: CommitId) {
        self.recorded.remove(&commit_id);
        self.accepted.remove(&commit_id);
    }

    fn finalize_ready(&mut self) {
        while self.accepted.contains(&self.next) {
            let commit_id = self.next;
            self.accepted.remove(&commit_id);
            let change_set = match self.recorded.remove(&commit_id) {
                Some(change_set) => change_set,
                None => unreachable!("Accepted commit {} has no recorded attempt", commit_id),
            };

            if !self.validate(&change_set) {
                trace!(commit_id, "Accepted commit invalidated by a predecessor");
                self.redo.push(commit_id);
                return;
            }

            let version = self.state.apply(&change_set.writes);
            trace!(commit_id, version, "Commit finalized");
            self.finalized.insert(commit_id, change_set);
            while self.finalized.len() > self.retention {
                self.finalized.pop_first();
            }
            self.done.push(commit_id);
            self.next += 1;
        }
    }
}

impl ConflictController for OccController {
    fn record(&mut self, commit_id: CommitId, change_set: ChangeSet) {
        self.accepted.remove(&commit_id);
        self.recorded.insert(commit_id, change_set);
    }

    fn commit(&mut self, commit_id: CommitId) -> CommitDecision {
        if commit_id < self.next {
            return CommitDecision::Accepted;
        }
        let valid = match self.recorded.get(&commit_id) {
            Some(change_set) => self.validate(change_set),
            None => return CommitDecision::Undecided,
        };
        if !valid {
            self.invalidate(commit_id);
            return CommitDecision::Conflict;
        }

        self.accepted.insert(commit_id);
        self.finalize_ready();
        CommitDecision::Accepted
    }

    fn take_redo(&mut self) -> Vec<CommitId> {
        std::mem::take(&mut self.redo)
    }

    fn take_done(&mut self) -> Vec<CommitId> {
        std::mem::take(&mut self.done)
    }

    fn clear(&mut self, commit_id: CommitId) {
        self.invalidate(commit_id);
    }

    fn reset(&mut self, first_commit_id: CommitId) {
        self.next = first_commit_id;
        self.recorded.clear();
        self.accepted.clear();
        self.redo.clear();
        self.done.clear();
        self.finalized.clear();
    }

    fn change_list(&mut self, commit_id: CommitId) -> Option<ChangeSet> {
        self.finalized.remove(&commit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, StateKey, Version, UNWRITTEN_VERSION};
    use claims::{assert_none, assert_some, assert_some_eq};

    fn key(name: &str) -> StateKey {
        StateKey::new(Address::from_u64(1), name.as_bytes().to_vec())
    }

    fn change_set(reads: &[(&str, Version)], writes: &[(&str, u8)]) -> ChangeSet {
        ChangeSet {
            reads: reads.iter().map(|(name, v)| (key(name), *v)).collect(),
            writes: writes
                .iter()
                .map(|(name, value)| (key(name), Some(vec![*value])))
                .collect(),
        }
    }

    fn controller() -> (Arc<GlobalState>, OccController) {
        let state = Arc::new(GlobalState::new());
        let mut controller = OccController::new(state.clone());
        controller.reset(1);
        (state, controller)
    }

    #[test]
    fn test_in_order_commits_finalize() {
        let (state, mut controller) = controller();
        controller.record(1, change_set(&[("a", UNWRITTEN_VERSION)], &[("a", 1)]));
        assert_eq!(controller.commit(1), CommitDecision::Accepted);
        assert_eq!(controller.take_done(), vec![1]);
        assert_some_eq!(state.get(&key("a")), vec![1]);

        let version = state.version_of(&key("a"));
        controller.record(2, change_set(&[("a", version)], &[("a", 2)]));
        assert_eq!(controller.commit(2), CommitDecision::Accepted);
        assert_eq!(controller.take_done(), vec![2]);
        assert_eq!(controller.next_commit_id(), 3);

        assert_some!(controller.change_list(2));
        assert_none!(controller.change_list(2));
    }

    #[test]
    fn test_stale_read_conflicts() {
        let (_, mut controller) = controller();
        controller.record(1, change_set(&[], &[("a", 1)]));
        controller.record(2, change_set(&[("a", UNWRITTEN_VERSION)], &[("b", 2)]));
        assert_eq!(controller.commit(1), CommitDecision::Accepted);
        assert_eq!(controller.commit(2), CommitDecision::Conflict);
        // Conflicting ids are redone by the caller, not reported again.
        assert!(controller.take_redo().is_empty());
        assert_eq!(controller.commit(2), CommitDecision::Undecided);
    }

    #[test]
    fn test_out_of_order_acceptance_cascades() {
        let (_, mut controller) = controller();
        controller.record(3, change_set(&[("c", UNWRITTEN_VERSION)], &[("d", 3)]));
        controller.record(2, change_set(&[], &[("e", 2)]));
        assert_eq!(controller.commit(3), CommitDecision::Accepted);
        assert_eq!(controller.commit(2), CommitDecision::Accepted);
        assert!(controller.take_done().is_empty());

        assert_eq!(controller.commit(1), CommitDecision::Undecided);
        controller.record(1, change_set(&[], &[]));
        assert_eq!(controller.commit(1), CommitDecision::Accepted);
        assert_eq!(controller.take_done(), vec![1, 2, 3]);
    }

    #[test]
    fn test_predecessor_invalidates_accepted_successor() {
        let (_, mut controller) = controller();
        // 2 read "a" before 1 wrote it.
        controller.record(2, change_set(&[("a", UNWRITTEN_VERSION)], &[("b", 2)]));
        controller.record(3, change_set(&[], &[("c", 3)]));
        assert_eq!(controller.commit(2), CommitDecision::Accepted);
        assert_eq!(controller.commit(3), CommitDecision::Accepted);

        controller.record(1, change_set(&[], &[("a", 1)]));
        assert_eq!(controller.commit(1), CommitDecision::Accepted);
        assert_eq!(controller.take_done(), vec![1]);
        assert_eq!(controller.take_redo(), vec![2]);
        assert_eq!(controller.next_commit_id(), 2);

        // 3 stays accepted and finalizes once 2 does.
        controller.record(2, change_set(&[], &[("b", 2)]));
        assert_eq!(controller.commit(2), CommitDecision::Accepted);
        assert_eq!(controller.take_done(), vec![2, 3]);
    }

    #[test]
    fn test_clear_and_reset() {
        let (_, mut controller) = controller();
        controller.record(2, change_set(&[], &[]));
        controller.clear(2);
        assert_eq!(controller.commit(2), CommitDecision::Undecided);

        controller.record(1, change_set(&[], &[]));
        controller.commit(1);
        controller.reset(0);
        assert_eq!(controller.next_commit_id(), 0);
        assert!(controller.take_done().is_empty());
        assert_none!(controller.change_list(1));
    }

    #[test]
    fn test_retention_bounds_change_lists() {
        let (_, controller) = controller();
        let mut controller = controller.with_retention(2);
        for commit_id in 1..=4 {
            controller.record(commit_id, change_set(&[], &[]));
            controller.commit(commit_id);
        }
        assert_none!(controller.change_list(1));
        assert_none!(controller.change_list(2));
        assert_some!(controller.change_list(3));
        assert_some!(controller.change_list(4));
    }
}
