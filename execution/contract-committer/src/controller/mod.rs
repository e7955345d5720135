// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::types::{ChangeSet, CommitId};

mod occ;

pub use occ::OccController;

/// Outcome of asking the controller to commit an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitDecision {
    /// The attempt is valid. The id is reported through `take_done` once it is final,
    /// which may be later than this call.
    Accepted,
    /// The attempt observed stale state. The caller must clear and redo the id. The id is
    /// not repeated in `take_redo`.
    Conflict,
    /// The id cannot be decided yet. The caller retries once more attempts are recorded.
    Undecided,
}

/// Decides which speculative attempts become final.
///
/// A controller is only ever driven by a single sequencing thread, so implementations
/// need no internal synchronization.
pub trait ConflictController: Send {
    /// Hands over the observations of the latest attempt of `commit_id`, replacing any
    /// earlier ones.
    fn record(&mut self, commit_id: CommitId, change_set: ChangeSet);

    fn commit(&mut self, commit_id: CommitId) -> CommitDecision;

    /// Ids invalidated as a side effect of earlier commits. Each must be cleared and
    /// re-executed.
    fn take_redo(&mut self) -> Vec<CommitId>;

    /// Ids that became final since the last call.
    fn take_done(&mut self) -> Vec<CommitId>;

    /// Discards everything recorded for `commit_id`.
    fn clear(&mut self, commit_id: CommitId);

    /// Discards all state. Commits restart at `first_commit_id`.
    fn reset(&mut self, first_commit_id: CommitId);

    /// The finalized observations of a done id. Each change list is handed over once.
    fn change_list(&mut self, commit_id: CommitId) -> Option<ChangeSet>;
}
