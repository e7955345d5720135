// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Sequential execution used as the expected outcome of pipeline runs.

use crate::{
    state::GlobalState,
    task::ContractExecutor,
    types::{CommitId, ExecutionContext, ExecutionRequest, ExecutionResponse},
    worker::execute_attempt,
};

/// Executes `requests` one after another, ids starting at `first_commit_id`, applying the
/// writes of every successful request before the next one runs.
pub fn run_sequential<E: ContractExecutor + ?Sized>(
    executor: &E,
    state: &GlobalState,
    requests: Vec<ExecutionRequest>,
    first_commit_id: CommitId,
) -> Vec<ExecutionResponse> {
    requests
        .into_iter()
        .zip(first_commit_id..)
        .map(|(mut request, commit_id)| {
            request.set_commit_id(commit_id);
            let completed = execute_attempt(executor, state, ExecutionContext::new(request));
            if completed.response.is_success() {
                state.apply(&completed.change_set.writes);
            }
            completed.response
        })
        .collect()
}

/// Compares what callers can observe, leaving out timing.
pub fn assert_same_outcome(expected: &ExecutionResponse, actual: &ExecutionResponse) {
    assert_eq!(expected.commit_id, actual.commit_id);
    assert_eq!(
        expected.ret, actual.ret,
        "commit {} ret differs: {:?} vs {:?}",
        actual.commit_id, expected.error, actual.error
    );
    assert_eq!(expected.result, actual.result, "commit {}", actual.commit_id);
}
