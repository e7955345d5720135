// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::CommitterConfig,
    controller::{CommitDecision, ConflictController},
    counters::{
        ADMITTED_COUNT, BATCH_LABEL, CONFLICT_LABEL, DELIVERED_COUNT, FAILURE_LABEL,
        INVALIDATED_LABEL, REDO_COUNT,
    },
    errors::{CommitterError, CommitterResult},
    queue::{ResponseQueue, ShutdownSignal, TaskQueue},
    state::GlobalState,
    task::ContractExecutor,
    types::{CommitId, ExecutionContext, ExecutionRequest, ExecutionResponse},
    worker::{CompletedAttempt, WorkerPool},
};
use std::{collections::BTreeSet, sync::Arc, time::Instant};
use tracing::{debug, info, trace};

/// Executes a known set of requests and returns once all of them are final.
///
/// Sequencing runs on the calling thread. Responses come back in the order the controller
/// finalized them, which need not be submission order, each carrying its finalized change
/// set.
pub struct BatchCommitter<C> {
    config: CommitterConfig,
    controller: C,
    tasks: TaskQueue,
    responses: ResponseQueue,
    shutdown: ShutdownSignal,
    workers: WorkerPool,
}

impl<C: ConflictController> BatchCommitter<C> {
    pub fn new<E: ContractExecutor>(
        config: CommitterConfig,
        executor: Arc<E>,
        state: Arc<GlobalState>,
        controller: C,
    ) -> CommitterResult<Self> {
        config.sanitize()?;
        let tasks = TaskQueue::new(config.queue_pop_timeout());
        let responses = ResponseQueue::new(config.queue_pop_timeout());
        let shutdown = ShutdownSignal::new();
        let workers = WorkerPool::spawn(
            BATCH_LABEL,
            config.num_workers,
            config.pin_workers_to_cores,
            executor,
            state,
            tasks.clone(),
            responses.clone(),
            shutdown.clone(),
        )?;
        info!(num_workers = config.num_workers, "Batch committer started");

        Ok(Self {
            config,
            controller,
            tasks,
            responses,
            shutdown,
            workers,
        })
    }

    /// Cancelling the returned signal aborts a running [`Self::execute`] and stops the
    /// workers for good.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Runs `requests` under ids `0..requests.len()` and returns one terminal response per
    /// request.
    pub fn execute(
        &mut self,
        requests: Vec<ExecutionRequest>,
    ) -> CommitterResult<Vec<ExecutionResponse>> {
        let requested = requests.len();
        if self.shutdown.is_cancelled() {
            return Err(CommitterError::ShutdownAbort {
                admitted: 0,
                requested,
            });
        }
        if requested == 0 {
            return Ok(vec![]);
        }

        let start = Instant::now();
        self.controller.reset(0);
        for (commit_id, mut request) in requests.into_iter().enumerate() {
            request.set_commit_id(commit_id as CommitId);
            self.tasks.push(ExecutionContext::new(request));
        }
        ADMITTED_COUNT
            .with_label_values(&[BATCH_LABEL])
            .inc_by(requested as u64);

        let mut round = BatchRound::new(
            &mut self.controller,
            &self.tasks,
            requested,
            self.config.max_failure_redos,
        );
        while !round.is_complete() {
            if self.shutdown.is_cancelled() {
                return Err(CommitterError::ShutdownAbort {
                    admitted: requested,
                    requested,
                });
            }
            if let Some(attempt) = self.responses.pop() {
                round.on_attempt(attempt);
            }
        }

        let BatchRound {
            output, num_redos, ..
        } = round;
        DELIVERED_COUNT
            .with_label_values(&[BATCH_LABEL])
            .inc_by(output.len() as u64);
        debug!(
            num_requests = requested,
            num_redos,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch executed"
        );
        Ok(output)
    }
}

impl<C> Drop for BatchCommitter<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.workers.join();
    }
}

/// Sequencing state of one `execute` call, indexed by commit id.
struct BatchRound<'a, C> {
    controller: &'a mut C,
    tasks: &'a TaskQueue,
    max_failure_redos: usize,
    // Context and latest response of ids whose attempt has arrived and is not final.
    pending: Vec<Option<(ExecutionContext, ExecutionResponse)>>,
    // Redo asked for while the attempt was executing.
    redo_requested: Vec<bool>,
    undecided: BTreeSet<CommitId>,
    output: Vec<ExecutionResponse>,
    num_redos: usize,
}

impl<'a, C: ConflictController> BatchRound<'a, C> {
    fn new(
        controller: &'a mut C,
        tasks: &'a TaskQueue,
        num_requests: usize,
        max_failure_redos: usize,
    ) -> Self {
        Self {
            controller,
            tasks,
            max_failure_redos,
            pending: (0..num_requests).map(|_| None).collect(),
            redo_requested: vec![false; num_requests],
            undecided: BTreeSet::new(),
            output: Vec::with_capacity(num_requests),
            num_redos: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.output.len() == self.pending.len()
    }

    fn on_attempt(&mut self, attempt: CompletedAttempt) {
        let CompletedAttempt {
            context,
            response,
            change_set,
        } = attempt;
        let commit_id = context.commit_id();
        let index = commit_id as usize;
        assert!(
            self.pending[index].is_none(),
            "Two attempts of commit {} were in flight",
            commit_id
        );
        trace!(commit_id, ret = response.ret, "Attempt received");

        if std::mem::take(&mut self.redo_requested[index]) {
            self.resubmit(context, INVALIDATED_LABEL);
            return;
        }
        if !response.is_success() && context.redo_time() < self.max_failure_redos {
            // Failures are retried before they are allowed to become terminal.
            self.resubmit(context, FAILURE_LABEL);
            return;
        }

        self.controller.record(commit_id, change_set);
        self.pending[index] = Some((context, response));
        self.commit(commit_id);
        self.retry_undecided();
    }

    fn commit(&mut self, commit_id: CommitId) {
        match self.controller.commit(commit_id) {
            CommitDecision::Accepted => {
                self.undecided.remove(&commit_id);
            },
            CommitDecision::Conflict => {
                self.undecided.remove(&commit_id);
                self.redo(commit_id, CONFLICT_LABEL);
            },
            CommitDecision::Undecided => {
                self.undecided.insert(commit_id);
            },
        }
        for redo_id in self.controller.take_redo() {
            self.redo(redo_id, INVALIDATED_LABEL);
        }
        for done_id in self.controller.take_done() {
            self.finalize(done_id);
        }
    }

    /// Retries undecided ids for as long as that finalizes something.
    fn retry_undecided(&mut self) {
        loop {
            let delivered = self.output.len();
            for commit_id in std::mem::take(&mut self.undecided) {
                if self.pending[commit_id as usize].is_some() {
                    self.commit(commit_id);
                }
            }
            if self.output.len() == delivered || self.undecided.is_empty() {
                break;
            }
        }
    }

    fn redo(&mut self, commit_id: CommitId, reason: &'static str) {
        let index = commit_id as usize;
        match self.pending[index].take() {
            Some((context, _)) => {
                self.undecided.remove(&commit_id);
                self.resubmit(context, reason);
            },
            None => self.redo_requested[index] = true,
        }
    }

    fn resubmit(&mut self, mut context: ExecutionContext, reason: &'static str) {
        let commit_id = context.commit_id();
        self.controller.clear(commit_id);
        context.set_redo();
        self.num_redos += 1;
        trace!(commit_id, redo_time = context.redo_time(), reason, "Redo");
        REDO_COUNT.with_label_values(&[BATCH_LABEL, reason]).inc();
        self.tasks.push(context);
    }

    fn finalize(&mut self, commit_id: CommitId) {
        let (_, mut response) = match self.pending[commit_id as usize].take() {
            Some(pending) => pending,
            None => panic!(
                "Commit {} reported done without a stored response",
                commit_id
            ),
        };
        response.change_set = self.controller.change_list(commit_id);
        self.output.push(response);
    }
}
