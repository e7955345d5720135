// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    counters::{EXECUTION_FAILURE_COUNT, EXECUTION_SECONDS},
    errors::{CommitterError, CommitterResult, ExecutionError},
    queue::{ResponseQueue, ShutdownSignal, TaskQueue},
    state::GlobalState,
    task::ContractExecutor,
    types::{ChangeSet, ExecutionContext, ExecutionResponse, RET_FAILURE, RET_SUCCESS},
    view::ExecutionView,
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, info, warn};

/// One finished attempt. The context travels with it so the sequencer can hand it back
/// to the task queue on redo.
#[derive(Debug)]
pub struct CompletedAttempt {
    pub context: ExecutionContext,
    pub response: ExecutionResponse,
    pub change_set: ChangeSet,
}

/// Runs one attempt of `context` against a fresh view of `state`.
///
/// Every failure, including a panic inside the executor, becomes a failed response. A
/// failed attempt keeps its reads so that a stale failure can still be caught by conflict
/// detection, but its writes are dropped.
pub fn execute_attempt<E: ContractExecutor + ?Sized>(
    executor: &E,
    state: &GlobalState,
    context: ExecutionContext,
) -> CompletedAttempt {
    let request = context.request();
    let start = Instant::now();
    let timer = EXECUTION_SECONDS.start_timer();

    let (output, change_set) = match state.get_account(&request.contract_address) {
        Some(account) => {
            let mut view =
                ExecutionView::new(state, account, context.commit_id(), context.redo_time());
            let output = catch_unwind(AssertUnwindSafe(|| {
                executor.execute_contract(
                    &request.caller_address,
                    &request.contract_address,
                    &request.function,
                    &request.arguments,
                    &mut view,
                )
            }))
            .unwrap_or_else(|payload| Err(ExecutionError::from_panic(payload)));
            let change_set = if output.is_ok() {
                view.into_change_set()
            } else {
                view.into_read_set()
            };
            (output, change_set)
        },
        None => (
            Err(ExecutionError::ContractNotFound(request.contract_address)),
            ChangeSet::default(),
        ),
    };
    timer.stop_and_record();
    let runtime_ms = start.elapsed().as_secs_f64() * 1000.0;

    let (ret, result, error) = match output {
        Ok(result) => (RET_SUCCESS, result, None),
        Err(error) => {
            EXECUTION_FAILURE_COUNT.inc();
            debug!(
                commit_id = context.commit_id(),
                redo_time = context.redo_time(),
                error = %error,
                "Execution attempt failed"
            );
            (RET_FAILURE, vec![], Some(error.to_string()))
        },
    };

    let response = ExecutionResponse {
        commit_id: context.commit_id(),
        user_id: request.user_id,
        contract_address: request.contract_address,
        ret,
        result,
        error,
        retry_time: context.redo_time(),
        runtime_ms,
        change_set: None,
    };
    CompletedAttempt {
        context,
        response,
        change_set,
    }
}

/// Fixed set of named worker threads moving contexts from the task queue to the
/// response queue until shutdown.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<E: ContractExecutor>(
        name: &str,
        num_workers: usize,
        pin_to_cores: bool,
        executor: Arc<E>,
        state: Arc<GlobalState>,
        tasks: TaskQueue,
        responses: ResponseQueue,
        shutdown: ShutdownSignal,
    ) -> CommitterResult<Self> {
        let core_ids = if pin_to_cores {
            let core_ids = core_affinity::get_core_ids().unwrap_or_default();
            if core_ids.is_empty() {
                warn!("Core affinity is not supported here, workers will not be pinned");
            }
            core_ids
        } else {
            vec![]
        };

        let mut pool = Self {
            handles: Vec::with_capacity(num_workers),
        };
        for worker_index in 0..num_workers {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[worker_index % core_ids.len()])
            };
            let executor = executor.clone();
            let state = state.clone();
            let tasks = tasks.clone();
            let responses = responses.clone();
            let worker_shutdown = shutdown.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}_worker_{}", name, worker_index))
                .spawn(move || {
                    if let Some(core_id) = core_id {
                        if !core_affinity::set_for_current(core_id) {
                            warn!(worker_index, core = core_id.id, "Failed to pin worker");
                        }
                    }
                    while !worker_shutdown.is_cancelled() {
                        // None is a wake-up to re-check the signal.
                        if let Some(context) = tasks.pop() {
                            responses.push(execute_attempt(executor.as_ref(), &state, context));
                        }
                    }
                });
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    shutdown.cancel();
                    pool.join();
                    return Err(CommitterError::ThreadSpawn(format!("{}_worker", name), e));
                },
            }
        }
        info!(
            pool = name,
            num_workers,
            pinned = !core_ids.is_empty(),
            "Worker pool started"
        );
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to observe shutdown. The signal must be cancelled first.
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked outside of an execution attempt");
            }
        }
    }
}
