// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Continuously fed pipeline delivering responses to a callback in commit id order.
//!
//! Ids are assigned from [`FIRST_COMMIT_ID`] at admission. Admitted contexts go straight to
//! the task queue; a single sequencer thread owns the conflict controller and a ring of
//! `window_size` response slots keyed by `commit_id % window_size`. The sequencer keeps two
//! cursors: `last_id`, the next id it expects to commit in order, and `first_id`, the
//! watermark at or below which every id has been delivered. Admitters only share the
//! watermark, through a mutex and condition variable.

use crate::{
    config::CommitterConfig,
    controller::{CommitDecision, ConflictController},
    counters::{
        ADMISSION_WAIT_SECONDS, ADMITTED_COUNT, CONFLICT_LABEL, DELIVERED_COUNT,
        INVALIDATED_LABEL, REDO_COUNT, STREAMING_IN_FLIGHT, STREAMING_LABEL,
    },
    errors::{CommitterError, CommitterResult},
    queue::{ResponseQueue, ShutdownSignal, TaskQueue},
    state::GlobalState,
    task::ContractExecutor,
    types::{CommitId, ExecutionContext, ExecutionRequest, ExecutionResponse},
    worker::{CompletedAttempt, WorkerPool},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

/// Id of the first request admitted by a [`StreamingCommitter`].
pub const FIRST_COMMIT_ID: CommitId = 1;

pub type ResponseCallback = Box<dyn FnMut(ExecutionResponse) + Send>;

/// State shared between the sequencer and admitters.
struct Shared {
    // Every id at or below this has been delivered.
    first_id: Mutex<CommitId>,
    advanced: Condvar,
    callback: Mutex<Option<ResponseCallback>>,
}

pub struct StreamingCommitter {
    config: CommitterConfig,
    tasks: TaskQueue,
    shared: Arc<Shared>,
    shutdown: ShutdownSignal,
    // Id the next admitted request gets.
    next_id: CommitId,
    workers: WorkerPool,
    sequencer: Option<JoinHandle<()>>,
}

impl StreamingCommitter {
    pub fn new<E, C>(
        config: CommitterConfig,
        executor: Arc<E>,
        state: Arc<GlobalState>,
        mut controller: C,
    ) -> CommitterResult<Self>
    where
        E: ContractExecutor,
        C: ConflictController + 'static,
    {
        config.sanitize()?;
        controller.reset(FIRST_COMMIT_ID);

        let tasks = TaskQueue::new(config.queue_pop_timeout());
        let responses = ResponseQueue::new(config.queue_pop_timeout());
        let shutdown = ShutdownSignal::new();
        let shared = Arc::new(Shared {
            first_id: Mutex::new(FIRST_COMMIT_ID - 1),
            advanced: Condvar::new(),
            callback: Mutex::new(None),
        });

        let mut workers = WorkerPool::spawn(
            STREAMING_LABEL,
            config.num_workers,
            config.pin_workers_to_cores,
            executor,
            state,
            tasks.clone(),
            responses.clone(),
            shutdown.clone(),
        )?;

        let sequencer = Sequencer {
            controller,
            slots: (0..config.window_size).map(|_| None).collect(),
            first_id: FIRST_COMMIT_ID - 1,
            last_id: FIRST_COMMIT_ID,
            worklist: VecDeque::new(),
            undecided: BTreeSet::new(),
            pending_redos: BTreeSet::new(),
            progressed: false,
            tasks: tasks.clone(),
            shared: shared.clone(),
        };
        let sequencer_shutdown = shutdown.clone();
        let spawned = thread::Builder::new()
            .name("streaming_sequencer".to_string())
            .spawn(move || sequencer.run(responses, sequencer_shutdown));
        let sequencer = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                shutdown.cancel();
                workers.join();
                return Err(CommitterError::ThreadSpawn("streaming_sequencer".into(), e));
            },
        };

        info!(
            window_size = config.window_size,
            concurrency_limit = config.concurrency_limit,
            num_workers = config.num_workers,
            "Streaming committer started"
        );
        Ok(Self {
            config,
            tasks,
            shared,
            shutdown,
            next_id: FIRST_COMMIT_ID,
            workers,
            sequencer: Some(sequencer),
        })
    }

    /// Every delivered response is handed to `callback`, in commit id order, on the
    /// sequencer thread. Responses delivered while no callback is set are dropped. A
    /// replacement set while a delivery is running takes over from the next delivery.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(ExecutionResponse) + Send + 'static,
    {
        *self.shared.callback.lock() = Some(Box::new(callback));
    }

    /// Admits `requests` one by one, blocking while the window is full, and returns the
    /// assigned ids once all of them are admitted. Execution continues in the background.
    ///
    /// On error the first `admitted` requests (see the error) were admitted and will
    /// still be delivered.
    pub fn async_execute(
        &mut self,
        requests: Vec<ExecutionRequest>,
    ) -> CommitterResult<Vec<CommitId>> {
        let requested = requests.len();
        let mut commit_ids = Vec::with_capacity(requested);
        for mut request in requests {
            self.wait_next(commit_ids.len(), requested)?;

            let commit_id = self.next_id;
            self.next_id += 1;
            request.set_commit_id(commit_id);
            trace!(commit_id, "Admitted");
            self.tasks.push(ExecutionContext::new(request));
            ADMITTED_COUNT.with_label_values(&[STREAMING_LABEL]).inc();
            STREAMING_IN_FLIGHT.inc();
            commit_ids.push(commit_id);
        }
        Ok(commit_ids)
    }

    /// Blocks until every admitted request has been delivered. Returns false if `timeout`
    /// passes first or the pipeline shuts down.
    pub fn wait_all(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        let last_admitted = self.next_id - 1;
        let mut first_id = self.shared.first_id.lock();
        loop {
            if *first_id >= last_admitted {
                return true;
            }
            if self.shutdown.is_cancelled() {
                return false;
            }
            let mut wait = self.config.admission_poll_interval();
            if let Some(timeout) = timeout {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    return false;
                }
                wait = wait.min(timeout - elapsed);
            }
            self.shared.advanced.wait_for(&mut first_id, wait);
        }
    }

    /// Id the next admitted request will get.
    pub fn next_commit_id(&self) -> CommitId {
        self.next_id
    }

    /// Highest id such that it and every id below it have been delivered.
    pub fn delivered_watermark(&self) -> CommitId {
        *self.shared.first_id.lock()
    }

    /// Admitted requests that have not been delivered yet.
    pub fn num_in_flight(&self) -> usize {
        (self.next_id - 1 - self.delivered_watermark()) as usize
    }

    pub fn config(&self) -> &CommitterConfig {
        &self.config
    }

    /// Stops workers and the sequencer. Undelivered requests are abandoned.
    pub fn shutdown(&mut self) {
        if self.sequencer.is_none() {
            return;
        }
        self.shutdown.cancel();
        self.shared.advanced.notify_all();
        self.workers.join();
        if let Some(handle) = self.sequencer.take() {
            if handle.join().is_err() {
                error!("Streaming sequencer panicked");
            }
        }
        let abandoned = self.num_in_flight();
        STREAMING_IN_FLIGHT.sub(abandoned as i64);
        info!(abandoned, "Streaming committer stopped");
    }

    /// WaitNext: waits until the window admits one more id.
    fn wait_next(&self, admitted: usize, requested: usize) -> CommitterResult<()> {
        let start = Instant::now();
        let limit = self.config.concurrency_limit as CommitId;
        let poll_interval = self.config.admission_poll_interval();
        let admission_timeout = self.config.admission_timeout();

        let mut first_id = self.shared.first_id.lock();
        loop {
            if self.shutdown.is_cancelled() {
                return Err(CommitterError::ShutdownAbort {
                    admitted,
                    requested,
                });
            }
            if self.next_id - 1 - *first_id < limit {
                break;
            }
            let waited = start.elapsed();
            if let Some(timeout) = admission_timeout {
                if waited >= timeout {
                    debug!(admitted, requested, "Admission timed out");
                    return Err(CommitterError::AdmissionTimeout {
                        admitted,
                        requested,
                        waited,
                    });
                }
            }
            self.shared.advanced.wait_for(&mut first_id, poll_interval);
        }
        ADMISSION_WAIT_SECONDS
            .with_label_values(&[STREAMING_LABEL])
            .observe(start.elapsed().as_secs_f64());
        Ok(())
    }
}

impl Drop for StreamingCommitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything the sequencer knows about one id between its first response and delivery.
struct Slot {
    commit_id: CommitId,
    // None while an attempt is executing.
    context: Option<ExecutionContext>,
    response: Option<ExecutionResponse>,
    done: bool,
}

impl Slot {
    fn new(commit_id: CommitId) -> Self {
        Self {
            commit_id,
            context: None,
            response: None,
            done: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Work {
    Commit(CommitId),
    Redo(CommitId, &'static str),
    Done(CommitId),
}

struct Sequencer<C> {
    controller: C,
    slots: Vec<Option<Slot>>,
    first_id: CommitId,
    last_id: CommitId,
    worklist: VecDeque<Work>,
    // Ids whose commit was not decidable, retried after the next delivery.
    undecided: BTreeSet<CommitId>,
    // Redos asked for while the attempt was executing, applied when it arrives.
    pending_redos: BTreeSet<CommitId>,
    // Something was delivered since undecided ids were last retried.
    progressed: bool,
    tasks: TaskQueue,
    shared: Arc<Shared>,
}

impl<C: ConflictController> Sequencer<C> {
    fn run(mut self, responses: ResponseQueue, shutdown: ShutdownSignal) {
        while !shutdown.is_cancelled() {
            if let Some(attempt) = responses.pop() {
                self.on_attempt(attempt);
            }
        }
        debug!(
            first_id = self.first_id,
            last_id = self.last_id,
            "Streaming sequencer stopped"
        );
    }

    fn on_attempt(&mut self, attempt: CompletedAttempt) {
        let CompletedAttempt {
            context,
            response,
            change_set,
        } = attempt;
        let commit_id = context.commit_id();
        assert!(
            commit_id > self.first_id,
            "Received an attempt for commit {} which was already delivered (first_id {})",
            commit_id,
            self.first_id
        );
        trace!(commit_id, redo_time = context.redo_time(), "Attempt received");

        let redo_pending = self.pending_redos.remove(&commit_id);
        let slot = self.slot_entry(commit_id);
        assert!(
            slot.context.is_none() && slot.response.is_none(),
            "Two attempts of commit {} were in flight",
            commit_id
        );
        slot.context = Some(context);
        if redo_pending {
            self.redo(commit_id, INVALIDATED_LABEL);
            return;
        }
        slot.response = Some(response);
        self.controller.record(commit_id, change_set);

        if commit_id < self.last_id {
            self.worklist.push_back(Work::Commit(commit_id));
        }
        self.process();
    }

    /// Runs the worklist and the in-order cursor until neither can make progress.
    fn process(&mut self) {
        loop {
            self.drain();
            if self.advance() {
                continue;
            }
            if std::mem::take(&mut self.progressed) && !self.undecided.is_empty() {
                // Deliveries may have made undecided ids decidable. The one at last_id is
                // retried by advance.
                for commit_id in std::mem::take(&mut self.undecided) {
                    if commit_id != self.last_id {
                        self.worklist.push_back(Work::Commit(commit_id));
                    }
                }
                continue;
            }
            break;
        }
    }

    fn drain(&mut self) {
        while let Some(work) = self.worklist.pop_front() {
            match work {
                Work::Commit(commit_id) => {
                    if self.has_response(commit_id) {
                        self.commit(commit_id);
                    }
                },
                Work::Redo(commit_id, reason) => self.redo(commit_id, reason),
                Work::Done(commit_id) => self.mark_done(commit_id),
            }
        }
    }

    /// Commits the slot at `last_id` if its response is in. Returns whether `last_id` moved.
    fn advance(&mut self) -> bool {
        let commit_id = self.last_id;
        if !self.has_response(commit_id) {
            return false;
        }
        match self.commit(commit_id) {
            CommitDecision::Undecided => false,
            CommitDecision::Accepted | CommitDecision::Conflict => {
                self.last_id += 1;
                true
            },
        }
    }

    fn commit(&mut self, commit_id: CommitId) -> CommitDecision {
        let decision = self.controller.commit(commit_id);
        trace!(commit_id, ?decision, "Commit");
        match decision {
            CommitDecision::Accepted => {
                self.undecided.remove(&commit_id);
            },
            CommitDecision::Conflict => {
                self.undecided.remove(&commit_id);
                self.worklist
                    .push_back(Work::Redo(commit_id, CONFLICT_LABEL));
            },
            CommitDecision::Undecided => {
                self.undecided.insert(commit_id);
            },
        }
        for redo_id in self.controller.take_redo() {
            self.worklist
                .push_back(Work::Redo(redo_id, INVALIDATED_LABEL));
        }
        for done_id in self.controller.take_done() {
            self.worklist.push_back(Work::Done(done_id));
        }
        decision
    }

    /// Clears the controller and sends the context back to the task queue, keeping the id.
    fn redo(&mut self, commit_id: CommitId, reason: &'static str) {
        if commit_id <= self.first_id {
            warn!(commit_id, "Ignoring redo of a delivered commit");
            return;
        }
        let index = self.index(commit_id);
        let mut context = match &mut self.slots[index] {
            Some(slot) if slot.commit_id == commit_id => {
                if slot.done {
                    warn!(commit_id, "Ignoring redo of a finalized commit");
                    return;
                }
                match slot.context.take() {
                    Some(context) => {
                        slot.response = None;
                        context
                    },
                    None => {
                        // The attempt in flight may predate whatever invalidated it.
                        self.pending_redos.insert(commit_id);
                        return;
                    },
                }
            },
            // No attempt arrived yet.
            _ => {
                self.pending_redos.insert(commit_id);
                return;
            },
        };
        self.undecided.remove(&commit_id);
        self.controller.clear(commit_id);
        context.set_redo();
        trace!(commit_id, redo_time = context.redo_time(), reason, "Redo");
        REDO_COUNT
            .with_label_values(&[STREAMING_LABEL, reason])
            .inc();
        self.tasks.push(context);
    }

    fn mark_done(&mut self, commit_id: CommitId) {
        let slot = self.slot_mut(commit_id);
        match slot {
            Some(slot) if slot.response.is_some() => slot.done = true,
            _ => panic!(
                "Commit {} reported done without a stored response",
                commit_id
            ),
        }
        self.undecided.remove(&commit_id);
        self.deliver();
    }

    /// CallBack: hands out done responses in id order and moves the watermark.
    fn deliver(&mut self) {
        let window_size = self.slots.len() as CommitId;
        let mut delivered = 0;
        // Run the callback unlocked so that it may replace itself.
        let mut callback = self.shared.callback.lock().take();
        loop {
            let commit_id = self.first_id + 1;
            let index = (commit_id % window_size) as usize;
            let ready = matches!(
                &self.slots[index],
                Some(slot) if slot.commit_id == commit_id && slot.done
            );
            if !ready {
                break;
            }
            if let Some(response) = self.slots[index].take().and_then(|slot| slot.response) {
                if let Some(callback) = callback.as_mut() {
                    callback(response);
                }
            }
            self.first_id = commit_id;
            delivered += 1;
        }
        if let Some(callback) = callback {
            // A callback set meanwhile wins.
            let mut current = self.shared.callback.lock();
            if current.is_none() {
                *current = Some(callback);
            }
        }

        if delivered > 0 {
            trace!(first_id = self.first_id, delivered, "Delivered");
            self.progressed = true;
            DELIVERED_COUNT
                .with_label_values(&[STREAMING_LABEL])
                .inc_by(delivered);
            STREAMING_IN_FLIGHT.sub(delivered as i64);
            *self.shared.first_id.lock() = self.first_id;
            self.shared.advanced.notify_all();
        }
    }

    fn index(&self, commit_id: CommitId) -> usize {
        (commit_id % self.slots.len() as CommitId) as usize
    }

    fn has_response(&self, commit_id: CommitId) -> bool {
        let index = self.index(commit_id);
        matches!(
            &self.slots[index],
            Some(slot) if slot.commit_id == commit_id && slot.response.is_some() && !slot.done
        )
    }

    fn slot_mut(&mut self, commit_id: CommitId) -> Option<&mut Slot> {
        let index = self.index(commit_id);
        self.slots[index]
            .as_mut()
            .filter(|slot| slot.commit_id == commit_id)
    }

    /// The slot of `commit_id`, created if it has none yet. Another id holding the slot
    /// means the window is too small for the admitted ids.
    fn slot_entry(&mut self, commit_id: CommitId) -> &mut Slot {
        let window_size = self.slots.len();
        let index = self.index(commit_id);
        let slot = self.slots[index].get_or_insert_with(|| Slot::new(commit_id));
        assert_eq!(
            slot.commit_id, commit_id,
            "Window slot {} is held by commit {} while commit {} needs it (window size {})",
            index, slot.commit_id, commit_id, window_size
        );
        slot
    }
}
