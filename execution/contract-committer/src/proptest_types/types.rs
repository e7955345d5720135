// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::CommitterConfig,
    controller::{CommitDecision, ConflictController},
    deployer::{ContractDeployer, DeployInfo},
    errors::ExecutionError,
    native::{encode_u64, load_u64, u64_argument, NativeContractExecutor, NativeModule},
    state::GlobalState,
    task::ContractExecutor,
    types::{Address, Bytes, ChangeSet, CommitId, ExecutionRequest, FunctionSelector, StateKey},
    view::ExecutionView,
};
use parking_lot::{Condvar, Mutex};
use proptest::{collection::vec, prelude::*};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

pub const MOCK_CODE: &[u8] = b"mock_contract";

pub fn counter_key(counter: u64) -> Bytes {
    format!("counter_{}", counter).into_bytes()
}

pub fn balance_key(account: u64) -> Bytes {
    format!("balance_{}", account).into_bytes()
}

///////////////////////////////////////////////////////////////////////////
// Gate for holding attempts on a worker
///////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct GateState {
    open: bool,
    entered: usize,
}

/// Holds attempts that pass it until it opens or, so that a forgotten gate can't hang a
/// test, until `max_hold` elapses.
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
    max_hold: Duration,
}

impl Gate {
    pub fn new(max_hold: Duration) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
            max_hold,
        }
    }

    pub fn pass(&self) {
        let start = Instant::now();
        let mut state = self.state.lock();
        state.entered += 1;
        self.changed.notify_all();
        while !state.open {
            let elapsed = start.elapsed();
            if elapsed >= self.max_hold {
                return;
            }
            self.changed.wait_for(&mut state, self.max_hold - elapsed);
        }
    }

    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }

    /// Waits until at least `count` attempts reached the gate.
    pub fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut state = self.state.lock();
        while state.entered < count {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return false;
            }
            self.changed.wait_for(&mut state, timeout - elapsed);
        }
        true
    }
}

///////////////////////////////////////////////////////////////////////////
// Mock contract and executor
///////////////////////////////////////////////////////////////////////////

/// Contract used by the tests:
/// - the constructor gives accounts `0..arg0` a balance of `arg1`;
/// - `increment(counter)` adds one to a counter and returns the new value;
/// - `transfer(from, to, amount)` moves balance and reverts on insufficient funds;
/// - `gated()` blocks on the gate; `sleep(ms)` sleeps; `fail()` reverts; `panic()` panics.
pub fn mock_module(gate: Arc<Gate>) -> NativeModule {
    NativeModule::new()
        .with_constructor(|_, arguments, view| {
            if arguments.is_empty() {
                return Ok(vec![]);
            }
            let num_accounts = u64_argument(arguments, 0)?;
            let initial_balance = u64_argument(arguments, 1)?;
            for account in 0..num_accounts {
                view.store(&balance_key(account), encode_u64(initial_balance));
            }
            Ok(vec![])
        })
        .with_function("increment", |_, arguments, view| {
            let key = counter_key(u64_argument(arguments, 0)?);
            let value = load_u64(view, &key)? + 1;
            view.store(&key, encode_u64(value));
            Ok(encode_u64(value))
        })
        .with_function("transfer", |_, arguments, view| {
            let from = balance_key(u64_argument(arguments, 0)?);
            let to = balance_key(u64_argument(arguments, 1)?);
            let amount = u64_argument(arguments, 2)?;

            let from_balance = load_u64(view, &from)?;
            if from_balance < amount {
                return Err(ExecutionError::Reverted("insufficient balance".into()));
            }
            view.store(&from, encode_u64(from_balance - amount));
            let to_balance = load_u64(view, &to)?;
            view.store(&to, encode_u64(to_balance + amount));
            Ok(encode_u64(from_balance - amount))
        })
        .with_function("gated", move |_, _, _| {
            gate.pass();
            Ok(vec![])
        })
        .with_function("sleep", |_, arguments, _| {
            thread::sleep(Duration::from_millis(u64_argument(arguments, 0)?));
            Ok(vec![])
        })
        .with_function("fail", |_, _, view| {
            view.store(b"failed", vec![1]);
            Err(ExecutionError::Reverted("requested failure".into()))
        })
        .with_function("panic", |_, _, _| panic!("requested panic"))
}

/// Counts attempts on top of the native executor.
pub struct CountingExecutor {
    inner: NativeContractExecutor,
    executions: AtomicUsize,
}

impl CountingExecutor {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl ContractExecutor for CountingExecutor {
    fn execute_contract(
        &self,
        caller: &Address,
        contract: &Address,
        function: &FunctionSelector,
        arguments: &[Bytes],
        view: &mut ExecutionView<'_>,
    ) -> Result<Bytes, ExecutionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.inner
            .execute_contract(caller, contract, function, arguments, view)
    }
}

/// A deployed mock contract with its state and executor.
pub struct MockEnv {
    pub state: Arc<GlobalState>,
    pub executor: Arc<CountingExecutor>,
    pub gate: Arc<Gate>,
    pub contract: Address,
}

impl MockEnv {
    pub fn new() -> Self {
        Self::with_accounts(0, 0)
    }

    pub fn with_accounts(num_accounts: u64, initial_balance: u64) -> Self {
        let gate = Arc::new(Gate::new(Duration::from_secs(2)));
        let state = Arc::new(GlobalState::new());
        let executor = Arc::new(CountingExecutor {
            inner: NativeContractExecutor::new().with_module(MOCK_CODE, mock_module(gate.clone())),
            executions: AtomicUsize::new(0),
        });

        let mut info = DeployInfo::new(MOCK_CODE).with_functions([
            "increment",
            "transfer",
            "gated",
            "sleep",
            "fail",
            "panic",
        ]);
        if num_accounts > 0 {
            info = info.with_init_params([encode_u64(num_accounts), encode_u64(initial_balance)]);
        }
        let deployer = ContractDeployer::new(executor.clone(), state.clone());
        let contract = deployer
            .deploy_contract(&Address::from_u64(1), &info)
            .expect("mock contract must deploy");
        executor.executions.store(0, Ordering::SeqCst);

        Self {
            state,
            executor,
            gate,
            contract,
        }
    }

    pub fn request(&self, function: &str, arguments: Vec<Bytes>) -> ExecutionRequest {
        ExecutionRequest::new(
            Address::from_u64(2),
            self.contract,
            FunctionSelector::from_name(function),
            arguments,
        )
    }

    pub fn increment(&self, counter: u64) -> ExecutionRequest {
        self.request("increment", vec![encode_u64(counter)])
    }

    pub fn transfer(&self, from: u64, to: u64, amount: u64) -> ExecutionRequest {
        self.request("transfer", vec![
            encode_u64(from),
            encode_u64(to),
            encode_u64(amount),
        ])
    }

    pub fn gated(&self) -> ExecutionRequest {
        self.request("gated", vec![])
    }

    pub fn sleep(&self, ms: u64) -> ExecutionRequest {
        self.request("sleep", vec![encode_u64(ms)])
    }

    pub fn read_u64(&self, key: &[u8]) -> u64 {
        self.state
            .get(&StateKey::new(self.contract, key.to_vec()))
            .map(|bytes| {
                u64::from_le_bytes(bytes.as_slice().try_into().expect("u64 slot"))
            })
            .unwrap_or(0)
    }
}

impl Default for MockEnv {
    fn default() -> Self {
        Self::new()
    }
}

pub fn test_config(
    num_workers: usize,
    window_size: usize,
    concurrency_limit: usize,
) -> CommitterConfig {
    CommitterConfig {
        num_workers,
        window_size,
        concurrency_limit,
        queue_pop_timeout_ms: 5,
        admission_poll_interval_ms: 5,
        ..CommitterConfig::default()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TransferGen {
    pub from: u64,
    pub to: u64,
    pub amount: u64,
}

pub fn transfers(
    num_accounts: u64,
    max_amount: u64,
    max_len: usize,
) -> impl Strategy<Value = Vec<TransferGen>> {
    vec(
        (0..num_accounts, 0..num_accounts, 0..max_amount)
            .prop_map(|(from, to, amount)| TransferGen { from, to, amount }),
        1..max_len,
    )
}

///////////////////////////////////////////////////////////////////////////
// Scripted conflict controller
///////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    Record(CommitId),
    Commit(CommitId, CommitDecision),
    Clear(CommitId),
    Reset(CommitId),
}

/// A controller that finalizes in id order and injects conflicts and invalidations from a
/// script instead of looking at the change sets.
#[derive(Default)]
pub struct ScriptedController {
    next: CommitId,
    recorded: HashMap<CommitId, ChangeSet>,
    accepted: BTreeSet<CommitId>,
    // Remaining commit attempts of an id to reject.
    conflicts: HashMap<CommitId, usize>,
    // Ids invalidated when the key id finalizes.
    invalidations: HashMap<CommitId, Vec<CommitId>>,
    reverse_done: bool,
    redo: Vec<CommitId>,
    done: Vec<CommitId>,
    finalized: HashMap<CommitId, ChangeSet>,
    events: Arc<Mutex<Vec<ControllerEvent>>>,
}

impl ScriptedController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conflicts(mut self, commit_id: CommitId, times: usize) -> Self {
        self.conflicts.insert(commit_id, times);
        self
    }

    pub fn with_invalidation(mut self, finalized: CommitId, invalidated: CommitId) -> Self {
        self.invalidations
            .entry(finalized)
            .or_default()
            .push(invalidated);
        self
    }

    /// Report each batch of done ids in descending order.
    pub fn with_reversed_done(mut self) -> Self {
        self.reverse_done = true;
        self
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ControllerEvent>>> {
        self.events.clone()
    }

    fn log(&self, event: ControllerEvent) {
        self.events.lock().push(event);
    }

    fn decide(&mut self, commit_id: CommitId) -> CommitDecision {
        if commit_id < self.next {
            return CommitDecision::Accepted;
        }
        if !self.recorded.contains_key(&commit_id) {
            return CommitDecision::Undecided;
        }
        if let Some(remaining) = self.conflicts.get_mut(&commit_id) {
            if *remaining > 0 {
                *remaining -= 1;
                self.recorded.remove(&commit_id);
                return CommitDecision::Conflict;
            }
        }

        self.accepted.insert(commit_id);
        while self.accepted.remove(&self.next) {
            let finalized = self.next;
            let change_set = self.recorded.remove(&finalized).unwrap_or_default();
            self.finalized.insert(finalized, change_set);
            self.done.push(finalized);
            for invalidated in self.invalidations.remove(&finalized).unwrap_or_default() {
                if invalidated > finalized {
                    self.accepted.remove(&invalidated);
                    self.recorded.remove(&invalidated);
                    self.redo.push(invalidated);
                }
            }
            self.next += 1;
        }
        CommitDecision::Accepted
    }
}

impl ConflictController for ScriptedController {
    fn record(&mut self, commit_id: CommitId, change_set: ChangeSet) {
        self.log(ControllerEvent::Record(commit_id));
        self.accepted.remove(&commit_id);
        self.recorded.insert(commit_id, change_set);
    }

    fn commit(&mut self, commit_id: CommitId) -> CommitDecision {
        let decision = self.decide(commit_id);
        self.log(ControllerEvent::Commit(commit_id, decision));
        decision
    }

    fn take_redo(&mut self) -> Vec<CommitId> {
        std::mem::take(&mut self.redo)
    }

    fn take_done(&mut self) -> Vec<CommitId> {
        let mut done = std::mem::take(&mut self.done);
        if self.reverse_done {
            done.reverse();
        }
        done
    }

    fn clear(&mut self, commit_id: CommitId) {
        self.log(ControllerEvent::Clear(commit_id));
        self.accepted.remove(&commit_id);
        self.recorded.remove(&commit_id);
    }

    fn reset(&mut self, first_commit_id: CommitId) {
        self.log(ControllerEvent::Reset(first_commit_id));
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
