// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    state::{AccountHandle, GlobalState},
    types::{Address, Bytes, ChangeSet, CommitId, StateKey, Version},
};
use std::collections::BTreeMap;

/// The state seen by one execution attempt of one commit.
///
/// Reads fall through to [`GlobalState`] unless the attempt already wrote the key, and the
/// first observed version of every key is captured. Writes are buffered and never become
/// visible to other attempts: they only reach the global state once the conflict
/// controller finalizes the commit, so a redone attempt leaves no partial effects behind.
pub struct ExecutionView<'a> {
    state: &'a GlobalState,
    account: AccountHandle,
    commit_id: CommitId,
    redo_time: usize,
    reads: BTreeMap<StateKey, Version>,
    writes: BTreeMap<StateKey, Option<Bytes>>,
}

impl<'a> ExecutionView<'a> {
    pub fn new(
        state: &'a GlobalState,
        account: AccountHandle,
        commit_id: CommitId,
        redo_time: usize,
    ) -> Self {
        Self {
            state,
            account,
            commit_id,
            redo_time,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
        }
    }

    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    pub fn redo_time(&self) -> usize {
        self.redo_time
    }

    pub fn account(&self) -> &AccountHandle {
        &self.account
    }

    pub fn contract_address(&self) -> &Address {
        self.account.address()
    }

    pub fn load(&mut self, key: &[u8]) -> Option<Bytes> {
        let state_key = self.state_key(key);
        if let Some(value) = self.writes.get(&state_key) {
            return value.clone();
        }

        let (value, version) = self.state.read(&state_key);
        // Keep the first observation: if the key moved between two reads, validation
        // against the first one is guaranteed to fail.
        self.reads.entry(state_key).or_insert(version);
        value
    }

    pub fn store(&mut self, key: &[u8], value: Bytes) {
        let state_key = self.state_key(key);
        self.writes.insert(state_key, Some(value));
    }

    /// Removes `key`, returning whether it held a value.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let existed = self.load(key).is_some();
        let state_key = self.state_key(key);
        self.writes.insert(state_key, None);
        existed
    }

    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn num_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn into_change_set(self) -> ChangeSet {
        ChangeSet {
            reads: self.reads,
            writes: self.writes,
        }
    }

    /// The observations of an attempt whose writes must be discarded.
    pub fn into_read_set(self) -> ChangeSet {
        self.into_change_set().into_read_set()
    }

    fn state_key(&self, key: &[u8]) -> StateKey {
        StateKey::new(*self.account.address(), key.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_some_eq};

    fn setup() -> (GlobalState, AccountHandle) {
        let state = GlobalState::new();
        let account = state
            .create_account(Address::from_u64(9), b"native".to_vec())
            .unwrap();
        (state, account)
    }

    #[test]
    fn test_reads_record_first_version() {
        let (state, account) = setup();
        let key = StateKey::new(*account.address(), b"a".to_vec());
        let mut writes = BTreeMap::new();
        writes.insert(key.clone(), Some(b"1".to_vec()));
        let version = state.apply(&writes);

        let mut view = ExecutionView::new(&state, account, 3, 0);
        assert_some_eq!(view.load(b"a"), b"1".to_vec());
        state.apply(&writes);
        view.load(b"a");
        assert_none!(view.load(b"missing"));

        let change_set = view.into_change_set();
        assert_eq!(change_set.reads.get(&key), Some(&version));
        assert_eq!(change_set.reads.len(), 2);
        assert!(change_set.writes.is_empty());
    }

    #[test]
    fn test_writes_are_buffered() {
        let (state, account) = setup();
        let address = *account.address();
        let mut view = ExecutionView::new(&state, account, 1, 2);
        assert_eq!(view.redo_time(), 2);

        view.store(b"a", b"x".to_vec());
        assert_some_eq!(view.load(b"a"), b"x".to_vec());
        assert_none!(state.get(&StateKey::new(address, b"a".to_vec())));
        // Reading an own write is not an observation of shared state.
        assert_eq!(view.num_reads(), 0);

        assert!(view.remove(b"a"));
        assert!(!view.remove(b"b"));
        assert_none!(view.load(b"a"));

        let change_set = view.into_change_set();
        assert_eq!(change_set.writes.len(), 2);
        assert_eq!(
            change_set.writes.get(&StateKey::new(address, b"a".to_vec())),
            Some(&None)
        );
    }

    #[test]
    fn test_remove_shared_key() {
        let (state, account) = setup();
        let key = StateKey::new(*account.address(), b"a".to_vec());
        let mut writes = BTreeMap::new();
        writes.insert(key.clone(), Some(b"1".to_vec()));
        let version = state.apply(&writes);

        let mut view = ExecutionView::new(&state, account, 1, 0);
        assert!(view.remove(b"a"));
        assert_none!(view.load(b"a"));
        assert!(!view.remove(b"a"));

        let change_set = view.into_change_set();
        assert_eq!(change_set.reads.get(&key), Some(&version));
        assert_eq!(change_set.writes.get(&key), Some(&None));
        assert_some_eq!(state.get(&key), b"1".to_vec());
    }

    #[test]
    fn test_read_set_drops_writes() {
        let (state, account) = setup();
        let mut view = ExecutionView::new(&state, account, 1, 0);
        view.load(b"a");
        view.store(b"b", vec![1]);
        let read_set = view.into_read_set();
        assert_eq!(read_set.reads.len(), 1);
        assert!(read_set.writes.is_empty());
    }
}
