// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::StateError,
    types::{Address, Bytes, StateKey, Version, UNWRITTEN_VERSION},
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// A contract account. The code identifies what the VM runs for calls to this address.
#[derive(Debug, PartialEq, Eq)]
pub struct Account {
    address: Address,
    code: Bytes,
}

impl Account {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

pub type AccountHandle = Arc<Account>;

#[derive(Clone, Debug)]
struct VersionedValue {
    // None is a tombstone left by a removal, so that the removal still bumps the version.
    value: Option<Bytes>,
    version: Version,
}

/// The shared account registry and storage that speculative attempts read from.
///
/// Workers only ever read; writes land through [`GlobalState::apply`] once the conflict
/// controller finalizes a commit (or directly at deployment). Every application gets a
/// fresh version, so an attempt's recorded read versions identify exactly what it saw.
pub struct GlobalState {
    accounts: DashMap<Address, AccountHandle>,
    storage: DashMap<StateKey, VersionedValue>,
    latest_version: AtomicU64,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            storage: DashMap::new(),
            latest_version: AtomicU64::new(UNWRITTEN_VERSION),
        }
    }

    pub fn create_account(
        &self,
        address: Address,
        code: Bytes,
    ) -> Result<AccountHandle, StateError> {
        match self.accounts.entry(address) {
            Entry::Occupied(_) => Err(StateError::AccountAlreadyExists(address)),
            Entry::Vacant(entry) => {
                let account = Arc::new(Account { address, code });
                entry.insert(account.clone());
                Ok(account)
            },
        }
    }

    pub fn get_account(&self, address: &Address) -> Option<AccountHandle> {
        self.accounts.get(address).map(|account| account.value().clone())
    }

    pub fn exists(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    /// Removes the account registration. Its storage is left untouched.
    pub fn remove_account(&self, address: &Address) -> bool {
        self.accounts.remove(address).is_some()
    }

    pub fn set_code(&self, address: &Address, code: Bytes) -> Result<AccountHandle, StateError> {
        let mut account = self
            .accounts
            .get_mut(address)
            .ok_or(StateError::AccountNotFound(*address))?;
        let updated = Arc::new(Account {
            address: *address,
            code,
        });
        *account = updated.clone();
        Ok(updated)
    }

    /// Returns the current value of `key` and the version that wrote it.
    pub fn read(&self, key: &StateKey) -> (Option<Bytes>, Version) {
        self.storage
            .get(key)
            .map(|entry| (entry.value.clone(), entry.version))
            .unwrap_or((None, UNWRITTEN_VERSION))
    }

    pub fn version_of(&self, key: &StateKey) -> Version {
        self.storage
            .get(key)
            .map(|entry| entry.version)
            .unwrap_or(UNWRITTEN_VERSION)
    }

    pub fn get(&self, key: &StateKey) -> Option<Bytes> {
        self.read(key).0
    }

    /// Applies the writes of one finalized commit under a single new version.
    pub fn apply(&self, writes: &BTreeMap<StateKey, Option<Bytes>>) -> Version {
        let version = self.latest_version.fetch_add(1, Ordering::SeqCst) + 1;
        for (key, value) in writes {
            self.storage.insert(key.clone(), VersionedValue {
                value: value.clone(),
                version,
            });
        }
        version
    }

    pub fn latest_version(&self) -> Version {
        self.latest_version.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_none, assert_ok, assert_some_eq};

    #[test]
    fn test_account_lifecycle() {
        let state = GlobalState::new();
        let address = Address::from_u64(1);
        assert_none!(state.get_account(&address));

        assert_ok!(state.create_account(address, b"code".to_vec()));
        assert_eq!(
            assert_err!(state.create_account(address, vec![])),
            StateError::AccountAlreadyExists(address)
        );
        assert_eq!(state.get_account(&address).unwrap().code(), b"code");

        assert_ok!(state.set_code(&address, b"new".to_vec()));
        assert_eq!(state.get_account(&address).unwrap().code(), b"new");

        assert!(state.remove_account(&address));
        assert!(!state.exists(&address));
        assert_err!(state.set_code(&address, vec![]));
    }

    #[test]
    fn test_apply_bumps_version_and_keeps_tombstones() {
        let state = GlobalState::new();
        let key = StateKey::new(Address::from_u64(1), b"k".to_vec());
        assert_eq!(state.read(&key), (None, UNWRITTEN_VERSION));

        let mut writes = BTreeMap::new();
        writes.insert(key.clone(), Some(b"v".to_vec()));
        let first = state.apply(&writes);
        assert_some_eq!(state.get(&key), b"v".to_vec());
        assert_eq!(state.version_of(&key), first);

        writes.insert(key.clone(), None);
        let second = state.apply(&writes);
        assert!(second > first);
        assert_eq!(state.read(&key), (None, second));
        assert_eq!(state.latest_version(), second);
    }
}
