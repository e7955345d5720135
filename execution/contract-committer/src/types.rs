// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256, Sha3_256};
use std::{
    collections::BTreeMap,
    fmt,
    time::Instant,
};

// Type aliases.
pub type CommitId = u64;
pub type Version = u64;
pub type Bytes = Vec<u8>;

/// Version reported for a key that was never written.
pub const UNWRITTEN_VERSION: Version = 0;

/// Account address, displayed as 0x-prefixed hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; Address::LENGTH]);

impl Address {
    pub const LENGTH: usize = 20;
    pub const ZERO: Self = Self([0u8; Self::LENGTH]);

    pub const fn new(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Places `value` big-endian in the trailing 8 bytes. Handy for numbered accounts.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; Self::LENGTH];
        bytes[Self::LENGTH - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; Self::LENGTH]>::try_from(bytes).ok().map(Self)
    }

    /// Contract addresses are derived from the deploying owner and a per-deployer nonce,
    /// so the same deployment sequence yields the same addresses on every replica.
    pub fn derive_contract_address(owner: &Address, nonce: u64) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(owner.as_bytes());
        hasher.update(nonce.to_be_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; Self::LENGTH];
        bytes.copy_from_slice(&digest[digest.len() - Self::LENGTH..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Bytes {
        self.0.to_vec()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// First four bytes of the Keccak-256 hash of a function name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionSelector([u8; 4]);

impl FunctionSelector {
    /// Selector used to invoke a contract's constructor at deployment.
    pub const CONSTRUCTOR: Self = Self([0u8; 4]);

    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn from_name(name: &str) -> Self {
        let digest = Keccak256::digest(name.as_bytes());
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&digest[..4]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for FunctionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for FunctionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A storage slot of one contract account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub address: Address,
    pub key: Bytes,
}

impl StateKey {
    pub fn new(address: Address, key: impl Into<Bytes>) -> Self {
        Self {
            address,
            key: key.into(),
        }
    }
}

/// Observations of one execution attempt: the version of every key it read and the
/// values it wrote. A `None` write removes the key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub reads: BTreeMap<StateKey, Version>,
    pub writes: BTreeMap<StateKey, Option<Bytes>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Keeps the reads so they can still be validated, drops the writes.
    pub fn into_read_set(self) -> Self {
        Self {
            reads: self.reads,
            writes: BTreeMap::new(),
        }
    }
}

/// A contract invocation. `commit_id` is assigned by the committer at admission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub caller_address: Address,
    pub contract_address: Address,
    pub function: FunctionSelector,
    pub arguments: Vec<Bytes>,
    pub user_id: u64,
    commit_id: CommitId,
}

impl ExecutionRequest {
    pub fn new(
        caller_address: Address,
        contract_address: Address,
        function: FunctionSelector,
        arguments: Vec<Bytes>,
    ) -> Self {
        Self {
            caller_address,
            contract_address,
            function,
            arguments,
            user_id: 0,
            commit_id: 0,
        }
    }

    pub fn with_user_id(mut self, user_id: u64) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    pub(crate) fn set_commit_id(&mut self, commit_id: CommitId) {
        self.commit_id = commit_id;
    }
}

/// A request plus its redo state. Owned by exactly one party at a time: the task queue,
/// a worker executing it, or the sequencer's window slot.
#[derive(Debug)]
pub struct ExecutionContext {
    request: ExecutionRequest,
    redo_time: usize,
    admitted_at: Instant,
}

impl ExecutionContext {
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            request,
            redo_time: 0,
            admitted_at: Instant::now(),
        }
    }

    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    pub fn commit_id(&self) -> CommitId {
        self.request.commit_id
    }

    pub fn is_redo(&self) -> bool {
        self.redo_time > 0
    }

    pub fn redo_time(&self) -> usize {
        self.redo_time
    }

    pub fn set_redo(&mut self) {
        self.redo_time += 1;
    }

    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }
}

/// Return code of a successful attempt.
pub const RET_SUCCESS: i32 = 0;
/// Return code of a failed attempt.
pub const RET_FAILURE: i32 = -1;

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionResponse {
    pub commit_id: CommitId,
    pub user_id: u64,
    pub contract_address: Address,
    pub ret: i32,
    pub result: Bytes,
    pub error: Option<String>,
    pub retry_time: usize,
    pub runtime_ms: f64,
    /// The finalized reads and writes, attached by the batch committer.
    pub change_set: Option<ChangeSet>,
}

impl ExecutionResponse {
    pub fn is_success(&self) -> bool {
        self.ret == RET_SUCCESS
    }
}
