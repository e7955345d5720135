// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::ConfigError,
    types::{Address, FunctionSelector},
};
use std::{any::Any, time::Duration};
use thiserror::Error;

/// Errors surfaced to callers of the committers. Per-request execution failures are never
/// reported here: they are delivered as failed responses instead.
#[derive(Debug, Error)]
pub enum CommitterError {
    /// Window space did not free up within the configured admission timeout. The
    /// first `admitted` requests were admitted and will be delivered; the caller may
    /// retry the rest.
    #[error("Admission timed out after {waited:?}: {admitted} of {requested} requests admitted")]
    AdmissionTimeout {
        admitted: usize,
        requested: usize,
        waited: Duration,
    },
    /// The pipeline is stopping. In-flight and not-yet-admitted requests get no response.
    #[error("Pipeline is shutting down: {admitted} of {requested} requests admitted")]
    ShutdownAbort { admitted: usize, requested: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to spawn {0} thread: {1}")]
    ThreadSpawn(String, #[source] std::io::Error),
}

pub type CommitterResult<T> = Result<T, CommitterError>;

/// Failure of a single execution attempt, raised by the VM collaborator or at the
/// worker boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Contract {0} does not exist")]
    ContractNotFound(Address),
    #[error("Function {function} not found in contract {contract}")]
    FunctionNotFound {
        contract: Address,
        function: FunctionSelector,
    },
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Execution reverted: {0}")]
    Reverted(String),
    #[error("Execution panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    /// Converts a payload caught by `catch_unwind` into a failure of the attempt.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Account {0} already exists")]
    AccountAlreadyExists(Address),
    #[error("Account {0} does not exist")]
    AccountNotFound(Address),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeployError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Constructor of {address} failed: {error}")]
    ConstructorFailed {
        address: Address,
        error: ExecutionError,
    },
    #[error("Function {name} is not registered for contract {contract}")]
    UnknownFunction { contract: Address, name: String },
}
