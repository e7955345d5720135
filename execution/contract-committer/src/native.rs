// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! A contract runtime whose contracts are plain Rust closures.
//!
//! An account's code is an identifier naming a registered [`NativeModule`]. The constructor
//! runs under [`FunctionSelector::CONSTRUCTOR`] with the deployment parameters as arguments.

use crate::{
    errors::ExecutionError,
    task::ContractExecutor,
    types::{Address, Bytes, FunctionSelector},
    view::ExecutionView,
};
use std::{collections::HashMap, fmt, sync::Arc};

pub type NativeFunction = Arc<
    dyn Fn(&Address, &[Bytes], &mut ExecutionView<'_>) -> Result<Bytes, ExecutionError>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct NativeModule {
    constructor: Option<NativeFunction>,
    functions: HashMap<FunctionSelector, (String, NativeFunction)>,
}

impl NativeModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&Address, &[Bytes], &mut ExecutionView<'_>) -> Result<Bytes, ExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.constructor = Some(Arc::new(constructor));
        self
    }

    /// Registers `function` under the selector derived from `name`.
    pub fn with_function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&Address, &[Bytes], &mut ExecutionView<'_>) -> Result<Bytes, ExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(
            FunctionSelector::from_name(name),
            (name.to_string(), Arc::new(function)),
        );
        self
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.values().map(|(name, _)| name.as_str())
    }

    fn resolve(&self, function: &FunctionSelector) -> Option<&NativeFunction> {
        if *function == FunctionSelector::CONSTRUCTOR {
            return self.constructor.as_ref();
        }
        self.functions.get(function).map(|(_, function)| function)
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.function_names().collect();
        names.sort_unstable();
        f.debug_struct("NativeModule")
            .field("constructor", &self.constructor.is_some())
            .field("functions", &names)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct NativeContractExecutor {
    modules: HashMap<Bytes, NativeModule>,
}

impl NativeContractExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `module` the implementation of every account whose code is `code`.
    pub fn register(&mut self, code: impl Into<Bytes>, module: NativeModule) -> &mut Self {
        self.modules.insert(code.into(), module);
        self
    }

    pub fn with_module(mut self, code: impl Into<Bytes>, module: NativeModule) -> Self {
        self.register(code, module);
        self
    }
}

impl ContractExecutor for NativeContractExecutor {
    fn execute_contract(
        &self,
        caller: &Address,
        contract: &Address,
        function: &FunctionSelector,
        arguments: &[Bytes],
        view: &mut ExecutionView<'_>,
    ) -> Result<Bytes, ExecutionError> {
        if view.contract_address() != contract {
            return Err(ExecutionError::ContractNotFound(*contract));
        }
        let module = self
            .modules
            .get(view.account().code())
            .ok_or(ExecutionError::ContractNotFound(*contract))?;

        match module.resolve(function) {
            Some(function) => function(caller, arguments, view),
            // A module without a constructor deploys as is.
            None if *function == FunctionSelector::CONSTRUCTOR => Ok(vec![]),
            None => Err(ExecutionError::FunctionNotFound {
                contract: *contract,
                function: *function,
            }),
        }
    }
}

/// Decodes argument `index` as a little-endian `u64`.
pub fn u64_argument(arguments: &[Bytes], index: usize) -> Result<u64, ExecutionError> {
    let argument = arguments
        .get(index)
        .ok_or_else(|| ExecutionError::InvalidArguments(format!("missing argument {}", index)))?;
    let bytes = <[u8; 8]>::try_from(argument.as_slice()).map_err(|_| {
        ExecutionError::InvalidArguments(format!(
            "argument {} is {} bytes, expected 8",
            index,
            argument.len()
        ))
    })?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn address_argument(arguments: &[Bytes], index: usize) -> Result<Address, ExecutionError> {
    arguments
        .get(index)
        .and_then(|argument| Address::from_slice(argument))
        .ok_or_else(|| {
            ExecutionError::InvalidArguments(format!("argument {} is not an address", index))
        })
}

pub fn encode_u64(value: u64) -> Bytes {
    value.to_le_bytes().to_vec()
}

/// Reads a little-endian `u64` slot, treating a missing slot as zero.
pub fn load_u64(view: &mut ExecutionView<'_>, key: &[u8]) -> Result<u64, ExecutionError> {
    match view.load(key) {
        None => Ok(0),
        Some(bytes) => <[u8; 8]>::try_from(bytes.as_slice())
            .map(u64::from_le_bytes)
            .map_err(|_| {
                ExecutionError::Reverted(format!("corrupt u64 slot {}", hex::encode(key)))
            }),
    }
}
