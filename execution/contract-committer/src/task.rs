// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::ExecutionError,
    types::{Address, Bytes, FunctionSelector},
    view::ExecutionView,
};

/// The contract runtime the workers drive. One instance is shared by every worker thread,
/// so an implementation must be `Sync` and keep per-call state inside the view.
pub trait ContractExecutor: Send + Sync + 'static {
    /// Execute a single contract call against the given view. All storage access must go
    /// through `view`; anything the call does outside of it escapes conflict detection.
    fn execute_contract(
        &self,
        caller: &Address,
        contract: &Address,
        function: &FunctionSelector,
        arguments: &[Bytes],
        view: &mut ExecutionView<'_>,
    ) -> Result<Bytes, ExecutionError>;
}
