// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! A fungible token contract: balances keyed by holder address, transfers debit the caller.

use contract_committer::{
    errors::ExecutionError,
    native::{address_argument, encode_u64, load_u64, u64_argument, NativeModule},
    types::{Address, Bytes},
    view::ExecutionView,
};

pub const TOKEN_CODE: &[u8] = b"token";
pub const TOKEN_FUNCTIONS: [&str; 3] = ["transfer", "balance_of", "total_supply"];

const TOTAL_SUPPLY_KEY: &[u8] = b"total_supply";

pub fn balance_key(holder: &Address) -> Bytes {
    let mut key = b"balance/".to_vec();
    key.extend_from_slice(holder.as_bytes());
    key
}

/// Holder `index` (1-based) as minted by the constructor.
pub fn holder(index: u64) -> Address {
    Address::from_u64(index)
}

pub fn token_module() -> NativeModule {
    NativeModule::new()
        .with_constructor(mint)
        .with_function("transfer", transfer)
        .with_function("balance_of", balance_of)
        .with_function("total_supply", |_, _, view| {
            load_u64(view, TOTAL_SUPPLY_KEY).map(encode_u64)
        })
}

/// Arguments: `[num_holders, initial_balance]`.
fn mint(
    _: &Address,
    arguments: &[Bytes],
    view: &mut ExecutionView<'_>,
) -> Result<Bytes, ExecutionError> {
    let num_holders = u64_argument(arguments, 0)?;
    let initial_balance = u64_argument(arguments, 1)?;
    let supply = num_holders.checked_mul(initial_balance).ok_or_else(|| {
        ExecutionError::InvalidArguments("total supply overflows u64".to_string())
    })?;
    for index in 1..=num_holders {
        view.store(&balance_key(&holder(index)), encode_u64(initial_balance));
    }
    view.store(TOTAL_SUPPLY_KEY, encode_u64(supply));
    Ok(vec![])
}

/// Arguments: `[to, amount]`. Returns the caller's remaining balance.
fn transfer(
    caller: &Address,
    arguments: &[Bytes],
    view: &mut ExecutionView<'_>,
) -> Result<Bytes, ExecutionError> {
    let to = address_argument(arguments, 0)?;
    let amount = u64_argument(arguments, 1)?;

    let from_key = balance_key(caller);
    let from_balance = load_u64(view, &from_key)?;
    if from_balance < amount {
        return Err(ExecutionError::Reverted(format!(
            "{} holds {}, cannot send {}",
            caller, from_balance, amount
        )));
    }
    if to == *caller {
        return Ok(encode_u64(from_balance));
    }

    let to_key = balance_key(&to);
    let to_balance = load_u64(view, &to_key)?;
    view.store(&from_key, encode_u64(from_balance - amount));
    view.store(&to_key, encode_u64(to_balance + amount));
    Ok(encode_u64(from_balance - amount))
}

/// Arguments: `[holder]`.
fn balance_of(
    _: &Address,
    arguments: &[Bytes],
    view: &mut ExecutionView<'_>,
) -> Result<Bytes, ExecutionError> {
    let holder = address_argument(arguments, 0)?;
    load_u64(view, &balance_key(&holder)).map(encode_u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use contract_committer::{
        deployer::{ContractDeployer, DeployInfo},
        native::NativeContractExecutor,
        state::GlobalState,
        types::{ExecutionContext, StateKey},
        worker::execute_attempt,
    };
    use std::sync::Arc;

    fn deploy(
        num_holders: u64,
        initial_balance: u64,
    ) -> (
        Arc<GlobalState>,
        ContractDeployer<NativeContractExecutor>,
        Address,
    ) {
        let state = Arc::new(GlobalState::new());
        let executor =
            Arc::new(NativeContractExecutor::new().with_module(TOKEN_CODE, token_module()));
        let deployer = ContractDeployer::new(executor, state.clone());
        let info = DeployInfo::new(TOKEN_CODE)
            .with_functions(TOKEN_FUNCTIONS)
            .with_init_params([encode_u64(num_holders), encode_u64(initial_balance)]);
        let contract = assert_ok!(deployer.deploy_contract(&Address::from_u64(0), &info));
        (state, deployer, contract)
    }

    fn balance(state: &GlobalState, contract: Address, index: u64) -> u64 {
        state
            .get(&StateKey::new(contract, balance_key(&holder(index))))
            .map(|bytes| u64::from_le_bytes(bytes.as_slice().try_into().unwrap()))
            .unwrap_or(0)
    }

    #[test]
    fn test_constructor_mints() {
        let (state, _, contract) = deploy(3, 50);
        for index in 1..=3 {
            assert_eq!(balance(&state, contract, index), 50);
        }
        assert_eq!(balance(&state, contract, 4), 0);
    }

    #[test]
    fn test_transfer_moves_balance() {
        let (state, deployer, contract) = deploy(2, 50);
        let request = assert_ok!(deployer.new_request(
            holder(1),
            contract,
            "transfer",
            vec![holder(2).to_vec(), encode_u64(20)],
        ));
        let executor = NativeContractExecutor::new().with_module(TOKEN_CODE, token_module());
        let completed = execute_attempt(&executor, &state, ExecutionContext::new(request));
        assert!(completed.response.is_success());
        assert_eq!(completed.response.result, encode_u64(30));
        state.apply(&completed.change_set.writes);

        assert_eq!(balance(&state, contract, 1), 30);
        assert_eq!(balance(&state, contract, 2), 70);
    }

    #[test]
    fn test_transfer_reverts_on_insufficient_balance() {
        let (state, deployer, contract) = deploy(2, 5);
        let request = assert_ok!(deployer.new_request(
            holder(1),
            contract,
            "transfer",
            vec![holder(2).to_vec(), encode_u64(6)],
        ));
        let executor = NativeContractExecutor::new().with_module(TOKEN_CODE, token_module());
        let completed = execute_attempt(&executor, &state, ExecutionContext::new(request));
        assert!(!completed.response.is_success());
        assert!(completed.change_set.writes.is_empty());
        assert!(!completed.change_set.reads.is_empty());
    }

    #[test]
    fn test_rejects_overflowing_supply() {
        let state = Arc::new(GlobalState::new());
        let executor =
            Arc::new(NativeContractExecutor::new().with_module(TOKEN_CODE, token_module()));
        let deployer = ContractDeployer::new(executor, state);
        let info = DeployInfo::new(TOKEN_CODE)
            .with_init_params([encode_u64(u64::MAX), encode_u64(2)]);
        assert_err!(deployer.deploy_contract(&Address::from_u64(0), &info));
    }
}
