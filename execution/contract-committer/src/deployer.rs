// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::{DeployError, ExecutionError, StateError},
    state::{AccountHandle, GlobalState},
    task::ContractExecutor,
    types::{Address, Bytes, ExecutionRequest, FunctionSelector},
    view::ExecutionView,
};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// What to deploy: the code identifier, the callable function names and the parameters
/// handed to the constructor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployInfo {
    pub code: Bytes,
    pub functions: Vec<String>,
    pub init_params: Vec<Bytes>,
}

impl DeployInfo {
    pub fn new(code: impl Into<Bytes>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_functions<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.functions.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_init_params(mut self, params: impl IntoIterator<Item = Bytes>) -> Self {
        self.init_params.extend(params);
        self
    }
}

/// Deploys contracts directly into the global state, outside of any pipeline.
///
/// Deployment must not race with pipelines executing against the same contracts: the
/// constructor's writes are applied immediately.
pub struct ContractDeployer<E> {
    executor: Arc<E>,
    state: Arc<GlobalState>,
    nonce: AtomicU64,
    functions: RwLock<HashMap<Address, HashMap<String, FunctionSelector>>>,
}

impl<E: ContractExecutor> ContractDeployer<E> {
    pub fn new(executor: Arc<E>, state: Arc<GlobalState>) -> Self {
        Self {
            executor,
            state,
            nonce: AtomicU64::new(0),
            functions: RwLock::new(HashMap::new()),
        }
    }

    pub fn deploy_contract(
        &self,
        owner: &Address,
        deploy_info: &DeployInfo,
    ) -> Result<Address, DeployError> {
        let address =
            Address::derive_contract_address(owner, self.nonce.fetch_add(1, Ordering::SeqCst));
        self.deploy_contract_at(owner, deploy_info, address)?;
        Ok(address)
    }

    pub fn deploy_contract_at(
        &self,
        owner: &Address,
        deploy_info: &DeployInfo,
        address: Address,
    ) -> Result<(), DeployError> {
        let account = self
            .state
            .create_account(address, deploy_info.code.clone())?;

        let code = match self.run_constructor(owner, account, &deploy_info.init_params) {
            Ok(code) => code,
            Err(error) => {
                warn!(contract = %address, error = %error, "Contract constructor failed");
                self.state.remove_account(&address);
                return Err(DeployError::ConstructorFailed { address, error });
            },
        };
        // A constructor returning code replaces the deployed code.
        if !code.is_empty() {
            self.state.set_code(&address, code)?;
        }

        let selectors = deploy_info
            .functions
            .iter()
            .map(|name| (name.clone(), FunctionSelector::from_name(name)))
            .collect();
        self.functions.write().insert(address, selectors);
        debug!(contract = %address, owner = %owner, "Contract deployed");
        Ok(())
    }

    pub fn function_selector(
        &self,
        contract: &Address,
        name: &str,
    ) -> Result<FunctionSelector, DeployError> {
        self.functions
            .read()
            .get(contract)
            .and_then(|functions| functions.get(name).copied())
            .ok_or_else(|| DeployError::UnknownFunction {
                contract: *contract,
                name: name.to_string(),
            })
    }

    /// Builds a request calling a function registered at deployment by name.
    pub fn new_request(
        &self,
        caller: Address,
        contract: Address,
        name: &str,
        arguments: Vec<Bytes>,
    ) -> Result<ExecutionRequest, DeployError> {
        let function = self.function_selector(&contract, name)?;
        Ok(ExecutionRequest::new(caller, contract, function, arguments))
    }

    pub fn get_contract(&self, address: &Address) -> Result<AccountHandle, StateError> {
        self.state
            .get_account(address)
            .ok_or(StateError::AccountNotFound(*address))
    }

    fn run_constructor(
        &self,
        owner: &Address,
        account: AccountHandle,
        init_params: &[Bytes],
    ) -> Result<Bytes, ExecutionError> {
        let address = *account.address();
        let mut view = ExecutionView::new(&self.state, account, 0, 0);
        let output = catch_unwind(AssertUnwindSafe(|| {
            self.executor.execute_contract(
                owner,
                &address,
                &FunctionSelector::CONSTRUCTOR,
                init_params,
                &mut view,
            )
        }))
        .unwrap_or_else(|payload| Err(ExecutionError::from_panic(payload)))?;

        self.state.apply(&view.into_change_set().writes);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        native::{encode_u64, load_u64, u64_argument, NativeContractExecutor, NativeModule},
        types::StateKey,
    };
    use claims::{assert_err, assert_ok, assert_some_eq};

    fn deployer() -> ContractDeployer<NativeContractExecutor> {
        let module = NativeModule::new()
            .with_constructor(|_, arguments, view| {
                let initial = u64_argument(arguments, 0)?;
                if initial == 0 {
                    return Err(ExecutionError::Reverted("zero supply".into()));
                }
                view.store(b"supply", encode_u64(initial));
                Ok(vec![])
            })
            .with_function("supply()", |_, _, view| {
                Ok(encode_u64(load_u64(view, b"supply")?))
            });
        let executor = NativeContractExecutor::new().with_module("token", module);
        ContractDeployer::new(Arc::new(executor), Arc::new(GlobalState::new()))
    }

    #[test]
    fn test_deploy_runs_constructor() {
        let deployer = deployer();
        let owner = Address::from_u64(1);
        let info = DeployInfo::new("token")
            .with_functions(["supply()"])
            .with_init_params([encode_u64(100)]);

        let first = assert_ok!(deployer.deploy_contract(&owner, &info));
        let second = assert_ok!(deployer.deploy_contract(&owner, &info));
        assert_ne!(first, second);

        assert_eq!(assert_ok!(deployer.get_contract(&first)).code(), b"token");
        assert_some_eq!(
            deployer.state.get(&StateKey::new(first, b"supply".to_vec())),
            encode_u64(100)
        );

        let request = assert_ok!(deployer.new_request(owner, first, "supply()", vec![]));
        assert_eq!(request.function, FunctionSelector::from_name("supply()"));
        assert_err!(deployer.new_request(owner, first, "mint()", vec![]));
    }

    #[test]
    fn test_failed_constructor_removes_account() {
        let deployer = deployer();
        let address = Address::from_u64(77);
        let info = DeployInfo::new("token").with_init_params([encode_u64(0)]);

        let error = assert_err!(deployer.deploy_contract_at(&Address::ZERO, &info, address));
        assert!(matches!(error, DeployError::ConstructorFailed { .. }));
        assert_err!(deployer.get_contract(&address));
        assert!(!deployer.state.exists(&address));
    }

    #[test]
    fn test_deploy_at_occupied_address() {
        let deployer = deployer();
        let address = Address::from_u64(5);
        let info = DeployInfo::new("token").with_init_params([encode_u64(1)]);
        assert_ok!(deployer.deploy_contract_at(&Address::ZERO, &info, address));
        assert_eq!(
            assert_err!(deployer.deploy_contract_at(&Address::ZERO, &info, address)),
            DeployError::State(StateError::AccountAlreadyExists(address))
        );
    }
}
