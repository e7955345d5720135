// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    token::{balance_key, holder, token_module, TOKEN_CODE, TOKEN_FUNCTIONS},
    workload::TransferGenerator,
};
use anyhow::{ensure, Context, Result};
use clap::ValueEnum;
use contract_committer::{
    deployer::{ContractDeployer, DeployInfo},
    native::{encode_u64, NativeContractExecutor},
    state::GlobalState,
    types::{Address, ExecutionResponse, StateKey},
    BatchCommitter, CommitterConfig, OccController, StreamingCommitter,
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BenchmarkMode {
    Streaming,
    Batch,
}

impl fmt::Display for BenchmarkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BenchmarkOpts {
    pub mode: BenchmarkMode,
    pub num_holders: u64,
    pub initial_balance: u64,
    pub max_amount: u64,
    pub num_transfers: usize,
    pub block_size: usize,
    pub hotspot_ratio: f64,
    pub seed: u64,
    pub committer: CommitterConfig,
}

#[derive(Clone, Debug, Default)]
pub struct BenchmarkReport {
    pub num_delivered: usize,
    pub num_succeeded: usize,
    pub num_failed: usize,
    pub num_retries: usize,
    pub max_retries: usize,
    pub elapsed: Duration,
}

impl BenchmarkReport {
    fn record(&mut self, response: &ExecutionResponse) {
        self.num_delivered += 1;
        if response.is_success() {
            self.num_succeeded += 1;
        } else {
            self.num_failed += 1;
        }
        self.num_retries += response.retry_time;
        self.max_retries = self.max_retries.max(response.retry_time);
    }

    pub fn tps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.num_delivered as f64 / secs
        }
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delivered {} ({} succeeded, {} failed) in {:.3}s, {:.0} tps, {} retries (max {})",
            self.num_delivered,
            self.num_succeeded,
            self.num_failed,
            self.elapsed.as_secs_f64(),
            self.tps(),
            self.num_retries,
            self.max_retries
        )
    }
}

/// Deploys the token, pushes the generated transfers through the chosen committer and
/// checks that the total supply survived.
pub fn run_benchmark(opts: &BenchmarkOpts) -> Result<BenchmarkReport> {
    ensure!(opts.num_holders > 0, "num_holders must be positive");
    ensure!(opts.block_size > 0, "block_size must be positive");

    let state = Arc::new(GlobalState::new());
    let executor =
        Arc::new(NativeContractExecutor::new().with_module(TOKEN_CODE, token_module()));
    let deployer = ContractDeployer::new(executor.clone(), state.clone());
    let info = DeployInfo::new(TOKEN_CODE)
        .with_functions(TOKEN_FUNCTIONS)
        .with_init_params([encode_u64(opts.num_holders), encode_u64(opts.initial_balance)]);
    let contract = deployer
        .deploy_contract(&Address::from_u64(0), &info)
        .context("Failed to deploy the token contract")?;
    info!(contract = %contract, num_holders = opts.num_holders, "Token deployed");

    let mut generator =
        TransferGenerator::new(contract, opts.num_holders, opts.max_amount, opts.seed)
            .with_hotspot_ratio(opts.hotspot_ratio);
    let mut blocks = Vec::new();
    let mut remaining = opts.num_transfers;
    while remaining > 0 {
        let block_size = remaining.min(opts.block_size);
        blocks.push(generator.gen_block(block_size));
        remaining -= block_size;
    }

    let controller = OccController::new(state.clone());
    let report = match opts.mode {
        BenchmarkMode::Streaming => {
            let report = Arc::new(Mutex::new(BenchmarkReport::default()));
            let mut committer = StreamingCommitter::new(
                opts.committer.clone(),
                executor,
                state.clone(),
                controller,
            )?;
            let sink = report.clone();
            committer.set_callback(move |response| sink.lock().record(&response));

            let start = Instant::now();
            for block in blocks {
                committer.async_execute(block)?;
            }
            ensure!(committer.wait_all(None), "Committer shut down before delivering");
            let elapsed = start.elapsed();
            committer.shutdown();

            let mut report = report.lock().clone();
            report.elapsed = elapsed;
            report
        },
        BenchmarkMode::Batch => {
            let mut report = BenchmarkReport::default();
            let mut committer =
                BatchCommitter::new(opts.committer.clone(), executor, state.clone(), controller)?;

            let start = Instant::now();
            for block in blocks {
                for response in committer.execute(block)? {
                    report.record(&response);
                }
            }
            report.elapsed = start.elapsed();
            report
        },
    };

    ensure!(
        report.num_delivered == opts.num_transfers,
        "Delivered {} responses for {} transfers",
        report.num_delivered,
        opts.num_transfers
    );
    let total: u128 = (1..=opts.num_holders)
        .map(|index| {
            state
                .get(&StateKey::new(contract, balance_key(&holder(index))))
                .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
                .map_or(0, |bytes| u64::from_le_bytes(bytes) as u128)
        })
        .sum();
    let supply = opts.num_holders as u128 * opts.initial_balance as u128;
    ensure!(
        total == supply,
        "Total supply changed from {} to {}",
        supply,
        total
    );

    info!(mode = %opts.mode, "{}", report);
    Ok(report)
}
