// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::Parser;
use contract_committer::{CommitterConfig, PersistableConfig};
use contract_committer_benchmark::{run_benchmark, BenchmarkMode, BenchmarkOpts};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(about = "Runs random token transfers through the contract committer")]
struct Opt {
    /// YAML committer config. Flags below override its worker count.
    #[clap(long, value_parser)]
    config: Option<PathBuf>,

    #[clap(long, value_enum, default_value_t = BenchmarkMode::Streaming)]
    mode: BenchmarkMode,

    #[clap(long, default_value_t = 1000)]
    num_accounts: u64,

    #[clap(long, default_value_t = 1_000_000)]
    initial_balance: u64,

    #[clap(long, default_value_t = 100)]
    max_amount: u64,

    #[clap(long, default_value_t = 100_000)]
    num_transfers: usize,

    #[clap(long, default_value_t = 1000)]
    block_size: usize,

    /// Share of transfers sent to the first account.
    #[clap(long, default_value_t = 0.0)]
    hotspot_ratio: f64,

    #[clap(long, default_value_t = 0)]
    seed: u64,

    #[clap(long, env = "COMMITTER_NUM_WORKERS")]
    num_workers: Option<usize>,

    #[clap(long)]
    pin_workers_to_cores: bool,

    /// Emit logs as JSON.
    #[clap(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let opt = Opt::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if opt.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut committer = match &opt.config {
        Some(path) => CommitterConfig::load_config(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => CommitterConfig::default(),
    };
    if let Some(num_workers) = opt.num_workers {
        committer.num_workers = num_workers;
    }
    committer.pin_workers_to_cores |= opt.pin_workers_to_cores;

    let report = run_benchmark(&BenchmarkOpts {
        mode: opt.mode,
        num_holders: opt.num_accounts,
        initial_balance: opt.initial_balance,
        max_amount: opt.max_amount,
        num_transfers: opt.num_transfers,
        block_size: opt.block_size,
        hotspot_ratio: opt.hotspot_ratio,
        seed: opt.seed,
        committer,
    })?;
    println!("{} mode: {}", opt.mode, report);
    Ok(())
}

#[test]
fn verify_tool() {
    use clap::CommandFactory;
    Opt::command().debug_assert()
}
