// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

// Run this bencher via `cargo bench --features fuzzing`.
use contract_committer::{
    proptest_types::types::{test_config, MockEnv},
    BatchCommitter, OccController, StreamingCommitter,
};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

const NUM_REQUESTS: usize = 1000;
const NUM_ACCOUNTS: u64 = 100;

//
// Pipeline benchmarks
//

fn streaming_transfers(c: &mut Criterion) {
    c.bench_function("streaming_transfers", |b| {
        b.iter_batched(
            || {
                let env = MockEnv::with_accounts(NUM_ACCOUNTS, 1_000_000);
                let requests = random_transfers(&env, 0);
                (env, requests)
            },
            |(env, requests)| {
                let mut committer = StreamingCommitter::new(
                    test_config(4, 256, 128),
                    env.executor.clone(),
                    env.state.clone(),
                    OccController::new(env.state.clone()),
                )
                .unwrap();
                committer.async_execute(requests).unwrap();
                assert!(committer.wait_all(Some(Duration::from_secs(60))));
            },
            BatchSize::SmallInput,
        )
    });
}

fn batch_transfers(c: &mut Criterion) {
    c.bench_function("batch_transfers", |b| {
        b.iter_batched(
            || {
                let env = MockEnv::with_accounts(NUM_ACCOUNTS, 1_000_000);
                let requests = random_transfers(&env, 1);
                (env, requests)
            },
            |(env, requests)| {
                let mut committer = BatchCommitter::new(
                    test_config(4, 256, 128),
                    env.executor.clone(),
                    env.state.clone(),
                    OccController::new(env.state.clone()),
                )
                .unwrap();
                assert_eq!(committer.execute(requests).unwrap().len(), NUM_REQUESTS);
            },
            BatchSize::SmallInput,
        )
    });
}

fn streaming_hot_counter(c: &mut Criterion) {
    c.bench_function("streaming_hot_counter", |b| {
        b.iter_batched(
            || {
                let env = MockEnv::new();
                let requests = (0..NUM_REQUESTS).map(|_| env.increment(0)).collect::<Vec<_>>();
                (env, requests)
            },
            |(env, requests)| {
                let mut committer = StreamingCommitter::new(
                    test_config(4, 64, 32),
                    env.executor.clone(),
                    env.state.clone(),
                    OccController::new(env.state.clone()),
                )
                .unwrap();
                committer.async_execute(requests).unwrap();
                assert!(committer.wait_all(Some(Duration::from_secs(60))));
            },
            BatchSize::SmallInput,
        )
    });
}

fn random_transfers(env: &MockEnv, seed: u64) -> Vec<contract_committer::types::ExecutionRequest> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..NUM_REQUESTS)
        .map(|_| {
            env.transfer(
                rng.gen_range(0, NUM_ACCOUNTS),
                rng.gen_range(0, NUM_ACCOUNTS),
                rng.gen_range(1, 100),
            )
        })
        .collect()
}

criterion_group!(
    benches,
    streaming_transfers,
    batch_transfers,
    streaming_hot_counter
);

criterion_main!(benches);
