// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

pub mod runner;
pub mod token;
pub mod workload;

pub use runner::{run_benchmark, BenchmarkMode, BenchmarkOpts, BenchmarkReport};
