// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Speculative parallel execution of contract calls with ordered commits.
//!
//! Requests ("commits") get increasing ids and are executed out of order by a pool of
//! workers, each attempt against a private [`view::ExecutionView`]. A sequencer asks a
//! [`controller::ConflictController`] which attempts are final and which must be redone,
//! and hands out the final responses:
//! - [`streaming::StreamingCommitter`] is fed continuously, bounds the number of undelivered
//!   ids and delivers responses to a callback in id order;
//! - [`batch::BatchCommitter`] runs a known set of requests and returns all responses at
//!   once, in the order they were finalized.

pub mod batch;
pub mod config;
pub mod controller;
pub mod counters;
pub mod deployer;
pub mod errors;
pub mod native;
#[cfg(any(test, feature = "fuzzing"))]
pub mod proptest_types;
pub mod queue;
pub mod state;
pub mod streaming;
pub mod task;
pub mod types;
pub mod view;
pub mod worker;

pub use batch::BatchCommitter;
pub use config::{CommitterConfig, PersistableConfig};
pub use controller::{CommitDecision, ConflictController, OccController};
pub use errors::{CommitterError, CommitterResult, ExecutionError};
pub use streaming::{StreamingCommitter, FIRST_COMMIT_ID};
pub use task::ContractExecutor;
