// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge,
};

pub const STREAMING_LABEL: &str = "streaming";
pub const BATCH_LABEL: &str = "batch";

pub const CONFLICT_LABEL: &str = "conflict";
pub const INVALIDATED_LABEL: &str = "invalidated";
pub const FAILURE_LABEL: &str = "failure";

/// Count of commits admitted into a pipeline.
pub static ADMITTED_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "contract_committer_admitted_count",
        "Count of commits admitted into the pipeline",
        &["mode"]
    )
    .unwrap()
});

/// Count of terminal responses handed back to callers.
pub static DELIVERED_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "contract_committer_delivered_count",
        "Count of terminal responses delivered to the caller",
        &["mode"]
    )
    .unwrap()
});

/// Count of re-executions, by the reason the previous attempt was discarded.
pub static REDO_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "contract_committer_redo_count",
        "Count of commits sent back for re-execution",
        &["mode", "reason"]
    )
    .unwrap()
});

/// Count of attempts that the VM reported as failed (including caught panics).
pub static EXECUTION_FAILURE_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "contract_committer_execution_failure_count",
        "Count of failed execution attempts"
    )
    .unwrap()
});

pub static EXECUTION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "contract_committer_execution_seconds",
        "Time spent executing a single attempt on a worker",
        exponential_buckets(/*start=*/ 1e-6, /*factor=*/ 2.0, /*count=*/ 24).unwrap(),
    )
    .unwrap()
});

/// Time an admitter spent blocked waiting for window space.
pub static ADMISSION_WAIT_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "contract_committer_admission_wait_seconds",
        "Time spent blocked on window admission",
        &["mode"],
        exponential_buckets(/*start=*/ 1e-6, /*factor=*/ 2.0, /*count=*/ 24).unwrap(),
    )
    .unwrap()
});

/// Admitted but not yet delivered commits of the streaming window.
pub static STREAMING_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "contract_committer_streaming_in_flight",
        "Number of admitted commits not yet delivered"
    )
    .unwrap()
});
