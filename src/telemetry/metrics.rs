//! Metric instrument factories for hopper.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! When no provider is installed these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for hopper instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("hopper")
}

/// Counter: submissions to the queue.
/// Labels: `result` ("accepted" | "capacity_exceeded" | "already_queued").
pub fn files_submitted() -> Counter<u64> {
    meter()
        .u64_counter("hopper.files.submitted")
        .with_description("Number of files submitted to the work queue")
        .build()
}

/// Counter: files refused by the admission filter.
/// Labels: `reason` ("extension" | "size" | "not_a_file").
pub fn files_rejected() -> Counter<u64> {
    meter()
        .u64_counter("hopper.files.rejected")
        .with_description("Number of files refused by the admission filter")
        .build()
}

/// Counter: files processed successfully.
pub fn files_processed() -> Counter<u64> {
    meter()
        .u64_counter("hopper.files.processed")
        .with_description("Number of files processed successfully")
        .build()
}

/// Counter: files that failed terminally.
pub fn files_failed() -> Counter<u64> {
    meter()
        .u64_counter("hopper.files.failed")
        .with_description("Number of files that exhausted their retries")
        .build()
}

/// Counter: retries scheduled after a transient failure.
pub fn files_retried() -> Counter<u64> {
    meter()
        .u64_counter("hopper.files.retried")
        .with_description("Number of retries scheduled")
        .build()
}

/// Histogram: wall-clock time of one execution attempt.
/// Labels: `outcome` ("ok" | "error").
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("hopper.execution.duration_ms")
        .with_description("Execution attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Histogram: duration of a single pipeline stage.
/// Labels: `stage`.
pub fn stage_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("hopper.stage.duration_ms")
        .with_description("Pipeline stage duration in milliseconds")
        .with_unit("ms")
        .build()
}
