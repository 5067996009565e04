//! Work execution span helpers.
//!
//! Provides span creation and state-transition recording for files
//! flowing through the queue.

use std::path::Path;
use tracing::Span;

use crate::model::ItemState;

/// Start a span for one execution attempt of a file.
///
/// The `work.outcome` field is declared empty and filled via
/// [`record_outcome`].
pub fn start_work_span(path: &Path, attempt: u32) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.path" = %path.display(),
        "work.attempt" = attempt,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: ItemState, to: ItemState) {
    debug_assert!(
        from.can_transition_to(to),
        "illegal item transition {from} -> {to}"
    );
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "state_transition");
    });
}

/// Record the final outcome of the attempt on the span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("work.outcome", outcome);
}
