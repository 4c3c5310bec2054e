//! Request-scoped tracing.
//!
//! The span factory is injected rather than ambient so callers can swap the
//! subscriber wiring in tests. Every public operation opens one span and
//! records its terminal error, if any.

use tracing::Span;

use crate::errors::OrchestratorError;

pub trait SpanFactory: Send + Sync {
    fn operation_span(&self, operation: &'static str) -> Span;
}

/// Default factory backed by the process-wide `tracing` subscriber.
pub struct TracingSpanFactory;

impl SpanFactory for TracingSpanFactory {
    fn operation_span(&self, operation: &'static str) -> Span {
        tracing::info_span!(
            "run_operation",
            operation,
            error = tracing::field::Empty
        )
    }
}

pub fn record_error(span: &Span, err: &OrchestratorError) {
    span.record("error", tracing::field::display(err));
    tracing::error!(parent: span, kind = ?err.kind(), "operation failed: {err}");
}
