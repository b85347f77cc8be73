//! Span lifecycle for the request path.
//!
//! Span identities come from [`SpanContext`]; finished spans are handed to a
//! [`SpanReporter`]. Shipping spans to a collector is left to the reporter
//! the host installs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchyard_core::SpanContext;

/// A completed span.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedSpan {
    pub operation: String,
    pub context: SpanContext,
    pub duration: Duration,
    pub tags: BTreeMap<String, String>,
}

/// Receives spans when they finish.
pub trait SpanReporter: Send + Sync + 'static {
    fn report(&self, span: FinishedSpan);
}

/// Drops every span.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl SpanReporter for NoopReporter {
    fn report(&self, _span: FinishedSpan) {}
}

/// Keeps finished spans in memory.
#[derive(Debug, Default)]
pub struct InMemoryReporter {
    spans: Mutex<Vec<FinishedSpan>>,
}

impl InMemoryReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans.lock().clone()
    }

    #[must_use]
    pub fn find(&self, operation: &str) -> Option<FinishedSpan> {
        self.spans
            .lock()
            .iter()
            .find(|s| s.operation == operation)
            .cloned()
    }
}

impl SpanReporter for InMemoryReporter {
    fn report(&self, span: FinishedSpan) {
        self.spans.lock().push(span);
    }
}

/// Starts spans and routes them to a reporter.
#[derive(Clone)]
pub struct Tracer {
    reporter: Arc<dyn SpanReporter>,
}

impl Tracer {
    #[must_use]
    pub fn new(reporter: Arc<dyn SpanReporter>) -> Self {
        Self { reporter }
    }

    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopReporter))
    }

    /// Starts a span. With a parent the span joins the parent's trace,
    /// otherwise it starts a new one.
    #[must_use]
    pub fn start_span(&self, operation: impl Into<String>, parent: Option<&SpanContext>) -> ActiveSpan {
        let context = parent.map_or_else(SpanContext::new_root, SpanContext::child);
        ActiveSpan {
            operation: operation.into(),
            context,
            started: Instant::now(),
            tags: BTreeMap::new(),
            reporter: Arc::clone(&self.reporter),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

/// A span that has started but not yet finished.
pub struct ActiveSpan {
    operation: String,
    context: SpanContext,
    started: Instant,
    tags: BTreeMap<String, String>,
    reporter: Arc<dyn SpanReporter>,
}

impl ActiveSpan {
    #[must_use]
    pub fn context(&self) -> SpanContext {
        self.context
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn finish(self) {
        let span = FinishedSpan {
            operation: self.operation,
            context: self.context,
            duration: self.started.elapsed(),
            tags: self.tags,
        };
        self.reporter.report(span);
    }
}

impl std::fmt::Debug for ActiveSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSpan")
            .field("operation", &self.operation)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
