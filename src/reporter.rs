//! Reporter seam: where finished spans are handed off.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use crate::common::{LogRecord, Tag};
use crate::span::Reference;
use crate::span_context::SpanContext;

/// Immutable snapshot of a finished span, handed to reporters.
#[derive(Clone, Debug)]
pub struct SpanData {
    /// The span's identity and propagation state.
    pub context: SpanContext,
    /// Operation name at finish time.
    pub operation_name: String,
    /// Name of the service that produced the span.
    pub service_name: String,
    /// Start timestamp.
    pub start_time: SystemTime,
    /// Elapsed time between start and finish.
    pub duration: Duration,
    /// Tags recorded on the span, in insertion order.
    pub tags: Vec<Tag>,
    /// Structured log records attached to the span.
    pub logs: Vec<LogRecord>,
    /// Causal references to other spans.
    pub references: Vec<Reference>,
}

/// Sink for finished, sampled spans.
///
/// Implementations must tolerate `report` being called from multiple
/// threads. `close` flushes whatever the reporter buffers; it is called
/// once during tracer shutdown.
pub trait Reporter: Debug + Send + Sync {
    /// Accept a finished span.
    fn report(&self, span: &SpanData);

    /// Flush and release resources.
    fn close(&self) {}
}

/// Discards every span.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&self, _span: &SpanData) {}
}

/// Collects spans in memory for inspection in tests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryReporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryReporter {
    pub fn new() -> Self {
        InMemoryReporter::default()
    }

    /// Snapshot of the spans reported so far.
    pub fn get_finished_spans(&self) -> Vec<SpanData> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Reporter for InMemoryReporter {
    fn report(&self, span: &SpanData) {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(span.clone());
    }
}

/// Emits a log line per finished span.
#[derive(Debug, Default)]
pub struct LoggingReporter;

impl Reporter for LoggingReporter {
    fn report(&self, span: &SpanData) {
        tracing::info!(
            context = %span.context,
            operation = %span.operation_name,
            duration_us = span.duration.as_micros() as u64,
            "reporting span"
        );
    }
}

/// Fans every span out to a list of delegates.
#[derive(Debug)]
pub struct CompositeReporter {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl CompositeReporter {
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        CompositeReporter { reporters }
    }
}

impl Reporter for CompositeReporter {
    fn report(&self, span: &SpanData) {
        for reporter in &self.reporters {
            reporter.report(span);
        }
    }

    fn close(&self) {
        for reporter in &self.reporters {
            reporter.close();
        }
    }
}
