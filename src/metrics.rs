//! Counter/gauge seam for internal tracer metrics.
//!
//! The tracer reports its own health through a small set of named
//! instruments. The actual sink is pluggable through [`MetricsFactory`];
//! the default is a no-op. [`InMemoryMetricsFactory`] records counts in
//! memory and is intended for tests and debugging.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// A monotonically increasing counter.
pub trait Counter: Send + Sync {
    /// Add `delta` to the counter.
    fn increment(&self, delta: u64);
}

/// An instrument tracking the latest value of some quantity.
pub trait Gauge: Send + Sync {
    /// Record the current value.
    fn update(&self, value: i64);
}

/// Creates named instruments for the tracer.
///
/// `tags` carry fixed dimensions (e.g. `result=ok`) and are part of the
/// instrument's identity.
pub trait MetricsFactory: Send + Sync {
    /// Create a counter with the given name and fixed tags.
    fn create_counter(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Counter>;
    /// Create a gauge with the given name and fixed tags.
    fn create_gauge(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Gauge>;
}

struct NoopCounter;

impl Counter for NoopCounter {
    fn increment(&self, _delta: u64) {}
}

struct NoopGauge;

impl Gauge for NoopGauge {
    fn update(&self, _value: i64) {}
}

/// A factory producing instruments that discard every value.
#[derive(Default)]
pub struct NoopMetricsFactory;

impl MetricsFactory for NoopMetricsFactory {
    fn create_counter(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn Counter> {
        Arc::new(NoopCounter)
    }

    fn create_gauge(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn Gauge> {
        Arc::new(NoopGauge)
    }
}

/// The full set of instruments the tracer reports on.
#[derive(Clone)]
pub struct Metrics {
    /// Root spans started with the sampled flag set.
    pub traces_started_sampled: Arc<dyn Counter>,
    /// Root spans started without the sampled flag.
    pub traces_started_not_sampled: Arc<dyn Counter>,
    /// Spans continuing a remote trace, sampled.
    pub traces_joined_sampled: Arc<dyn Counter>,
    /// Spans continuing a remote trace, not sampled.
    pub traces_joined_not_sampled: Arc<dyn Counter>,
    /// Sampled spans started, root or not.
    pub spans_started_sampled: Arc<dyn Counter>,
    /// Unsampled spans started, root or not.
    pub spans_started_not_sampled: Arc<dyn Counter>,
    /// Spans handed to the reporter.
    pub spans_finished: Arc<dyn Counter>,
    /// Serialized contexts that failed to decode.
    pub decoding_errors: Arc<dyn Counter>,
    /// Spans successfully reported.
    pub reporter_success: Arc<dyn Counter>,
    /// Spans that failed to report.
    pub reporter_failure: Arc<dyn Counter>,
    /// Spans dropped by the reporter.
    pub reporter_dropped: Arc<dyn Counter>,
    /// Current reporter queue length.
    pub reporter_queue_length: Arc<dyn Gauge>,
    /// Successful sampling-strategy fetches.
    pub sampler_retrieved: Arc<dyn Counter>,
    /// Strategy fetches that changed the active sampler.
    pub sampler_updated: Arc<dyn Counter>,
    /// Failed strategy fetches (transport or HTTP status).
    pub sampler_query_failure: Arc<dyn Counter>,
    /// Strategy responses that parsed but could not be applied.
    pub sampler_update_failure: Arc<dyn Counter>,
    /// Baggage writes that were applied.
    pub baggage_update_success: Arc<dyn Counter>,
    /// Baggage writes rejected by a restriction.
    pub baggage_update_failure: Arc<dyn Counter>,
    /// Baggage values truncated to the restriction length.
    pub baggage_truncate: Arc<dyn Counter>,
    /// Debug-span requests denied by the throttler.
    pub throttled_debug_spans: Arc<dyn Counter>,
    /// Successful credit fetches.
    pub throttler_update_success: Arc<dyn Counter>,
    /// Failed credit fetches.
    pub throttler_update_failure: Arc<dyn Counter>,
}

impl Metrics {
    /// Create the instrument set against the given factory.
    pub fn new(factory: &dyn MetricsFactory) -> Self {
        Metrics {
            traces_started_sampled: factory
                .create_counter("jaeger.traces", &[("state", "started"), ("sampled", "y")]),
            traces_started_not_sampled: factory
                .create_counter("jaeger.traces", &[("state", "started"), ("sampled", "n")]),
            traces_joined_sampled: factory
                .create_counter("jaeger.traces", &[("state", "joined"), ("sampled", "y")]),
            traces_joined_not_sampled: factory
                .create_counter("jaeger.traces", &[("state", "joined"), ("sampled", "n")]),
            spans_started_sampled: factory
                .create_counter("jaeger.started_spans", &[("sampled", "y")]),
            spans_started_not_sampled: factory
                .create_counter("jaeger.started_spans", &[("sampled", "n")]),
            spans_finished: factory.create_counter("jaeger.finished_spans", &[]),
            decoding_errors: factory.create_counter("jaeger.span_context_decoding_errors", &[]),
            reporter_success: factory.create_counter("jaeger.reporter_spans", &[("result", "ok")]),
            reporter_failure: factory.create_counter("jaeger.reporter_spans", &[("result", "err")]),
            reporter_dropped: factory
                .create_counter("jaeger.reporter_spans", &[("result", "dropped")]),
            reporter_queue_length: factory.create_gauge("jaeger.reporter_queue_length", &[]),
            sampler_retrieved: factory.create_counter("jaeger.sampler_queries", &[("result", "ok")]),
            sampler_query_failure: factory
                .create_counter("jaeger.sampler_queries", &[("result", "err")]),
            sampler_updated: factory.create_counter("jaeger.sampler_updates", &[("result", "ok")]),
            sampler_update_failure: factory
                .create_counter("jaeger.sampler_updates", &[("result", "err")]),
            baggage_update_success: factory
                .create_counter("jaeger.baggage_updates", &[("result", "ok")]),
            baggage_update_failure: factory
                .create_counter("jaeger.baggage_updates", &[("result", "err")]),
            baggage_truncate: factory.create_counter("jaeger.baggage_truncations", &[]),
            throttled_debug_spans: factory.create_counter("jaeger.throttled_debug_spans", &[]),
            throttler_update_success: factory
                .create_counter("jaeger.throttler_updates", &[("result", "ok")]),
            throttler_update_failure: factory
                .create_counter("jaeger.throttler_updates", &[("result", "err")]),
        }
    }

    /// An instrument set that records nothing.
    pub fn noop() -> Self {
        Metrics::new(&NoopMetricsFactory)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::noop()
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// A factory recording every value in memory.
///
/// Useful for asserting on tracer behavior in tests, similar in spirit to
/// an in-memory span exporter.
#[derive(Clone, Default)]
pub struct InMemoryMetricsFactory {
    counters: Arc<Mutex<HashMap<String, u64>>>,
    gauges: Arc<Mutex<HashMap<String, i64>>>,
}

impl InMemoryMetricsFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current value of the counter with the given name and tags, or 0
    /// if it was never incremented.
    pub fn counter_value(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        let key = instrument_key(name, tags);
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// The last value recorded on the gauge with the given name and tags.
    pub fn gauge_value(&self, name: &str, tags: &[(&str, &str)]) -> Option<i64> {
        let key = instrument_key(name, tags);
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied()
    }
}

fn instrument_key(name: &str, tags: &[(&str, &str)]) -> String {
    let mut tags: Vec<_> = tags.iter().collect();
    tags.sort();
    let mut key = name.to_string();
    for (tag_key, tag_value) in tags {
        key.push('|');
        key.push_str(tag_key);
        key.push('=');
        key.push_str(tag_value);
    }
    key
}

struct InMemoryCounter {
    key: String,
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl Counter for InMemoryCounter {
    fn increment(&self, delta: u64) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *counters.entry(self.key.clone()).or_insert(0) += delta;
    }
}

struct InMemoryGauge {
    key: String,
    gauges: Arc<Mutex<HashMap<String, i64>>>,
}

impl Gauge for InMemoryGauge {
    fn update(&self, value: i64) {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.key.clone(), value);
    }
}

impl MetricsFactory for InMemoryMetricsFactory {
    fn create_counter(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Counter> {
        Arc::new(InMemoryCounter {
            key: instrument_key(name, tags),
            counters: Arc::clone(&self.counters),
        })
    }

    fn create_gauge(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Gauge> {
        Arc::new(InMemoryGauge {
            key: instrument_key(name, tags),
            gauges: Arc::clone(&self.gauges),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_counters_accumulate() {
        let factory = InMemoryMetricsFactory::new();
        let metrics = Metrics::new(&factory);
        metrics.sampler_retrieved.increment(1);
        metrics.sampler_retrieved.increment(2);
        assert_eq!(
            factory.counter_value("jaeger.sampler_queries", &[("result", "ok")]),
            3
        );
        assert_eq!(
            factory.counter_value("jaeger.sampler_queries", &[("result", "err")]),
            0
        );
    }

    #[test]
    fn instrument_identity_ignores_tag_order() {
        let factory = InMemoryMetricsFactory::new();
        let a = factory.create_counter("c", &[("x", "1"), ("y", "2")]);
        a.increment(1);
        assert_eq!(factory.counter_value("c", &[("y", "2"), ("x", "1")]), 1);
    }
}
