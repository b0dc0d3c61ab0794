//! Tracer: span creation, context propagation and component wiring.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use rand::Rng;

use crate::baggage::{BaggageRestrictionManager, BaggageSetter, DefaultBaggageRestrictionManager};
use crate::constants::{
    JAEGER_BAGGAGE_HEADER, JAEGER_DEBUG_HEADER, TRACER_STATE_HEADER_NAME,
    TRACE_BAGGAGE_HEADER_PREFIX,
};
use crate::errors::TraceResult;
use crate::metrics::Metrics;
use crate::reporter::{NullReporter, Reporter};
use crate::sampler::{ConstSampler, Sampler};
use crate::span::{Reference, ReferenceKind, Span};
use crate::span_context::{SpanContext, SpanId, TraceFlags, TraceId};
use crate::throttler::Throttler;

const BAGGAGE_KEY_CACHE_CAP: usize = 100;

/// Entry point of the client: creates spans, propagates contexts and ties
/// together the sampler, reporter, throttler and baggage components.
///
/// Cheap to clone; all clones share the same underlying state.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    service_name: String,
    sampler: Sampler,
    reporter: Arc<dyn Reporter>,
    metrics: Metrics,
    baggage_setter: BaggageSetter,
    throttler: Throttler,
    // Fills up to the cap, then stops caching. Never evicts.
    baggage_key_cache: Mutex<HashMap<String, String>>,
    process_uuid: String,
}

impl Tracer {
    /// Start building a tracer for the given service.
    pub fn builder(service_name: impl Into<String>) -> TracerBuilder {
        TracerBuilder::new(service_name)
    }

    /// The service name spans are reported under.
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// The uuid identifying this tracer instance.
    pub fn process_uuid(&self) -> &str {
        &self.inner.process_uuid
    }

    pub(crate) fn sampler(&self) -> &Sampler {
        &self.inner.sampler
    }

    pub(crate) fn baggage_setter(&self) -> &BaggageSetter {
        &self.inner.baggage_setter
    }

    /// Start describing a new span.
    pub fn span_builder(&self, operation_name: impl Into<String>) -> SpanBuilder {
        SpanBuilder {
            tracer: self.clone(),
            operation_name: operation_name.into(),
            references: Vec::new(),
            tags: Vec::new(),
            start_time: None,
        }
    }

    fn start_span(&self, builder: SpanBuilder) -> Span {
        let SpanBuilder {
            operation_name,
            references,
            tags,
            start_time,
            ..
        } = builder;
        let start_time = start_time.unwrap_or_else(SystemTime::now);
        let parent = references
            .iter()
            .find(|r| r.kind == ReferenceKind::ChildOf)
            .or_else(|| references.first())
            .map(|r| r.context.clone());

        let mut sampler_tags = Vec::new();
        let mut internal_tags = Vec::new();
        let context = match &parent {
            Some(parent) if parent.is_valid() => {
                // joining a trace closes the parent's re-sampling window
                parent.finalize_sampling();
                let context = SpanContext::new(
                    parent.trace_id(),
                    random_span_id(),
                    parent.span_id(),
                    parent.flags(),
                )
                .with_baggage_handle(parent.baggage_handle());
                context.finalize_sampling();
                context
            }
            Some(parent)
                if parent.is_debug_id_container_only()
                    && self.is_debug_allowed(&operation_name) =>
            {
                let mut context = self.new_root_context(TraceFlags::SAMPLED | TraceFlags::DEBUG);
                if !parent.baggage().is_empty() {
                    context = context.with_baggage_handle(parent.baggage_handle());
                }
                if let Some(debug_id) = parent.debug_id() {
                    internal_tags
                        .push(crate::common::Tag::new(JAEGER_DEBUG_HEADER, debug_id.to_string()));
                }
                context.finalize_sampling();
                context
            }
            _ => {
                let mut flags = TraceFlags::default();
                let mut context = self.new_root_context(flags);
                // an invalid parent may still carry ad-hoc baggage
                if let Some(parent) = &parent {
                    if !parent.baggage().is_empty() {
                        context = context.with_baggage_handle(parent.baggage_handle());
                    }
                }
                if self
                    .inner
                    .sampler
                    .is_sampled(&operation_name, &mut sampler_tags)
                {
                    flags = flags | TraceFlags::SAMPLED;
                } else {
                    sampler_tags.clear();
                }
                context.with_flags(flags)
            }
        };

        let is_root = !matches!(&parent, Some(p) if p.is_valid());
        if context.is_sampled() {
            self.inner.metrics.spans_started_sampled.increment(1);
            if is_root {
                self.inner.metrics.traces_started_sampled.increment(1);
            }
        } else {
            self.inner.metrics.spans_started_not_sampled.increment(1);
            if is_root {
                self.inner.metrics.traces_started_not_sampled.increment(1);
            }
        }
        if let Some(parent) = &parent {
            if parent.is_valid() && parent.is_remote() {
                if context.is_sampled() {
                    self.inner.metrics.traces_joined_sampled.increment(1);
                } else {
                    self.inner.metrics.traces_joined_not_sampled.increment(1);
                }
            }
        }

        let mut span = Span::new(self.clone(), context, operation_name, start_time, references);
        for tag in sampler_tags {
            let (key, value) = tag.into_parts();
            span.set_tag(key, value);
        }
        for tag in internal_tags {
            let (key, value) = tag.into_parts();
            span.set_tag(key, value);
        }
        span.add_tags(tags);
        span
    }

    fn new_root_context(&self, flags: TraceFlags) -> SpanContext {
        let trace_id = random_trace_id();
        SpanContext::new(trace_id, random_span_id(), SpanId::INVALID, flags)
    }

    pub(crate) fn is_debug_allowed(&self, operation: &str) -> bool {
        self.inner.throttler.is_allowed(operation)
    }

    pub(crate) fn report_span(&self, span: &Span) {
        self.inner.metrics.spans_finished.increment(1);
        self.inner
            .reporter
            .report(&span.snapshot(&self.inner.service_name));
    }

    /// Write `context` into a text-map carrier: the context string under
    /// `uber-trace-id` and one `uberctx-` entry per baggage item.
    /// Serializing freezes the sampling decision.
    pub fn inject(&self, context: &SpanContext, carrier: &mut HashMap<String, String>) {
        context.finalize_sampling();
        carrier.insert(TRACER_STATE_HEADER_NAME.to_string(), context.to_string());
        for (key, value) in context.baggage() {
            carrier.insert(format!("{TRACE_BAGGAGE_HEADER_PREFIX}{key}"), value.clone());
        }
    }

    /// Read a context out of a text-map carrier. Returns `Ok(None)` when
    /// the carrier holds no trace state at all; a carrier with a malformed
    /// context string is a decode error, counted and surfaced.
    pub fn extract(
        &self,
        carrier: &HashMap<String, String>,
    ) -> TraceResult<Option<SpanContext>> {
        let mut context: Option<SpanContext> = None;
        let mut baggage = HashMap::new();
        let mut debug_id = None;
        for (key, value) in carrier {
            let key = key.to_lowercase();
            if key == TRACER_STATE_HEADER_NAME {
                match value.parse::<SpanContext>() {
                    Ok(parsed) => context = Some(parsed),
                    Err(e) => {
                        self.inner.metrics.decoding_errors.increment(1);
                        return Err(e);
                    }
                }
            } else if let Some(suffix) = key.strip_prefix(TRACE_BAGGAGE_HEADER_PREFIX) {
                baggage.insert(self.normalize_baggage_key(suffix), value.clone());
            } else if key == JAEGER_DEBUG_HEADER {
                debug_id = Some(value.clone());
            } else if key == JAEGER_BAGGAGE_HEADER {
                // ad-hoc baggage: "k1=v1, k2=v2"
                for pair in value.split(',') {
                    if let Some((k, v)) = pair.split_once('=') {
                        baggage.insert(self.normalize_baggage_key(k.trim()), v.trim().to_string());
                    }
                }
            }
        }
        let mut context = match (context, &debug_id) {
            (Some(context), _) => context,
            (None, Some(debug_id)) => SpanContext::debug_id_only(debug_id.clone()),
            (None, None) if !baggage.is_empty() => SpanContext::new(
                TraceId::INVALID,
                SpanId::INVALID,
                SpanId::INVALID,
                TraceFlags::default(),
            ),
            (None, None) => return Ok(None),
        };
        if !baggage.is_empty() {
            context = context.with_baggage_handle(Arc::new(baggage));
        }
        if let (Some(debug_id), true) = (debug_id, context.is_valid()) {
            context = context.with_debug_id(debug_id);
        }
        Ok(Some(context))
    }

    /// Lowercase the key and map `_` to `-`, caching results up to a fixed
    /// cap.
    pub(crate) fn normalize_baggage_key(&self, key: &str) -> String {
        let mut cache = self
            .inner
            .baggage_key_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(normalized) = cache.get(key) {
            return normalized.clone();
        }
        let normalized = key.to_lowercase().replace('_', "-");
        if cache.len() < BAGGAGE_KEY_CACHE_CAP {
            cache.insert(key.to_string(), normalized.clone());
        }
        normalized
    }

    /// Shut down the sampler, throttler and reporter.
    pub fn close(&self) {
        self.inner.sampler.close();
        self.inner.throttler.close();
        self.inner.reporter.close();
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("service_name", &self.inner.service_name)
            .field("sampler", &self.inner.sampler)
            .finish()
    }
}

/// Configures and constructs a [`Tracer`].
pub struct TracerBuilder {
    service_name: String,
    sampler: Sampler,
    reporter: Arc<dyn Reporter>,
    metrics: Metrics,
    throttler: Throttler,
    baggage_restriction_manager: Arc<dyn BaggageRestrictionManager>,
}

impl TracerBuilder {
    fn new(service_name: impl Into<String>) -> Self {
        TracerBuilder {
            service_name: service_name.into(),
            sampler: Sampler::Const(ConstSampler::new(true)),
            reporter: Arc::new(NullReporter),
            metrics: Metrics::noop(),
            throttler: Throttler::default(),
            baggage_restriction_manager: Arc::new(DefaultBaggageRestrictionManager::default()),
        }
    }

    /// Sampling strategy for new traces. Defaults to sampling everything.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Sink for finished spans. Defaults to discarding them.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Instrument set for internal counters. Defaults to no-op.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Debug-span admission policy. Defaults to allowing everything.
    pub fn with_throttler(mut self, throttler: Throttler) -> Self {
        self.throttler = throttler;
        self
    }

    /// Baggage write policy. Defaults to allow-all with a length cap.
    pub fn with_baggage_restriction_manager(
        mut self,
        manager: Arc<dyn BaggageRestrictionManager>,
    ) -> Self {
        self.baggage_restriction_manager = manager;
        self
    }

    pub fn build(self) -> Tracer {
        let process_uuid = format!("{:032x}", rand::rng().random::<u128>());
        self.throttler.set_process(process_uuid.clone());
        let baggage_setter =
            BaggageSetter::new(self.baggage_restriction_manager, self.metrics.clone());
        Tracer {
            inner: Arc::new(TracerInner {
                service_name: self.service_name,
                sampler: self.sampler,
                reporter: self.reporter,
                metrics: self.metrics,
                baggage_setter,
                throttler: self.throttler,
                baggage_key_cache: Mutex::new(HashMap::new()),
                process_uuid,
            }),
        }
    }
}

/// Describes a span before it starts.
pub struct SpanBuilder {
    tracer: Tracer,
    operation_name: String,
    references: Vec<Reference>,
    tags: Vec<crate::common::Tag>,
    start_time: Option<SystemTime>,
}

impl SpanBuilder {
    /// Make the new span a child of `parent`.
    pub fn child_of(mut self, parent: &SpanContext) -> Self {
        self.references.push(Reference {
            kind: ReferenceKind::ChildOf,
            context: parent.clone(),
        });
        self
    }

    /// Link the new span after `context` without a parent relationship.
    pub fn follows_from(mut self, context: &SpanContext) -> Self {
        self.references.push(Reference {
            kind: ReferenceKind::FollowsFrom,
            context: context.clone(),
        });
        self
    }

    /// Record a tag at start time.
    pub fn with_tag(mut self, tag: crate::common::Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Use an explicit start timestamp instead of "now".
    pub fn with_start_time(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Start the span.
    pub fn start(self) -> Span {
        let tracer = self.tracer.clone();
        tracer.start_span(self)
    }
}

fn random_trace_id() -> TraceId {
    let mut rng = rand::rng();
    loop {
        let id = rng.random::<u128>();
        if id != 0 {
            return TraceId::from(id);
        }
    }
}

fn random_span_id() -> SpanId {
    let mut rng = rand::rng();
    loop {
        let id = rng.random::<u64>();
        if id != 0 {
            return SpanId::from(id);
        }
    }
}
