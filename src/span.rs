//! Span lifecycle: mutation, late sampling, and finish.

use std::time::{Duration, SystemTime};

use crate::common::{LogRecord, Tag, TagValue};
use crate::constants::SAMPLING_PRIORITY_TAG_KEY;
use crate::reporter::SpanData;
use crate::span_context::{SpanContext, TraceFlags};
use crate::tracer::Tracer;

/// Kind of causal link between two spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    /// The referenced span is the direct parent.
    ChildOf,
    /// The referenced span completed before this one started, with no
    /// parent/child relationship.
    FollowsFrom,
}

/// A causal reference from one span to another's context.
#[derive(Clone, Debug)]
pub struct Reference {
    /// How the spans relate.
    pub kind: ReferenceKind,
    /// The referenced span's context.
    pub context: SpanContext,
}

/// A single unit of work within a trace.
///
/// Mutations are accepted while the span is writeable: either the sampling
/// decision is not yet final, or the span is sampled. Once the decision is
/// final and negative, tag, log and baggage writes become no-ops so the
/// span costs nothing beyond its identity.
#[derive(Debug)]
pub struct Span {
    tracer: Tracer,
    context: SpanContext,
    operation_name: String,
    start_time: SystemTime,
    duration: Option<Duration>,
    tags: Vec<Tag>,
    logs: Vec<LogRecord>,
    references: Vec<Reference>,
}

impl Span {
    pub(crate) fn new(
        tracer: Tracer,
        context: SpanContext,
        operation_name: String,
        start_time: SystemTime,
        references: Vec<Reference>,
    ) -> Self {
        Span {
            tracer,
            context,
            operation_name,
            start_time,
            duration: None,
            tags: Vec::new(),
            logs: Vec::new(),
            references,
        }
    }

    /// The span's context.
    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    /// The current operation name.
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// The tracer that created this span.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Tags recorded so far, in insertion order.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Log records attached so far.
    pub fn logs(&self) -> &[LogRecord] {
        &self.logs
    }

    /// Whether mutations are currently accepted.
    pub fn is_writeable(&self) -> bool {
        !self.context.sampling_finalized() || self.context.is_sampled()
    }

    /// Rename the operation. When the sampling decision is still open the
    /// sampler is consulted again under the new name, since per-operation
    /// strategies key on it; either way the decision becomes final.
    pub fn set_operation_name(&mut self, operation_name: impl Into<String>) {
        self.operation_name = operation_name.into();
        if !self.context.sampling_finalized() {
            let mut tags = Vec::new();
            if self
                .tracer
                .sampler()
                .is_sampled(&self.operation_name, &mut tags)
            {
                self.context = self
                    .context
                    .with_flags(self.context.flags() | TraceFlags::SAMPLED);
                self.tags.extend(tags);
            }
            self.context.finalize_sampling();
        }
    }

    /// Record a tag. The `sampling.priority` key is special: a positive
    /// value asks for a debug upgrade (subject to the tracer's throttler),
    /// zero or negative unsamples the span, and either way the decision
    /// becomes final.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        let key = key.into();
        let value = value.into();
        if key == SAMPLING_PRIORITY_TAG_KEY && !self.apply_sampling_priority(&value) {
            return;
        }
        if self.is_writeable() {
            self.tags.push(Tag::new(key, value));
        }
    }

    /// Record several tags at once.
    pub fn add_tags(&mut self, tags: impl IntoIterator<Item = Tag>) {
        for tag in tags {
            let (key, value) = tag.into_parts();
            self.set_tag(key, value);
        }
    }

    // Returns whether the priority change took effect; a rejected change
    // suppresses the tag as well.
    fn apply_sampling_priority(&mut self, value: &TagValue) -> bool {
        let Some(priority) = value.as_f64() else {
            return true;
        };
        self.context.finalize_sampling();
        if priority > 0.0 {
            if self.context.is_debug() {
                return false;
            }
            if self.tracer.is_debug_allowed(&self.operation_name) {
                self.context = self
                    .context
                    .with_flags(self.context.flags() | TraceFlags::SAMPLED | TraceFlags::DEBUG);
                return true;
            }
            return false;
        }
        self.context = self
            .context
            .with_flags(self.context.flags() & !TraceFlags::SAMPLED);
        true
    }

    /// Attach a structured log record with the current timestamp.
    pub fn log(&mut self, fields: impl IntoIterator<Item = Tag>) {
        self.log_with_timestamp(fields, SystemTime::now());
    }

    /// Attach a structured log record with an explicit timestamp.
    pub fn log_with_timestamp(
        &mut self,
        fields: impl IntoIterator<Item = Tag>,
        timestamp: SystemTime,
    ) {
        if !self.is_writeable() {
            return;
        }
        self.logs.push(LogRecord {
            timestamp,
            fields: fields.into_iter().collect(),
        });
    }

    /// Attach a single-field `event` log record.
    pub fn log_event(&mut self, event: impl Into<String>) {
        self.log([Tag::new("event", event.into())]);
    }

    /// Set a baggage item, subject to the tracer's baggage restrictions.
    /// Ignored once the span is final and unsampled; baggage on such spans
    /// would propagate to children that will never be reported.
    pub fn set_baggage_item(&mut self, key: &str, value: impl Into<String>) {
        if !self.is_writeable() {
            return;
        }
        let key = self.tracer.normalize_baggage_key(key);
        let setter = self.tracer.baggage_setter().clone();
        self.context = setter.set_baggage(self, &key, &value.into());
    }

    /// The baggage value for `key`.
    pub fn get_baggage_item(&self, key: &str) -> Option<&str> {
        self.context.get_baggage_item(key)
    }

    /// Finish the span now.
    pub fn finish(&mut self) {
        self.finish_with_timestamp(SystemTime::now());
    }

    /// Finish the span at `finish_time`. Finishing is idempotent in the
    /// sense that a second call logs an error and changes nothing.
    pub fn finish_with_timestamp(&mut self, finish_time: SystemTime) {
        if self.duration.is_some() {
            tracing::error!(
                operation = %self.operation_name,
                "span already finished, ignoring second finish"
            );
            return;
        }
        self.context.finalize_sampling();
        let duration = finish_time
            .duration_since(self.start_time)
            .unwrap_or(Duration::ZERO);
        self.duration = Some(duration);
        if self.context.is_sampled() {
            self.tracer.clone().report_span(self);
        }
    }

    /// Tags with duplicate keys collapsed, keeping the last value written
    /// for each key and the position of its first write.
    pub fn effective_tags(&self) -> Vec<Tag> {
        let mut ordered: Vec<Tag> = Vec::new();
        for tag in &self.tags {
            match ordered.iter_mut().find(|t| t.key() == tag.key()) {
                Some(existing) => *existing = tag.clone(),
                None => ordered.push(tag.clone()),
            }
        }
        ordered
    }

    pub(crate) fn snapshot(&self, service_name: &str) -> SpanData {
        SpanData {
            context: self.context.clone(),
            operation_name: self.operation_name.clone(),
            service_name: service_name.to_string(),
            start_time: self.start_time,
            duration: self.duration.unwrap_or(Duration::ZERO),
            tags: self.tags.clone(),
            logs: self.logs.clone(),
            references: self.references.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SAMPLING_PRIORITY_TAG_KEY;
    use crate::reporter::InMemoryReporter;
    use crate::sampler::{ConstSampler, Sampler};
    use crate::throttler::{DefaultThrottler, Throttler};
    use crate::tracer::Tracer;
    use std::sync::Arc;

    fn tracer_with(sampler: Sampler) -> (Tracer, Arc<InMemoryReporter>) {
        let reporter = Arc::new(InMemoryReporter::new());
        let tracer = Tracer::builder("test-service")
            .with_sampler(sampler)
            .with_reporter(reporter.clone())
            .build();
        (tracer, reporter)
    }

    #[test]
    fn sampled_span_accepts_tags_and_logs() {
        let (tracer, reporter) = tracer_with(Sampler::Const(ConstSampler::new(true)));
        let mut span = tracer.span_builder("get-user").start();
        span.set_tag("http.status_code", 200i64);
        span.log_event("cache-miss");
        span.finish();
        let spans = reporter.get_finished_spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].tags.iter().any(|t| t.key() == "http.status_code"));
        assert_eq!(spans[0].logs.len(), 1);
    }

    #[test]
    fn unsampled_finalized_span_drops_writes() {
        let (tracer, reporter) = tracer_with(Sampler::Const(ConstSampler::new(false)));
        let mut parent = tracer.span_builder("parent").start();
        // creating a child finalizes the parent's decision
        let _child = tracer.span_builder("child").child_of(parent.context()).start();
        assert!(!parent.is_writeable());
        parent.set_tag("ignored", true);
        parent.log_event("ignored");
        parent.set_baggage_item("key", "value");
        assert!(parent.tags().is_empty());
        assert!(parent.logs().is_empty());
        assert_eq!(parent.get_baggage_item("key"), None);
        parent.finish();
        assert!(reporter.get_finished_spans().is_empty());
    }

    #[test]
    fn unfinalized_unsampled_span_still_accepts_writes() {
        let (tracer, _) = tracer_with(Sampler::Const(ConstSampler::new(false)));
        let mut span = tracer.span_builder("op").start();
        assert!(!span.context().is_sampled());
        assert!(span.is_writeable());
        span.set_tag("recorded", true);
        assert_eq!(span.tags().len(), 1);
    }

    #[test]
    fn set_operation_name_resamples_before_finalization() {
        let (tracer, _) = tracer_with(Sampler::Const(ConstSampler::new(true)));
        let mut span = tracer.span_builder("before").start();
        span.set_operation_name("after");
        assert_eq!(span.operation_name(), "after");
        assert!(span.context().sampling_finalized());
        assert!(span.context().is_sampled());
        assert!(span
            .tags()
            .iter()
            .any(|t| t.key() == crate::constants::SAMPLER_TYPE_TAG_KEY));
    }

    #[test]
    fn positive_sampling_priority_upgrades_to_debug() {
        let (tracer, reporter) = tracer_with(Sampler::Const(ConstSampler::new(false)));
        let mut span = tracer.span_builder("op").start();
        span.set_tag(SAMPLING_PRIORITY_TAG_KEY, 1i64);
        assert!(span.context().is_sampled());
        assert!(span.context().is_debug());
        assert!(span
            .tags()
            .iter()
            .any(|t| t.key() == SAMPLING_PRIORITY_TAG_KEY));
        span.finish();
        assert_eq!(reporter.get_finished_spans().len(), 1);
    }

    #[test]
    fn throttled_debug_upgrade_is_rejected() {
        let reporter = Arc::new(InMemoryReporter::new());
        let tracer = Tracer::builder("test-service")
            .with_sampler(Sampler::Const(ConstSampler::new(false)))
            .with_reporter(reporter.clone())
            .with_throttler(Throttler::Default(DefaultThrottler::new(true)))
            .build();
        let mut span = tracer.span_builder("op").start();
        span.set_tag(SAMPLING_PRIORITY_TAG_KEY, 1i64);
        assert!(!span.context().is_sampled());
        assert!(!span.context().is_debug());
        // the rejected priority tag is suppressed
        assert!(span.tags().is_empty());
    }

    #[test]
    fn non_positive_sampling_priority_unsamples() {
        let (tracer, reporter) = tracer_with(Sampler::Const(ConstSampler::new(true)));
        let mut span = tracer.span_builder("op").start();
        span.set_tag(SAMPLING_PRIORITY_TAG_KEY, 0i64);
        assert!(!span.context().is_sampled());
        assert!(span.context().sampling_finalized());
        // unsampled and final, so the priority tag itself is dropped too
        assert!(span.tags().is_empty());
        span.finish();
        assert!(reporter.get_finished_spans().is_empty());
    }

    #[test]
    fn double_finish_reports_once() {
        let (tracer, reporter) = tracer_with(Sampler::Const(ConstSampler::new(true)));
        let mut span = tracer.span_builder("op").start();
        span.finish();
        span.finish();
        assert_eq!(reporter.get_finished_spans().len(), 1);
    }

    #[test]
    fn effective_tags_keep_the_last_value_per_key() {
        let (tracer, _) = tracer_with(Sampler::Const(ConstSampler::new(true)));
        let mut span = tracer.span_builder("op").start();
        span.set_tag("color", "red");
        span.set_tag("size", 10i64);
        span.set_tag("color", "blue");
        let tags = span.effective_tags();
        let colors: Vec<_> = tags.iter().filter(|t| t.key() == "color").collect();
        assert_eq!(colors.len(), 1);
        assert_eq!(colors[0].value().to_string(), "blue");
        assert!(tags.iter().any(|t| t.key() == "size"));
    }

    #[test]
    fn finish_with_timestamp_sets_duration() {
        let (tracer, reporter) = tracer_with(Sampler::Const(ConstSampler::new(true)));
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let mut span = tracer
            .span_builder("op")
            .with_start_time(start)
            .start();
        span.finish_with_timestamp(start + Duration::from_millis(250));
        let spans = reporter.get_finished_spans();
        assert_eq!(spans[0].duration, Duration::from_millis(250));
    }
}
