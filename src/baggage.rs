//! Baggage restrictions and the audited baggage write path.

use std::fmt::Debug;
use std::sync::Arc;

use crate::common::Tag;
use crate::metrics::Metrics;
use crate::span::Span;
use crate::span_context::SpanContext;

/// Default cap on baggage value length, in bytes.
pub const DEFAULT_MAX_VALUE_LENGTH: usize = 2048;

/// Per-key policy for baggage writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Restriction {
    /// Whether the key may be written at all.
    pub key_allowed: bool,
    /// Maximum value length in bytes; longer values are truncated.
    pub max_value_length: usize,
}

/// Source of per-key baggage policies.
pub trait BaggageRestrictionManager: Debug + Send + Sync {
    fn get_restriction(&self, service: &str, key: &str) -> Restriction;
}

/// Allows every key, with a single value-length cap.
#[derive(Debug)]
pub struct DefaultBaggageRestrictionManager {
    max_value_length: usize,
}

impl DefaultBaggageRestrictionManager {
    pub fn new(max_value_length: usize) -> Self {
        DefaultBaggageRestrictionManager { max_value_length }
    }
}

impl Default for DefaultBaggageRestrictionManager {
    fn default() -> Self {
        DefaultBaggageRestrictionManager::new(DEFAULT_MAX_VALUE_LENGTH)
    }
}

impl BaggageRestrictionManager for DefaultBaggageRestrictionManager {
    fn get_restriction(&self, _service: &str, _key: &str) -> Restriction {
        Restriction {
            key_allowed: true,
            max_value_length: self.max_value_length,
        }
    }
}

/// Applies restrictions to baggage writes and records an audit log on the
/// span for each attempt.
#[derive(Clone, Debug)]
pub struct BaggageSetter {
    restriction_manager: Arc<dyn BaggageRestrictionManager>,
    metrics: Metrics,
}

impl BaggageSetter {
    pub fn new(restriction_manager: Arc<dyn BaggageRestrictionManager>, metrics: Metrics) -> Self {
        BaggageSetter {
            restriction_manager,
            metrics,
        }
    }

    /// Apply a baggage write to `span`, returning the context the span
    /// should adopt. A disallowed key leaves the context unchanged; an
    /// over-long value is truncated at a character boundary.
    pub fn set_baggage(&self, span: &mut Span, key: &str, value: &str) -> SpanContext {
        let service = span.tracer().service_name().to_string();
        let restriction = self.restriction_manager.get_restriction(&service, key);
        if !restriction.key_allowed {
            self.log_fields(span, key, value, false, false, true);
            self.metrics.baggage_update_failure.increment(1);
            return span.context().clone();
        }
        let mut value = value.to_string();
        let mut truncated = false;
        if value.len() > restriction.max_value_length {
            let mut end = restriction.max_value_length;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
            value.truncate(end);
            truncated = true;
            self.metrics.baggage_truncate.increment(1);
        }
        let overridden = span.context().get_baggage_item(key).is_some();
        self.log_fields(span, key, &value, truncated, overridden, false);
        self.metrics.baggage_update_success.increment(1);
        span.context().with_baggage_item(key, value)
    }

    // Audit records cost tag storage on the span, so only sampled spans
    // get them.
    fn log_fields(
        &self,
        span: &mut Span,
        key: &str,
        value: &str,
        truncated: bool,
        overridden: bool,
        invalid: bool,
    ) {
        if !span.context().is_sampled() {
            return;
        }
        let mut fields = vec![
            Tag::new("event", "baggage"),
            Tag::new("key", key.to_string()),
            Tag::new("value", value.to_string()),
        ];
        if overridden {
            fields.push(Tag::new("override", "true"));
        }
        if truncated {
            fields.push(Tag::new("truncated", "true"));
        }
        if invalid {
            fields.push(Tag::new("invalid", "true"));
        }
        span.log(fields);
    }
}
