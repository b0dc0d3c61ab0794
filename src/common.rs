//! Common value types shared by spans, samplers and the baggage subsystem.

use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

/// The value part of a span tag or log field.
///
/// Closed set of scalar types, mirroring the value types the Jaeger wire
/// model can represent.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    /// Boolean values
    Bool(bool),
    /// Signed integer values
    I64(i64),
    /// Floating point values
    F64(f64),
    /// String values
    String(Cow<'static, str>),
}

impl TagValue {
    /// Numeric view of the value, used when interpreting the
    /// sampling-priority tag. Non-numeric values have no priority.
    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::I64(v) => Some(*v as f64),
            TagValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::I64(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::F64(value)
    }
}

impl From<&'static str> for TagValue {
    fn from(value: &'static str) -> Self {
        TagValue::String(Cow::Borrowed(value))
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(Cow::Owned(value))
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => write!(f, "{v}"),
            TagValue::I64(v) => write!(f, "{v}"),
            TagValue::F64(v) => write!(f, "{v}"),
            TagValue::String(v) => write!(f, "{v}"),
        }
    }
}

/// A key/value pair attached to a span.
///
/// Tags are stored as an ordered sequence; duplicate keys are allowed and
/// last-write-wins semantics are only applied when reading through
/// [`Span::effective_tags`](crate::Span::effective_tags).
#[derive(Clone, Debug, PartialEq)]
pub struct Tag {
    key: String,
    value: TagValue,
}

impl Tag {
    /// Create a tag from a key and anything convertible into a [`TagValue`].
    pub fn new(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The tag key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tag value.
    pub fn value(&self) -> &TagValue {
        &self.value
    }

    pub(crate) fn into_parts(self) -> (String, TagValue) {
        (self.key, self.value)
    }
}

/// A timestamped structured log record attached to a span.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Wall-clock time the record was produced.
    pub timestamp: SystemTime,
    /// The record's field set.
    pub fields: Vec<Tag>,
}
