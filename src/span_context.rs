//! Span identity: trace/span ids, flags and the immutable span context.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::TraceError;

/// Flags carried by a [`SpanContext`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// The span has been sampled and will be reported.
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);

    /// The span was forced to be sampled via a debug override.
    pub const DEBUG: TraceFlags = TraceFlags(0x02);

    /// Construct flags from their wire representation.
    pub const fn new(flags: u8) -> Self {
        TraceFlags(flags)
    }

    /// Whether the sampled flag is set.
    pub fn is_sampled(&self) -> bool {
        (*self & TraceFlags::SAMPLED) == TraceFlags::SAMPLED
    }

    /// Whether the debug flag is set.
    pub fn is_debug(&self) -> bool {
        (*self & TraceFlags::DEBUG) == TraceFlags::DEBUG
    }

    /// The flags as a `u8`.
    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl BitAnd for TraceFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for TraceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl Not for TraceFlags {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl fmt::LowerHex for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A 16-byte value identifying a trace.
///
/// Valid when non-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// Invalid trace id.
    pub const INVALID: TraceId = TraceId(0);

    /// Converts a string in base 16 to a trace id.
    pub fn from_hex(hex: &str) -> Result<Self, std::num::ParseIntError> {
        u128::from_str_radix(hex, 16).map(TraceId)
    }

    /// The id as a `u128`.
    pub const fn to_u128(self) -> u128 {
        self.0
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("TraceId({:x})", self.0))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:x}", self.0))
    }
}

impl fmt::LowerHex for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// An 8-byte value identifying a span within a trace.
///
/// Valid when non-zero; zero doubles as "no parent" in the wire format.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// Invalid span id.
    pub const INVALID: SpanId = SpanId(0);

    /// Converts a string in base 16 to a span id.
    pub fn from_hex(hex: &str) -> Result<Self, std::num::ParseIntError> {
        u64::from_str_radix(hex, 16).map(SpanId)
    }

    /// The id as a `u64`.
    pub const fn to_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("SpanId({:x})", self.0))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:x}", self.0))
    }
}

impl fmt::LowerHex for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Immutable identity and propagation state of a span.
///
/// Contexts are values: baggage changes produce a new context through
/// [`SpanContext::with_baggage_item`] so existing clones held by ancestor
/// or sibling spans are never disturbed. The one piece of state shared by
/// all clones of a span's context is the sampling-finalization bit, which
/// closes the re-sampling window for every holder at once.
///
/// Sampling finalization happens when any of these occur: the decision was
/// inherited from an already-finalized parent, a debug override was
/// granted, the span finished, the operation name was set, the context was
/// handed to a child span, or the context was serialized for propagation.
#[derive(Clone, Debug)]
pub struct SpanContext {
    trace_id: TraceId,
    span_id: SpanId,
    parent_id: SpanId,
    flags: TraceFlags,
    baggage: Arc<HashMap<String, String>>,
    debug_id: Option<String>,
    is_remote: bool,
    finalized: Arc<AtomicBool>,
}

impl SpanContext {
    /// Create a context from its parts. `SpanId::INVALID` as `parent_id`
    /// means "no parent".
    pub fn new(trace_id: TraceId, span_id: SpanId, parent_id: SpanId, flags: TraceFlags) -> Self {
        SpanContext {
            trace_id,
            span_id,
            parent_id,
            flags,
            baggage: Arc::new(HashMap::new()),
            debug_id: None,
            is_remote: false,
            finalized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context carrying only a debug correlation id, used when a carrier
    /// requests a forced debug trace without an existing trace context.
    pub fn debug_id_only(debug_id: impl Into<String>) -> Self {
        let mut context = SpanContext::new(
            TraceId::INVALID,
            SpanId::INVALID,
            SpanId::INVALID,
            TraceFlags::default(),
        );
        context.debug_id = Some(debug_id.into());
        context
    }

    /// The trace id.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The span id.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The parent span id, `SpanId::INVALID` for roots.
    pub fn parent_id(&self) -> SpanId {
        self.parent_id
    }

    /// The context flags.
    pub fn flags(&self) -> TraceFlags {
        self.flags
    }

    /// The debug correlation id, if one was extracted from a carrier.
    pub fn debug_id(&self) -> Option<&str> {
        self.debug_id.as_deref()
    }

    /// Whether both trace and span ids are present.
    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
    }

    /// Whether this context originated from a carrier rather than being
    /// created in-process.
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// Whether the span is sampled.
    pub fn is_sampled(&self) -> bool {
        self.flags.is_sampled()
    }

    /// Whether the span carries a debug override.
    pub fn is_debug(&self) -> bool {
        self.flags.is_debug()
    }

    /// Whether this context only carries a debug correlation id.
    pub fn is_debug_id_container_only(&self) -> bool {
        !self.is_valid() && self.debug_id.is_some()
    }

    /// The baggage mapping.
    pub fn baggage(&self) -> &HashMap<String, String> {
        &self.baggage
    }

    pub(crate) fn baggage_handle(&self) -> Arc<HashMap<String, String>> {
        Arc::clone(&self.baggage)
    }

    /// The baggage value for `key`.
    pub fn get_baggage_item(&self, key: &str) -> Option<&str> {
        self.baggage.get(key).map(String::as_str)
    }

    /// A new context with `key` set in the baggage, sharing every other
    /// field with this one. Baggage is never mutated in place so contexts
    /// already shared with other spans stay unchanged.
    pub fn with_baggage_item(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut baggage = (*self.baggage).clone();
        baggage.insert(key.into(), value.into());
        SpanContext {
            baggage: Arc::new(baggage),
            ..self.clone()
        }
    }

    pub(crate) fn with_flags(&self, flags: TraceFlags) -> Self {
        SpanContext {
            flags,
            ..self.clone()
        }
    }

    pub(crate) fn with_baggage_handle(&self, baggage: Arc<HashMap<String, String>>) -> Self {
        SpanContext {
            baggage,
            ..self.clone()
        }
    }

    pub(crate) fn with_debug_id(mut self, debug_id: impl Into<String>) -> Self {
        self.debug_id = Some(debug_id.into());
        self
    }

    pub(crate) fn mark_remote(mut self) -> Self {
        self.is_remote = true;
        self
    }

    /// Whether the sampling decision may still change.
    pub fn sampling_finalized(&self) -> bool {
        self.finalized.load(Ordering::Relaxed)
    }

    /// Close the re-sampling window. Visible through every clone of this
    /// span's context.
    pub fn finalize_sampling(&self) {
        self.finalized.store(true, Ordering::Relaxed);
    }
}

impl fmt::Display for SpanContext {
    /// Serializes as `traceId:spanId:parentId:flags`, all lowercase hex,
    /// parent `0` meaning "no parent".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}:{:x}:{:x}:{:x}",
            self.trace_id, self.span_id, self.parent_id, self.flags
        )
    }
}

impl FromStr for SpanContext {
    type Err = TraceError;

    /// Parses the four-field hex form produced by [`fmt::Display`].
    /// Requires exactly four fields and a non-zero trace id; a violation
    /// yields a decode failure, never a partial context.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [trace_id, span_id, parent_id, flags] = parts[..] else {
            return Err(TraceError::SpanContextCorrupted(format!(
                "expected 4 colon-separated fields, got {}",
                parts.len()
            )));
        };
        let trace_id = TraceId::from_hex(trace_id)
            .map_err(|_| TraceError::SpanContextCorrupted(format!("bad trace id: {trace_id}")))?;
        if trace_id == TraceId::INVALID {
            return Err(TraceError::SpanContextCorrupted(
                "trace id must not be zero".to_string(),
            ));
        }
        let span_id = SpanId::from_hex(span_id)
            .map_err(|_| TraceError::SpanContextCorrupted(format!("bad span id: {span_id}")))?;
        let parent_id = SpanId::from_hex(parent_id)
            .map_err(|_| TraceError::SpanContextCorrupted(format!("bad parent id: {parent_id}")))?;
        let flags = u8::from_str_radix(flags, 16)
            .map_err(|_| TraceError::SpanContextCorrupted(format!("bad flags: {flags}")))?;
        Ok(
            SpanContext::new(trace_id, span_id, parent_id, TraceFlags::new(flags))
                .mark_remote(),
        )
    }
}
