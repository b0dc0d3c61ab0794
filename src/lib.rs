//! A Jaeger tracing client: span creation and propagation with adaptive,
//! remotely controlled sampling.
//!
//! The entry point is [`Tracer`], built through [`Tracer::builder`]. The
//! tracer starts [spans](Span), decides whether each trace is sampled
//! through a [`Sampler`], propagates [span contexts](SpanContext) through
//! text-map carriers, and hands finished spans to a [`Reporter`].
//!
//! ```
//! use jaeger_client::{ConstSampler, Sampler, Tracer};
//!
//! let tracer = Tracer::builder("my-service")
//!     .with_sampler(Sampler::Const(ConstSampler::new(true)))
//!     .build();
//!
//! let mut span = tracer.span_builder("load-user").start();
//! span.set_tag("user.id", 42i64);
//! span.finish();
//! tracer.close();
//! ```
//!
//! # Sampling
//!
//! Samplers form a closed set of strategies ([`Sampler`]): constant,
//! probabilistic, rate limiting, and composites built from them. The
//! [`RemoteControlledSampler`] polls a sampling endpoint in the background
//! and swaps strategies atomically, so span creation never waits on the
//! network. Sampling decisions stay open until the span is used in a way
//! that makes revisiting them unsound (child creation, serialization,
//! finish), which lets late [`Span::set_operation_name`] calls re-sample
//! under per-operation strategies.
//!
//! # Debug spans and throttling
//!
//! A positive `sampling.priority` tag or a `jaeger-debug-id` carrier entry
//! forces a span to be sampled, bypassing the sampler. Because that
//! bypasses all rate control, debug admission is guarded by a
//! [`Throttler`](throttler::Throttler), optionally funded by a remote
//! credit endpoint.

mod baggage;
mod common;
mod constants;
mod errors;
mod metrics;
mod rate_limiter;
mod reporter;
pub mod sampler;
mod span;
mod span_context;
pub mod throttler;
mod tracer;
pub mod transport;

pub use baggage::{
    BaggageRestrictionManager, BaggageSetter, DefaultBaggageRestrictionManager, Restriction,
    DEFAULT_MAX_VALUE_LENGTH,
};
pub use common::{LogRecord, Tag, TagValue};
pub use constants::*;
pub use errors::{TraceError, TraceResult};
pub use metrics::{
    Counter, Gauge, InMemoryMetricsFactory, Metrics, MetricsFactory, NoopMetricsFactory,
};
pub use reporter::{
    CompositeReporter, InMemoryReporter, LoggingReporter, NullReporter, Reporter, SpanData,
};
pub use sampler::{
    ConstSampler, GuaranteedThroughputSampler, PerOperationSampler, ProbabilisticSampler,
    RateLimitingSampler, RemoteControlledSampler, Sampler,
};
pub use span::{Reference, ReferenceKind, Span};
pub use span_context::{SpanContext, SpanId, TraceFlags, TraceId};
pub use tracer::{SpanBuilder, Tracer, TracerBuilder};
