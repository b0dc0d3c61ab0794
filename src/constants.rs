//! Well-known tag keys, header names and sampler identifiers.

/// Reports which sampler made the decision on the root span.
pub const SAMPLER_TYPE_TAG_KEY: &str = "sampler.type";

/// Reports the parameter of the sampler that made the decision.
pub const SAMPLER_PARAM_TAG_KEY: &str = "sampler.param";

/// Sampler type reported by [`ConstSampler`](crate::sampler::ConstSampler).
pub const SAMPLER_TYPE_CONST: &str = "const";

/// Sampler type reported by
/// [`ProbabilisticSampler`](crate::sampler::ProbabilisticSampler).
pub const SAMPLER_TYPE_PROBABILISTIC: &str = "probabilistic";

/// Sampler type reported by
/// [`RateLimitingSampler`](crate::sampler::RateLimitingSampler).
pub const SAMPLER_TYPE_RATE_LIMITING: &str = "ratelimiting";

/// Sampler type reported when the lower-bound side of a
/// guaranteed-throughput sampler made the decision.
pub const SAMPLER_TYPE_LOWER_BOUND: &str = "lowerbound";

/// Tag used to request a sampling override on a span. A positive value asks
/// for a debug upgrade, zero or negative disables sampling.
pub const SAMPLING_PRIORITY_TAG_KEY: &str = "sampling.priority";

/// Carrier key which, when present, forces the trace to be sampled as a
/// debug trace. Its value is recorded as a tag on the root span so the
/// trace can be located by correlation id.
pub const JAEGER_DEBUG_HEADER: &str = "jaeger-debug-id";

/// Header carrying ad-hoc baggage for requests without a root span.
pub const JAEGER_BAGGAGE_HEADER: &str = "jaeger-baggage";

/// Default prefix for baggage keys written to a carrier.
pub const TRACE_BAGGAGE_HEADER_PREFIX: &str = "uberctx-";

/// Header key used for a span's serialized context.
pub const TRACER_STATE_HEADER_NAME: &str = "uber-trace-id";
