//! Sampling strategies.
//!
//! The set of strategies is closed and exhaustively matched by the
//! remote-controlled sampler's reconciliation logic, so it is modeled as an
//! enum rather than an open trait object. Every variant answers
//! `is_sampled`, supports structural equality for change detection, and can
//! be closed; only [`RemoteControlledSampler`] owns background resources.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use rand::Rng;

use crate::common::Tag;
use crate::constants::{
    SAMPLER_PARAM_TAG_KEY, SAMPLER_TYPE_CONST, SAMPLER_TYPE_PROBABILISTIC,
    SAMPLER_TYPE_RATE_LIMITING, SAMPLER_TYPE_TAG_KEY,
};
use crate::errors::{TraceError, TraceResult};
use crate::rate_limiter::RateLimiter;

mod guaranteed_throughput;
mod per_operation;
pub mod remote;

pub use guaranteed_throughput::GuaranteedThroughputSampler;
pub use per_operation::PerOperationSampler;
pub use remote::{RemoteControlledSampler, RemoteControlledSamplerBuilder};

/// A sampling strategy.
///
/// Samplers that return `true` record the sampler's type and parameter into
/// `tags` so the backend can tell how the trace was admitted.
#[derive(Debug)]
#[non_exhaustive]
pub enum Sampler {
    /// Always returns the same fixed decision.
    Const(ConstSampler),
    /// Samples each trace with a fixed probability.
    Probabilistic(ProbabilisticSampler),
    /// Admits up to a fixed number of traces per second.
    RateLimiting(RateLimitingSampler),
    /// Probabilistic sampling with a rate-limited lower bound.
    GuaranteedThroughput(GuaranteedThroughputSampler),
    /// Guaranteed-throughput sampling keyed by operation name.
    PerOperation(PerOperationSampler),
    /// Polls a remote endpoint and forwards to the strategy it delivers.
    Remote(RemoteControlledSampler),
}

impl Sampler {
    /// Decide whether a span for `operation` should be sampled, writing
    /// sampler-identity tags on a positive decision.
    pub fn is_sampled(&self, operation: &str, tags: &mut Vec<Tag>) -> bool {
        match self {
            Sampler::Const(s) => s.is_sampled(operation, tags),
            Sampler::Probabilistic(s) => s.is_sampled(operation, tags),
            Sampler::RateLimiting(s) => s.is_sampled(operation, tags),
            Sampler::GuaranteedThroughput(s) => s.is_sampled(operation, tags),
            Sampler::PerOperation(s) => s.is_sampled(operation, tags),
            Sampler::Remote(s) => s.is_sampled(operation, tags),
        }
    }

    /// Structural equality, used to detect whether a strategy update
    /// actually changed the effective configuration.
    pub fn equal(&self, other: &Sampler) -> bool {
        match (self, other) {
            (Sampler::Const(a), Sampler::Const(b)) => a.decision() == b.decision(),
            (Sampler::Probabilistic(a), Sampler::Probabilistic(b)) => {
                a.sampling_rate() == b.sampling_rate()
            }
            (Sampler::RateLimiting(a), Sampler::RateLimiting(b)) => {
                a.max_traces_per_second() == b.max_traces_per_second()
            }
            (Sampler::GuaranteedThroughput(a), Sampler::GuaranteedThroughput(b)) => a.equal(b),
            // per-operation reconciliation tracks its own changes and
            // remote samplers are never compared structurally
            _ => false,
        }
    }

    /// Release background resources. Leaf strategies are inert.
    pub fn close(&self) {
        if let Sampler::Remote(s) = self {
            s.close();
        }
    }
}

impl fmt::Display for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sampler::Const(s) => write!(
                f,
                "ConstSampler({})",
                if s.decision() { "always" } else { "never" }
            ),
            Sampler::Probabilistic(s) => {
                write!(f, "ProbabilisticSampler(samplingRate={})", s.sampling_rate())
            }
            Sampler::RateLimiting(s) => write!(
                f,
                "RateLimitingSampler(maxTracesPerSecond={})",
                s.max_traces_per_second()
            ),
            Sampler::GuaranteedThroughput(s) => write!(
                f,
                "GuaranteedThroughputSampler(samplingRate={}, lowerBound={})",
                s.sampling_rate(),
                s.lower_bound()
            ),
            Sampler::PerOperation(s) => {
                write!(f, "PerOperationSampler(maxOperations={})", s.max_operations())
            }
            Sampler::Remote(s) => {
                write!(f, "RemoteControlledSampler(serviceName={})", s.service_name())
            }
        }
    }
}

/// A sampler that always makes the same decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstSampler {
    decision: bool,
}

impl ConstSampler {
    /// Create a sampler with a fixed decision.
    pub fn new(decision: bool) -> Self {
        ConstSampler { decision }
    }

    /// The fixed decision.
    pub fn decision(&self) -> bool {
        self.decision
    }

    pub(crate) fn is_sampled(&self, _operation: &str, tags: &mut Vec<Tag>) -> bool {
        if self.decision {
            tags.push(Tag::new(SAMPLER_TYPE_TAG_KEY, SAMPLER_TYPE_CONST));
            tags.push(Tag::new(SAMPLER_PARAM_TAG_KEY, self.decision));
        }
        self.decision
    }
}

/// A sampler admitting each trace with probability `sampling_rate`.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbabilisticSampler {
    sampling_rate: f64,
}

impl ProbabilisticSampler {
    /// Create a sampler with the given rate in `[0.0, 1.0]`.
    pub fn new(sampling_rate: f64) -> TraceResult<Self> {
        if !(0.0..=1.0).contains(&sampling_rate) {
            return Err(TraceError::InvalidSamplingRate(sampling_rate));
        }
        Ok(ProbabilisticSampler { sampling_rate })
    }

    /// The configured sampling rate.
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub(crate) fn is_sampled(&self, _operation: &str, tags: &mut Vec<Tag>) -> bool {
        let decision = rand::rng().random::<f64>() < self.sampling_rate;
        if decision {
            tags.push(Tag::new(SAMPLER_TYPE_TAG_KEY, SAMPLER_TYPE_PROBABILISTIC));
            tags.push(Tag::new(SAMPLER_PARAM_TAG_KEY, self.sampling_rate));
        }
        decision
    }
}

#[derive(Debug)]
struct RateLimitingState {
    max_traces_per_second: f64,
    limiter: RateLimiter,
}

/// A sampler admitting up to `max_traces_per_second` traces per second,
/// backed by a token bucket with fractional refill.
#[derive(Debug)]
pub struct RateLimitingSampler {
    inner: Mutex<RateLimitingState>,
}

impl RateLimitingSampler {
    /// Create a sampler with the given rate. Rates below 1.0 still admit
    /// exactly one trace per full refill period because the bucket size is
    /// floored at 1.0.
    pub fn new(max_traces_per_second: f64) -> TraceResult<Self> {
        if max_traces_per_second < 0.0 {
            return Err(TraceError::InvalidRateLimit(max_traces_per_second));
        }
        let limiter = RateLimiter::new(max_traces_per_second, bucket_size(max_traces_per_second));
        Ok(RateLimitingSampler {
            inner: Mutex::new(RateLimitingState {
                max_traces_per_second,
                limiter,
            }),
        })
    }

    /// Create a sampler with a deterministic starting balance.
    pub fn with_initial_balance(max_traces_per_second: f64, balance: f64) -> TraceResult<Self> {
        if max_traces_per_second < 0.0 {
            return Err(TraceError::InvalidRateLimit(max_traces_per_second));
        }
        let limiter = RateLimiter::with_balance(
            max_traces_per_second,
            bucket_size(max_traces_per_second),
            balance,
        );
        Ok(RateLimitingSampler {
            inner: Mutex::new(RateLimitingState {
                max_traces_per_second,
                limiter,
            }),
        })
    }

    /// The configured rate.
    pub fn max_traces_per_second(&self) -> f64 {
        self.lock().max_traces_per_second
    }

    /// Reconfigure the rate in place, preserving the proportional burst
    /// budget of the underlying bucket. Returns whether the rate changed.
    pub fn update(&self, max_traces_per_second: f64) -> TraceResult<bool> {
        if max_traces_per_second < 0.0 {
            return Err(TraceError::InvalidRateLimit(max_traces_per_second));
        }
        let mut state = self.lock();
        let changed = state.max_traces_per_second != max_traces_per_second;
        state
            .limiter
            .update(max_traces_per_second, bucket_size(max_traces_per_second));
        state.max_traces_per_second = max_traces_per_second;
        Ok(changed)
    }

    pub(crate) fn is_sampled(&self, _operation: &str, tags: &mut Vec<Tag>) -> bool {
        let mut state = self.lock();
        let decision = state.limiter.check_credit(1.0);
        if decision {
            tags.push(Tag::new(SAMPLER_TYPE_TAG_KEY, SAMPLER_TYPE_RATE_LIMITING));
            tags.push(Tag::new(SAMPLER_PARAM_TAG_KEY, state.max_traces_per_second));
        }
        decision
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateLimitingState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bucket_size(max_traces_per_second: f64) -> f64 {
    f64::max(max_traces_per_second, 1.0)
}
