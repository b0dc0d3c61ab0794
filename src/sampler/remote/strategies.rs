//! Wire types for the remote sampling-strategy protocol.

use serde::{Deserialize, Serialize};

/// Samples traces with a fixed probability.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbabilisticSamplingStrategy {
    /// Sampling probability in the range `[0.0, 1.0]`.
    pub sampling_rate: f64,
}

/// Samples a fixed number of traces per second.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitingSamplingStrategy {
    /// Upper bound of traces admitted per second.
    pub max_traces_per_second: f64,
}

/// Sampling strategy for a single operation. Only probabilistic sampling
/// is supported per operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationSamplingStrategy {
    /// The operation name the strategy applies to.
    pub operation: String,
    /// The probabilistic strategy for this operation.
    pub probabilistic_sampling: ProbabilisticSamplingStrategy,
}

/// A combination of per-operation strategies with service-wide defaults.
///
/// Useful for services whose endpoints receive vastly different traffic, so
/// that no single sampling rate fits all of them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerOperationStrategies {
    /// Sampling probability for operations without their own strategy.
    pub default_sampling_probability: f64,
    /// Lower-bound rate applied to every operation, local to this process.
    pub default_lower_bound_traces_per_second: f64,
    /// Strategies for individual operations.
    #[serde(default)]
    pub per_operation_strategies: Vec<OperationSamplingStrategy>,
}

/// Legacy discriminator for the service-wide strategy fields.
///
/// Not extended when per-operation strategies were introduced; consumers
/// check `operation_sampling` first and only then fall back to this field.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SamplingStrategyType {
    /// Service-wide probabilistic sampling.
    Probabilistic,
    /// Service-wide rate-limited sampling.
    RateLimiting,
}

/// The overall sampling strategy for a service.
///
/// Treated as a union: exactly one of the strategy fields is expected to be
/// present, with `operation_sampling` taking precedence.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SamplingStrategyResponse {
    /// See [`SamplingStrategyType`].
    #[serde(default)]
    pub strategy_type: Option<SamplingStrategyType>,
    /// Present for `PROBABILISTIC` responses.
    #[serde(default)]
    pub probabilistic_sampling: Option<ProbabilisticSamplingStrategy>,
    /// Present for `RATE_LIMITING` responses.
    #[serde(default)]
    pub rate_limiting_sampling: Option<RateLimitingSamplingStrategy>,
    /// Present when the service has per-operation strategies.
    #[serde(default)]
    pub operation_sampling: Option<PerOperationStrategies>,
}
