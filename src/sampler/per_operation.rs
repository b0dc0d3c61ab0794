use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::common::Tag;
use crate::errors::TraceResult;
use crate::sampler::remote::strategies::PerOperationStrategies;
use crate::sampler::{GuaranteedThroughputSampler, ProbabilisticSampler};

/// Guaranteed-throughput sampling keyed by operation name.
///
/// Tracks every operation it is asked about and gives each one its own
/// [`GuaranteedThroughputSampler`] so all endpoints are represented in the
/// sampled traces. Once `max_operations` distinct names have been
/// registered, further names are served by a shared default probabilistic
/// sampler and never get a durable per-operation entry, which bounds memory
/// under unbounded operation-name cardinality.
///
/// Registrations are never evicted: operations absent from a later strategy
/// update keep their existing sampler.
#[derive(Debug)]
pub struct PerOperationSampler {
    max_operations: usize,
    inner: Mutex<PerOperationState>,
}

#[derive(Debug)]
struct PerOperationState {
    default_sampler: ProbabilisticSampler,
    default_lower_bound: f64,
    samplers: HashMap<String, GuaranteedThroughputSampler>,
}

impl PerOperationSampler {
    /// Create a sampler from a per-operation strategy set.
    pub fn new(strategies: &PerOperationStrategies, max_operations: usize) -> TraceResult<Self> {
        let sampler = PerOperationSampler {
            max_operations,
            inner: Mutex::new(PerOperationState {
                default_sampler: ProbabilisticSampler::new(
                    strategies.default_sampling_probability,
                )?,
                default_lower_bound: strategies.default_lower_bound_traces_per_second,
                samplers: HashMap::new(),
            }),
        };
        sampler.update(strategies)?;
        Ok(sampler)
    }

    /// The registration cap.
    pub fn max_operations(&self) -> usize {
        self.max_operations
    }

    /// Number of durable per-operation samplers currently registered.
    pub fn operation_count(&self) -> usize {
        self.lock().samplers.len()
    }

    pub(crate) fn is_sampled(&self, operation: &str, tags: &mut Vec<Tag>) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(sampler) = state.samplers.get(operation) {
            return sampler.is_sampled(operation, tags);
        }
        if state.samplers.len() >= self.max_operations {
            // over the cap: no durable allocation for this operation
            return state.default_sampler.is_sampled(operation, tags);
        }
        let sampler = match GuaranteedThroughputSampler::new(
            state.default_lower_bound,
            state.default_sampler.sampling_rate(),
        ) {
            Ok(sampler) => sampler,
            // defaults were validated on update; fall back rather than drop
            Err(_) => return state.default_sampler.is_sampled(operation, tags),
        };
        let decision = sampler.is_sampled(operation, tags);
        state.samplers.insert(operation.to_owned(), sampler);
        decision
    }

    /// Reconcile with an incoming strategy set.
    ///
    /// Updates the shared defaults and upserts every operation present in
    /// the set; operations absent from it are left untouched. Returns
    /// whether the effective configuration changed.
    pub fn update(&self, strategies: &PerOperationStrategies) -> TraceResult<bool> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut updated =
            state.default_lower_bound != strategies.default_lower_bound_traces_per_second;
        state.default_lower_bound = strategies.default_lower_bound_traces_per_second;

        for strategy in &strategies.per_operation_strategies {
            let sampling_rate = strategy.probabilistic_sampling.sampling_rate;
            match state.samplers.get_mut(&strategy.operation) {
                Some(sampler) => {
                    if sampler.update(state.default_lower_bound, sampling_rate)? {
                        updated = true;
                    }
                }
                None => {
                    let sampler =
                        GuaranteedThroughputSampler::new(state.default_lower_bound, sampling_rate)?;
                    state.samplers.insert(strategy.operation.clone(), sampler);
                    updated = true;
                }
            }
        }

        if state.default_sampler.sampling_rate() != strategies.default_sampling_probability {
            state.default_sampler =
                ProbabilisticSampler::new(strategies.default_sampling_probability)?;
            updated = true;
        }
        Ok(updated)
    }

    fn lock(&self) -> MutexGuard<'_, PerOperationState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
