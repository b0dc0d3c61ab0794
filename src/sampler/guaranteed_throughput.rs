use crate::common::Tag;
use crate::constants::{SAMPLER_PARAM_TAG_KEY, SAMPLER_TYPE_LOWER_BOUND, SAMPLER_TYPE_TAG_KEY};
use crate::errors::TraceResult;
use crate::sampler::{ProbabilisticSampler, RateLimitingSampler};

/// Probabilistic sampling with a rate-limited lower bound.
///
/// The rate-limiting side guarantees that every operation is sampled at
/// least once per `1 / lower_bound` seconds even when the probabilistic
/// rate would starve it. The probabilistic side has priority for tag
/// emission: a span admitted by both reports as `probabilistic`.
///
/// The lower-bound budget is charged on every probabilistic admission as
/// well, through a throwaway tag sink, so a burst of probabilistically
/// sampled traffic cannot bank an extra lower-bound admission for later.
#[derive(Debug)]
pub struct GuaranteedThroughputSampler {
    probabilistic: ProbabilisticSampler,
    lower_bound: RateLimitingSampler,
}

impl GuaranteedThroughputSampler {
    /// Create a sampler from a lower bound (traces per second) and a
    /// probabilistic sampling rate.
    pub fn new(lower_bound: f64, sampling_rate: f64) -> TraceResult<Self> {
        Ok(GuaranteedThroughputSampler {
            probabilistic: ProbabilisticSampler::new(sampling_rate)?,
            lower_bound: RateLimitingSampler::new(lower_bound)?,
        })
    }

    /// The probabilistic sampling rate.
    pub fn sampling_rate(&self) -> f64 {
        self.probabilistic.sampling_rate()
    }

    /// The guaranteed lower bound in traces per second.
    pub fn lower_bound(&self) -> f64 {
        self.lower_bound.max_traces_per_second()
    }

    pub(crate) fn is_sampled(&self, operation: &str, tags: &mut Vec<Tag>) -> bool {
        // the lower bound sampler never gets to emit its real tags
        let mut sink = Vec::new();
        if self.probabilistic.is_sampled(operation, tags) {
            // charge the guarantee budget even on probabilistic admissions
            self.lower_bound.is_sampled(operation, &mut sink);
            return true;
        }
        let decision = self.lower_bound.is_sampled(operation, &mut sink);
        if decision {
            tags.push(Tag::new(SAMPLER_TYPE_TAG_KEY, SAMPLER_TYPE_LOWER_BOUND));
            tags.push(Tag::new(
                SAMPLER_PARAM_TAG_KEY,
                self.probabilistic.sampling_rate(),
            ));
        }
        decision
    }

    /// Replace whichever side changed. Returns whether anything changed.
    pub(crate) fn update(&mut self, lower_bound: f64, sampling_rate: f64) -> TraceResult<bool> {
        let mut updated = false;
        if self.probabilistic.sampling_rate() != sampling_rate {
            self.probabilistic = ProbabilisticSampler::new(sampling_rate)?;
            updated = true;
        }
        if self.lower_bound.max_traces_per_second() != lower_bound {
            self.lower_bound.update(lower_bound)?;
            updated = true;
        }
        Ok(updated)
    }

    pub(crate) fn equal(&self, other: &GuaranteedThroughputSampler) -> bool {
        self.sampling_rate() == other.sampling_rate() && self.lower_bound() == other.lower_bound()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TagValue;

    fn tag_value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a TagValue> {
        tags.iter().find(|t| t.key() == key).map(|t| t.value())
    }

    #[test]
    fn lower_bound_decides_when_probabilistic_never_samples() {
        // primary rate 0, floor of 1 trace/sec with a one-credit bucket
        let sampler = GuaranteedThroughputSampler {
            probabilistic: ProbabilisticSampler::new(0.0).expect("valid"),
            lower_bound: RateLimitingSampler::with_initial_balance(1.0, 1.0).expect("valid"),
        };

        let mut tags = Vec::new();
        assert!(sampler.is_sampled("op", &mut tags));
        assert_eq!(
            tag_value(&tags, SAMPLER_TYPE_TAG_KEY),
            Some(&TagValue::from(SAMPLER_TYPE_LOWER_BOUND))
        );
        // the reported parameter is the primary's rate, not the bound
        assert_eq!(
            tag_value(&tags, SAMPLER_PARAM_TAG_KEY),
            Some(&TagValue::F64(0.0))
        );

        // floor budget exhausted until the bucket refills
        assert!(!sampler.is_sampled("op", &mut Vec::new()));
    }

    #[test]
    fn probabilistic_admission_charges_the_floor() {
        let sampler = GuaranteedThroughputSampler {
            probabilistic: ProbabilisticSampler::new(1.0).expect("valid"),
            lower_bound: RateLimitingSampler::with_initial_balance(1.0, 1.0).expect("valid"),
        };

        let mut tags = Vec::new();
        assert!(sampler.is_sampled("op", &mut tags));
        // reported as probabilistic even though the floor was charged
        assert_eq!(
            tag_value(&tags, SAMPLER_TYPE_TAG_KEY),
            Some(&TagValue::from(crate::constants::SAMPLER_TYPE_PROBABILISTIC))
        );
        // the floor's budget is gone: with the primary switched off the
        // next decision is denied
        assert!(!sampler.lower_bound.is_sampled("op", &mut Vec::new()));
    }

    #[test]
    fn update_swaps_only_what_changed() {
        let mut sampler = GuaranteedThroughputSampler::new(1.0, 0.5).expect("valid");
        assert!(!sampler.update(1.0, 0.5).expect("valid"));
        assert!(sampler.update(1.0, 0.25).expect("valid"));
        assert_eq!(sampler.sampling_rate(), 0.25);
        assert!(sampler.update(2.0, 0.25).expect("valid"));
        assert_eq!(sampler.lower_bound(), 2.0);
    }

    #[test]
    fn equality_compares_both_sides() {
        let a = GuaranteedThroughputSampler::new(1.0, 0.5).expect("valid");
        let b = GuaranteedThroughputSampler::new(1.0, 0.5).expect("valid");
        let c = GuaranteedThroughputSampler::new(2.0, 0.5).expect("valid");
        assert!(a.equal(&b));
        assert!(!a.equal(&c));
    }
}
