use std::time::Instant;

use rand::Rng;

/// Token bucket with fractional, time-weighted refill.
///
/// The balance is replenished by `elapsed * credits_per_second` on every
/// check, capped at `max_balance`. `check_credit` spends from the balance
/// when possible and leaves it untouched on denial, so the balance never
/// goes negative.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    credits_per_second: f64,
    balance: f64,
    max_balance: f64,
    last_tick: Instant,
}

impl RateLimiter {
    /// Create a limiter whose initial balance is a uniform random fraction
    /// of `max_balance`, so that fleets of processes started from the same
    /// configuration at the same instant do not admit bursts in lockstep.
    pub(crate) fn new(credits_per_second: f64, max_balance: f64) -> Self {
        let init_balance = rand::rng().random::<f64>() * max_balance;
        Self::with_balance(credits_per_second, max_balance, init_balance)
    }

    /// Create a limiter with an explicit starting balance.
    pub(crate) fn with_balance(credits_per_second: f64, max_balance: f64, balance: f64) -> Self {
        RateLimiter {
            credits_per_second,
            balance,
            max_balance,
            last_tick: Instant::now(),
        }
    }

    /// Spend `cost` credits if the replenished balance covers it.
    pub(crate) fn check_credit(&mut self, cost: f64) -> bool {
        self.check_credit_at(cost, Instant::now())
    }

    fn check_credit_at(&mut self, cost: f64, now: Instant) -> bool {
        self.replenish(now);
        if self.balance >= cost {
            self.balance -= cost;
            true
        } else {
            false
        }
    }

    fn replenish(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.balance = f64::min(
            self.balance + elapsed.as_secs_f64() * self.credits_per_second,
            self.max_balance,
        );
    }

    /// Reconfigure the limiter in place.
    ///
    /// Replenishes with the old rate first, then rescales the current
    /// balance proportionally (`new_max * balance / old_max`) so an
    /// in-flight burst budget is neither reset to zero nor overfilled.
    pub(crate) fn update(&mut self, credits_per_second: f64, max_balance: f64) {
        self.replenish(Instant::now());
        self.credits_per_second = credits_per_second;
        self.balance = max_balance * self.balance / self.max_balance;
        self.max_balance = max_balance;
    }

    #[cfg(test)]
    pub(crate) fn balance(&self) -> f64 {
        self.balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spends_and_denies_without_going_negative() {
        let mut limiter = RateLimiter::with_balance(2.0, 2.0, 2.0);
        let start = Instant::now();

        assert!(limiter.check_credit_at(1.0, start));
        assert!(limiter.check_credit_at(1.0, start));
        assert!(!limiter.check_credit_at(1.0, start));
        assert!(limiter.balance() >= 0.0);

        // 250ms replenishes half a credit, not enough for a full item
        assert!(!limiter.check_credit_at(1.0, start + Duration::from_millis(250)));
        // another 250ms brings the balance to a full credit
        assert!(limiter.check_credit_at(1.0, start + Duration::from_millis(500)));
        assert!(!limiter.check_credit_at(1.0, start + Duration::from_millis(500)));
    }

    #[test]
    fn balance_is_capped_at_max() {
        let mut limiter = RateLimiter::with_balance(10.0, 2.0, 2.0);
        let start = Instant::now();
        // a long idle period must not accumulate more than max_balance
        assert!(limiter.check_credit_at(1.0, start + Duration::from_secs(3600)));
        assert!(limiter.check_credit_at(1.0, start + Duration::from_secs(3600)));
        assert!(!limiter.check_credit_at(1.0, start + Duration::from_secs(3600)));
    }

    #[test]
    fn fractional_refill_admits_one_item_per_period() {
        // 0.1 credits per second, bucket of one item
        let mut limiter = RateLimiter::with_balance(0.1, 1.0, 1.0);
        let start = Instant::now();
        assert!(limiter.check_credit_at(1.0, start));
        assert!(!limiter.check_credit_at(1.0, start + Duration::from_secs(5)));
        assert!(limiter.check_credit_at(1.0, start + Duration::from_secs(10)));
    }

    #[test]
    fn update_rescales_balance_proportionally() {
        let mut limiter = RateLimiter::with_balance(1.0, 4.0, 2.0);
        limiter.update(1.0, 2.0);
        // half-full before, still half-full after
        assert!((limiter.balance() - 1.0).abs() < 0.01);
        limiter.update(1.0, 8.0);
        assert!((limiter.balance() - 4.0).abs() < 0.05);
    }

    #[test]
    fn random_initial_balance_stays_in_range() {
        for _ in 0..32 {
            let limiter = RateLimiter::new(1.0, 5.0);
            assert!(limiter.balance() >= 0.0);
            assert!(limiter.balance() <= 5.0);
        }
    }
}
