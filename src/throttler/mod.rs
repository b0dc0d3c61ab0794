//! Debug-span admission throttling.
//!
//! Debug spans bypass sampling entirely, so their admission is throttled
//! separately: either statically ([`DefaultThrottler`]) or against a
//! remotely funded per-operation credit ledger ([`RemoteThrottler`]).

mod remote;

pub use remote::{RemoteThrottler, RemoteThrottlerBuilder};

/// Decides whether an operation may start a debug span.
#[derive(Debug)]
#[non_exhaustive]
pub enum Throttler {
    /// Statically allows or denies everything.
    Default(DefaultThrottler),
    /// Spends per-operation credits fetched from a remote endpoint.
    Remote(RemoteThrottler),
}

impl Throttler {
    /// Whether `operation` may start a debug span right now.
    pub fn is_allowed(&self, operation: &str) -> bool {
        match self {
            Throttler::Default(t) => t.is_allowed(operation),
            Throttler::Remote(t) => t.is_allowed(operation),
        }
    }

    /// Record the client uuid identifying this process to the credit
    /// endpoint. No-op for the default throttler.
    pub fn set_process(&self, uuid: impl Into<String>) {
        if let Throttler::Remote(t) = self {
            t.set_uuid(uuid);
        }
    }

    /// Release background resources.
    pub fn close(&self) {
        if let Throttler::Remote(t) = self {
            t.close();
        }
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Throttler::Default(DefaultThrottler::new(false))
    }
}

/// Either throttles everything or nothing.
#[derive(Clone, Debug, Default)]
pub struct DefaultThrottler {
    throttle_all: bool,
}

impl DefaultThrottler {
    /// Create a throttler; `throttle_all` denies every operation.
    pub fn new(throttle_all: bool) -> Self {
        DefaultThrottler { throttle_all }
    }

    /// Whether debug spans are admitted.
    pub fn is_allowed(&self, _operation: &str) -> bool {
        !self.throttle_all
    }
}
