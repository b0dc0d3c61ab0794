use thiserror::Error;

/// A specialized `Result` type for tracer operations.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors produced by the tracing client.
///
/// Configuration errors surface at construction time; everything that can
/// go wrong at runtime (remote fetches, context decoding) is recovered
/// locally by the component that hit it and never reaches span call paths.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// A probabilistic sampling rate outside of `[0.0, 1.0]`.
    #[error("sampling rate must be between 0.0 and 1.0, got {0}")]
    InvalidSamplingRate(f64),

    /// A negative rate limit.
    #[error("max traces per second must not be negative, got {0}")]
    InvalidRateLimit(f64),

    /// A serialized span context that could not be decoded.
    #[error("span context corrupted: {0}")]
    SpanContextCorrupted(String),

    /// A sampling-strategy response that matches none of the known shapes.
    #[error("malformed sampling strategy response: {0}")]
    MalformedStrategyResponse(String),

    /// A failed fetch against the remote sampling or throttling endpoint.
    #[error("remote endpoint request failed: {0}")]
    RemoteRequestFailed(String),

    /// Other errors not covered by the variants above.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<String> for TraceError {
    fn from(err_msg: String) -> Self {
        TraceError::Other(err_msg.into())
    }
}

impl From<&'static str> for TraceError {
    fn from(err_msg: &'static str) -> Self {
        TraceError::Other(Box::new(Custom(err_msg.into())))
    }
}

/// Wrap type for string
#[derive(Error, Debug)]
#[error("{0}")]
struct Custom(String);
