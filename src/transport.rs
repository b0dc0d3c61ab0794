//! Minimal HTTP client seam used by the remote sampler and throttler.
//!
//! The background refresh loops only need to issue `GET` requests against
//! the control plane, so the surface is a single trait. Users bring their
//! own client; a [`reqwest`] implementation ships behind the
//! `reqwest-client` feature.

use std::fmt::Debug;

use async_trait::async_trait;
pub use bytes::Bytes;
pub use http::{Request, Response};

/// Error type produced by [`HttpClient`] implementations.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A minimal interface necessary for fetching sampling strategies and
/// throttling credits over HTTP.
///
/// Implementations may rely on any async runtime; the tracer only awaits
/// them from its own background tasks.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send the specified HTTP request with a `Bytes` payload.
    ///
    /// Returns the HTTP response including the status code and body, or an
    /// error if the request could not be completed.
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{async_trait, Bytes, HttpClient, HttpError, Request, Response};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Serves canned bodies in order, repeating the last one; `Err` entries
    /// simulate transport failures.
    #[derive(Clone, Debug, Default)]
    pub(crate) struct MockClient {
        bodies: Arc<Mutex<Vec<Result<String, String>>>>,
        requests: Arc<AtomicUsize>,
        request_uris: Arc<Mutex<Vec<String>>>,
    }

    impl MockClient {
        pub(crate) fn new(bodies: Vec<Result<String, String>>) -> Self {
            MockClient {
                bodies: Arc::new(Mutex::new(bodies)),
                requests: Arc::new(AtomicUsize::new(0)),
                request_uris: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        pub(crate) fn request_uris(&self) -> Vec<String> {
            self.request_uris
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl HttpClient for MockClient {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            let index = self.requests.fetch_add(1, Ordering::SeqCst);
            self.request_uris
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.uri().to_string());
            let bodies = self.bodies.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = match bodies.get(index).or_else(|| bodies.last()) {
                Some(entry) => entry.clone(),
                None => Err("no canned response".to_string()),
            };
            match entry {
                Ok(body) => Ok(Response::builder()
                    .status(200)
                    .body(Bytes::from(body))
                    .expect("static response")),
                Err(err) => Err(err.into()),
            }
        }
    }
}

#[cfg(feature = "reqwest-client")]
mod reqwest_client {
    use super::{async_trait, Bytes, HttpClient, HttpError, Request, Response};

    #[async_trait]
    impl HttpClient for reqwest::Client {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            let request = request.try_into()?;
            let mut response = self.execute(request).await?;
            let headers = std::mem::take(response.headers_mut());
            let status = response.status();
            let mut http_response = Response::builder()
                .status(status)
                .body(response.bytes().await?)?;
            *http_response.headers_mut() = headers;
            Ok(http_response)
        }
    }
}
