use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::errors::{TraceError, TraceResult};
use crate::metrics::Metrics;
use crate::transport::HttpClient;

const DEFAULT_CREDITS_ENDPOINT: &str = "http://localhost:5778/credits";
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Minimum credit balance required for an operation to not be throttled.
const UNIT_CREDIT: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct CreditResponse {
    balances: Vec<CreditBalance>,
}

#[derive(Debug, Deserialize)]
struct CreditBalance {
    operation: String,
    balance: f64,
}

type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// Configures and starts a [`RemoteThrottler`].
pub struct RemoteThrottlerBuilder<C> {
    service_name: String,
    client: C,
    endpoint: String,
    refresh_interval: Duration,
    initial_delay: Duration,
    metrics: Metrics,
    on_update: Option<UpdateCallback>,
}

impl<C> RemoteThrottlerBuilder<C>
where
    C: HttpClient + 'static,
{
    fn new(service_name: impl Into<String>, client: C) -> Self {
        RemoteThrottlerBuilder {
            service_name: service_name.into(),
            client,
            endpoint: DEFAULT_CREDITS_ENDPOINT.to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            initial_delay: DEFAULT_INITIAL_DELAY,
            metrics: Metrics::noop(),
            on_update: None,
        }
    }

    /// The credits endpoint, `http://host:port/credits`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// How often credits are fetched.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// How soon after construction credits are first fetched.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Instruments for throttling outcomes.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Invoked after every successfully applied credit response. Primarily
    /// for test observability.
    pub fn with_update_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(callback));
        self
    }

    /// Start the credit refresh loop and return the throttler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> TraceResult<RemoteThrottler> {
        if self.endpoint.is_empty() || self.service_name.is_empty() {
            return Err("endpoint and service name cannot be empty".into());
        }
        let base = url::Url::parse(&self.endpoint)
            .map_err(|err| TraceError::from(format!("invalid credits endpoint: {err}")))?;

        let inner = Arc::new(ThrottlerInner {
            service_name: self.service_name,
            uuid: Mutex::new(None),
            credits: Mutex::new(HashMap::new()),
            metrics: self.metrics,
        });
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let throttler = RemoteThrottler {
            inner: Arc::clone(&inner),
            shutdown: shutdown_tx,
        };
        tokio::spawn(run_credit_loop(
            inner,
            self.client,
            base,
            self.initial_delay,
            self.refresh_interval,
            self.on_update,
            shutdown_rx,
        ));
        Ok(throttler)
    }
}

struct ThrottlerInner {
    service_name: String,
    uuid: Mutex<Option<String>>,
    credits: Mutex<HashMap<String, f64>>,
    metrics: Metrics,
}

impl ThrottlerInner {
    fn credits(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.credits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admits debug spans by spending per-operation credits fetched from a
/// remote endpoint.
///
/// Credits accumulate additively across refreshes until spent; a
/// never-before-seen operation is always denied once while its first
/// credits are fetched asynchronously.
pub struct RemoteThrottler {
    inner: Arc<ThrottlerInner>,
    shutdown: mpsc::Sender<()>,
}

impl RemoteThrottler {
    /// Create a builder for the given service.
    pub fn builder<C>(service_name: impl Into<String>, client: C) -> RemoteThrottlerBuilder<C>
    where
        C: HttpClient + 'static,
    {
        RemoteThrottlerBuilder::new(service_name, client)
    }

    /// Whether `operation` may start a debug span right now.
    pub fn is_allowed(&self, operation: &str) -> bool {
        let mut credits = self.inner.credits();
        match credits.get_mut(operation) {
            None => {
                // register the operation so the next fetch funds it
                credits.insert(operation.to_owned(), 0.0);
                self.inner.metrics.throttled_debug_spans.increment(1);
                false
            }
            Some(balance) if *balance < UNIT_CREDIT => {
                self.inner.metrics.throttled_debug_spans.increment(1);
                false
            }
            Some(balance) => {
                *balance -= UNIT_CREDIT;
                true
            }
        }
    }

    /// Remaining credit for an operation, if it has been registered.
    pub fn credits(&self, operation: &str) -> Option<f64> {
        self.inner.credits().get(operation).copied()
    }

    /// Record the client uuid identifying this process to the credit
    /// endpoint. Credits are not fetched until a uuid is set.
    pub fn set_uuid(&self, uuid: impl Into<String>) {
        let mut guard = self
            .inner
            .uuid
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(uuid.into());
    }

    /// Stop the credit refresh loop.
    pub fn close(&self) {
        let _ = self.shutdown.try_send(());
    }
}

impl Drop for RemoteThrottler {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RemoteThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteThrottler")
            .field("service_name", &self.inner.service_name)
            .finish_non_exhaustive()
    }
}

async fn run_credit_loop<C>(
    inner: Arc<ThrottlerInner>,
    client: C,
    base: url::Url,
    initial_delay: Duration,
    refresh_interval: Duration,
    on_update: Option<UpdateCallback>,
    mut shutdown: mpsc::Receiver<()>,
) where
    C: HttpClient,
{
    tokio::select! {
        _ = shutdown.recv() => return,
        _ = tokio::time::sleep(initial_delay) => {}
    }

    let mut ticker = tokio::time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                refresh_credits(&inner, &client, &base, on_update.as_deref()).await;
            }
        }
    }
}

async fn refresh_credits<C>(
    inner: &ThrottlerInner,
    client: &C,
    base: &url::Url,
    on_update: Option<&(dyn Fn() + Send + Sync)>,
) where
    C: HttpClient,
{
    let uuid = match inner
        .uuid
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
    {
        Some(uuid) if !uuid.is_empty() => uuid,
        _ => {
            tracing::warn!("uuid must be set to fetch throttling credits");
            return;
        }
    };
    let operations: Vec<String> = inner.credits().keys().cloned().collect();
    if operations.is_empty() {
        // nothing to fund yet
        return;
    }

    match fetch_credits(client, base, &inner.service_name, &uuid, &operations).await {
        Ok(response) => {
            let mut credits = inner.credits();
            for balance in response.balances {
                *credits.entry(balance.operation).or_insert(0.0) += balance.balance;
            }
            drop(credits);
            inner.metrics.throttler_update_success.increment(1);
            if let Some(callback) = on_update {
                callback();
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to fetch throttling credits");
            inner.metrics.throttler_update_failure.increment(1);
        }
    }
}

async fn fetch_credits<C>(
    client: &C,
    base: &url::Url,
    service_name: &str,
    uuid: &str,
    operations: &[String],
) -> TraceResult<CreditResponse>
where
    C: HttpClient,
{
    let mut endpoint = base.clone();
    {
        let mut pairs = endpoint.query_pairs_mut();
        pairs.append_pair("service", service_name);
        pairs.append_pair("uuid", uuid);
        for operation in operations {
            pairs.append_pair("operations", operation);
        }
    }
    let endpoint = Uri::from_str(endpoint.as_str())
        .map_err(|err| TraceError::RemoteRequestFailed(err.to_string()))?;

    let request = http::Request::get(endpoint)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::new())
        .map_err(|err| TraceError::RemoteRequestFailed(err.to_string()))?;
    let response = client
        .send_bytes(request)
        .await
        .map_err(|err| TraceError::RemoteRequestFailed(err.to_string()))?;
    if response.status() != http::StatusCode::OK {
        return Err(TraceError::RemoteRequestFailed(format!(
            "unexpected status {}",
            response.status()
        )));
    }
    serde_json::from_slice(&response.body()[..])
        .map_err(|err| TraceError::RemoteRequestFailed(format!("invalid response body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetricsFactory;
    use crate::transport::testing::MockClient;

    fn throttler_with(
        client: MockClient,
        factory: &InMemoryMetricsFactory,
    ) -> (RemoteThrottler, tokio::sync::mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let throttler = RemoteThrottler::builder("svc", client)
            .with_initial_delay(Duration::from_millis(10))
            .with_refresh_interval(Duration::from_millis(50))
            .with_metrics(Metrics::new(factory))
            .with_update_callback(move || {
                let _ = tx.send(());
            })
            .build()
            .expect("valid builder");
        throttler.set_uuid("client-uuid");
        (throttler, rx)
    }

    async fn wait_for_update(rx: &mut tokio::sync::mpsc::UnboundedReceiver<()>) {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if rx.try_recv().is_ok() {
                return;
            }
        }
        panic!("credits were never updated");
    }

    #[tokio::test(start_paused = true)]
    async fn first_use_of_an_operation_is_denied_and_registered() {
        let factory = InMemoryMetricsFactory::new();
        let client = MockClient::new(vec![Ok(r#"{"balances":[]}"#.to_string())]);
        let (throttler, _rx) = throttler_with(client, &factory);

        assert!(!throttler.is_allowed("op"));
        assert_eq!(throttler.credits("op"), Some(0.0));
        assert_eq!(factory.counter_value("jaeger.throttled_debug_spans", &[]), 1);
        throttler.close();
    }

    #[tokio::test(start_paused = true)]
    async fn credits_are_fetched_and_spent() {
        let factory = InMemoryMetricsFactory::new();
        let client = MockClient::new(vec![Ok(
            r#"{"balances":[{"operation":"op","balance":2.0}]}"#.to_string()
        )]);
        let (throttler, mut rx) = throttler_with(client, &factory);

        assert!(!throttler.is_allowed("op"));
        wait_for_update(&mut rx).await;

        assert!(throttler.is_allowed("op"));
        assert!(throttler.is_allowed("op"));
        assert!(!throttler.is_allowed("op"));
        assert_eq!(
            factory.counter_value("jaeger.throttler_updates", &[("result", "ok")]),
            1
        );
        throttler.close();
    }

    #[tokio::test(start_paused = true)]
    async fn credit_refreshes_are_additive() {
        let factory = InMemoryMetricsFactory::new();
        let client = MockClient::new(vec![Ok(
            r#"{"balances":[{"operation":"op","balance":1.5}]}"#.to_string()
        )]);
        let (throttler, mut rx) = throttler_with(client, &factory);

        assert!(!throttler.is_allowed("op"));
        wait_for_update(&mut rx).await;
        wait_for_update(&mut rx).await;
        // two refreshes at 1.5 credits each
        assert_eq!(throttler.credits("op"), Some(3.0));
        throttler.close();
    }

    #[tokio::test(start_paused = true)]
    async fn no_operations_means_no_fetch() {
        let factory = InMemoryMetricsFactory::new();
        let client = MockClient::new(vec![Ok(r#"{"balances":[]}"#.to_string())]);
        let (throttler, _rx) = throttler_with(client.clone(), &factory);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(client.request_count(), 0);
        throttler.close();
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_url_carries_service_uuid_and_operations() {
        let factory = InMemoryMetricsFactory::new();
        let client = MockClient::new(vec![Ok(r#"{"balances":[]}"#.to_string())]);
        let (throttler, mut rx) = throttler_with(client.clone(), &factory);

        assert!(!throttler.is_allowed("op-a"));
        wait_for_update(&mut rx).await;

        let uris = client.request_uris();
        let uri = uris.first().expect("at least one request");
        assert!(uri.contains("service=svc"));
        assert!(uri.contains("uuid=client-uuid"));
        assert!(uri.contains("operations=op-a"));
        throttler.close();
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_counts_and_keeps_ledger() {
        let factory = InMemoryMetricsFactory::new();
        let client = MockClient::new(vec![Err("connection refused".to_string())]);
        let (throttler, _rx) = throttler_with(client.clone(), &factory);

        assert!(!throttler.is_allowed("op"));
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if factory.counter_value("jaeger.throttler_updates", &[("result", "err")]) > 0 {
                break;
            }
        }
        assert!(factory.counter_value("jaeger.throttler_updates", &[("result", "err")]) > 0);
        assert_eq!(throttler.credits("op"), Some(0.0));
        throttler.close();
    }
}
