//! A sampler remotely controlled by the tracing backend.
//!
//! Polls the backend's sampling endpoint on a fixed period (after a
//! randomly jittered initial delay, so synchronized fleets do not stampede
//! the control plane) and atomically swaps the active strategy. Span
//! creation paths read a snapshot of the active strategy and are never
//! blocked by a refresh in flight.

pub mod strategies;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::Uri;
use rand::Rng;
use tokio::sync::mpsc;

use crate::common::Tag;
use crate::errors::{TraceError, TraceResult};
use crate::metrics::Metrics;
use crate::sampler::remote::strategies::{SamplingStrategyResponse, SamplingStrategyType};
use crate::sampler::{PerOperationSampler, ProbabilisticSampler, RateLimitingSampler, Sampler};
use crate::transport::HttpClient;

const DEFAULT_SAMPLING_ENDPOINT: &str = "http://localhost:5778/sampling";
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_INITIAL_SAMPLING_RATE: f64 = 0.001;
const DEFAULT_MAX_OPERATIONS: usize = 2000;

type UpdateCallback = Arc<dyn Fn(&Sampler) + Send + Sync>;

/// Configures and starts a [`RemoteControlledSampler`].
pub struct RemoteControlledSamplerBuilder<C> {
    service_name: String,
    client: C,
    endpoint: String,
    initial_sampler: Option<Sampler>,
    refresh_interval: Duration,
    max_operations: usize,
    metrics: Metrics,
    on_update: Option<UpdateCallback>,
}

impl<C> RemoteControlledSamplerBuilder<C>
where
    C: HttpClient + 'static,
{
    fn new(service_name: impl Into<String>, client: C) -> Self {
        RemoteControlledSamplerBuilder {
            service_name: service_name.into(),
            client,
            endpoint: DEFAULT_SAMPLING_ENDPOINT.to_string(),
            initial_sampler: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            max_operations: DEFAULT_MAX_OPERATIONS,
            metrics: Metrics::noop(),
            on_update: None,
        }
    }

    /// The sampling endpoint, `http://host:port/sampling`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// The sampler used until the first strategy arrives. Defaults to a
    /// conservative `ProbabilisticSampler` at rate 0.001.
    pub fn with_initial_sampler(mut self, sampler: Sampler) -> Self {
        self.initial_sampler = Some(sampler);
        self
    }

    /// The refresh period. The first fetch happens after a uniform random
    /// delay in `[0, interval)`.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Cap on per-operation sampler registrations.
    pub fn with_max_operations(mut self, max_operations: usize) -> Self {
        self.max_operations = max_operations;
        self
    }

    /// Instruments for refresh outcomes.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Invoked with the active sampler after every successfully processed
    /// strategy response. Primarily for test observability.
    pub fn with_update_callback(
        mut self,
        callback: impl Fn(&Sampler) + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Arc::new(callback));
        self
    }

    /// Start the refresh loop and return the sampler.
    ///
    /// Must be called from within a tokio runtime; the refresh loop runs as
    /// a spawned task until [`RemoteControlledSampler::close`] is called.
    pub fn build(self) -> TraceResult<RemoteControlledSampler> {
        let endpoint = build_endpoint(&self.endpoint, &self.service_name)?;
        let initial = match self.initial_sampler {
            Some(sampler) => sampler,
            None => Sampler::Probabilistic(ProbabilisticSampler::new(
                DEFAULT_INITIAL_SAMPLING_RATE,
            )?),
        };
        let strategy = Arc::new(ArcSwap::from_pointee(initial));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let sampler = RemoteControlledSampler {
            service_name: self.service_name,
            strategy: Arc::clone(&strategy),
            shutdown: shutdown_tx,
        };
        tokio::spawn(run_refresh_loop(
            strategy,
            self.client,
            endpoint,
            self.refresh_interval,
            self.max_operations,
            self.metrics,
            self.on_update,
            shutdown_rx,
        ));
        Ok(sampler)
    }
}

/// Owns the active strategy handle and the background refresh task.
pub struct RemoteControlledSampler {
    service_name: String,
    strategy: Arc<ArcSwap<Sampler>>,
    shutdown: mpsc::Sender<()>,
}

impl RemoteControlledSampler {
    /// Create a builder for the given service.
    pub fn builder<C>(
        service_name: impl Into<String>,
        client: C,
    ) -> RemoteControlledSamplerBuilder<C>
    where
        C: HttpClient + 'static,
    {
        RemoteControlledSamplerBuilder::new(service_name, client)
    }

    /// The service name strategies are fetched for.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Snapshot of the currently active strategy.
    pub fn sampler(&self) -> Arc<Sampler> {
        self.strategy.load_full()
    }

    pub(crate) fn is_sampled(&self, operation: &str, tags: &mut Vec<Tag>) -> bool {
        self.strategy.load().is_sampled(operation, tags)
    }

    /// Stop the refresh loop. Best effort: an in-flight fetch completes in
    /// the background and its result is discarded.
    pub fn close(&self) {
        let _ = self.shutdown.try_send(());
    }
}

impl Drop for RemoteControlledSampler {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RemoteControlledSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteControlledSampler")
            .field("service_name", &self.service_name)
            .field("sampler", &self.strategy.load())
            .finish()
    }
}

fn build_endpoint(endpoint: &str, service_name: &str) -> TraceResult<Uri> {
    if endpoint.is_empty() || service_name.is_empty() {
        return Err("endpoint and service name cannot be empty".into());
    }
    let mut endpoint = url::Url::parse(endpoint)
        .map_err(|err| TraceError::from(format!("invalid sampling endpoint: {err}")))?;
    endpoint
        .query_pairs_mut()
        .append_pair("service", service_name);
    Uri::from_str(endpoint.as_str())
        .map_err(|err| TraceError::from(format!("invalid sampling endpoint: {err}")))
}

#[allow(clippy::too_many_arguments)]
async fn run_refresh_loop<C>(
    strategy: Arc<ArcSwap<Sampler>>,
    client: C,
    endpoint: Uri,
    refresh_interval: Duration,
    max_operations: usize,
    metrics: Metrics,
    on_update: Option<UpdateCallback>,
    mut shutdown: mpsc::Receiver<()>,
) where
    C: HttpClient,
{
    let jitter = refresh_interval.mul_f64(rand::rng().random::<f64>());
    tokio::select! {
        _ = shutdown.recv() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    let mut ticker = tokio::time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                refresh_strategy(
                    &strategy,
                    &client,
                    &endpoint,
                    max_operations,
                    &metrics,
                    on_update.as_deref(),
                )
                .await;
            }
        }
    }
}

async fn refresh_strategy<C>(
    strategy: &ArcSwap<Sampler>,
    client: &C,
    endpoint: &Uri,
    max_operations: usize,
    metrics: &Metrics,
    on_update: Option<&(dyn Fn(&Sampler) + Send + Sync)>,
) where
    C: HttpClient,
{
    let response = match request_strategy(client, endpoint.clone()).await {
        Ok(response) => {
            metrics.sampler_retrieved.increment(1);
            response
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to fetch sampling strategy");
            metrics.sampler_query_failure.increment(1);
            return;
        }
    };

    match reconcile(strategy, response, max_operations) {
        Ok(true) => metrics.sampler_updated.increment(1),
        Ok(false) => {}
        Err(err) => {
            tracing::warn!(error = %err, "failed to update sampler");
            metrics.sampler_update_failure.increment(1);
            return;
        }
    }
    if let Some(callback) = on_update {
        callback(&strategy.load());
    }
}

async fn request_strategy<C>(client: &C, endpoint: Uri) -> TraceResult<SamplingStrategyResponse>
where
    C: HttpClient,
{
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

/// Apply a strategy response to the active handle. Returns whether the
/// effective strategy changed.
fn reconcile(
    active: &ArcSwap<Sampler>,
    response: SamplingStrategyResponse,
    max_operations: usize,
) -> TraceResult<bool> {
    if let Some(operation_sampling) = response.operation_sampling {
        let current = active.load();
        if let Sampler::PerOperation(per_operation) = current.as_ref() {
            return per_operation.update(&operation_sampling);
        }
        let sampler = PerOperationSampler::new(&operation_sampling, max_operations)?;
        active.store(Arc::new(Sampler::PerOperation(sampler)));
        return Ok(true);
    }

    match (
        response.strategy_type,
        &response.probabilistic_sampling,
        &response.rate_limiting_sampling,
    ) {
        (Some(SamplingStrategyType::Probabilistic), Some(probabilistic), _) => {
            let sampler =
                Sampler::Probabilistic(ProbabilisticSampler::new(probabilistic.sampling_rate)?);
            if active.load().equal(&sampler) {
                Ok(false)
            } else {
                active.store(Arc::new(sampler));
                Ok(true)
            }
        }
        (Some(SamplingStrategyType::RateLimiting), _, Some(rate_limiting)) => {
            let current = active.load();
            if let Sampler::RateLimiting(sampler) = current.as_ref() {
                return sampler.update(rate_limiting.max_traces_per_second);
            }
            let sampler = RateLimitingSampler::new(rate_limiting.max_traces_per_second)?;
            active.store(Arc::new(Sampler::RateLimiting(sampler)));
            Ok(true)
        }
        _ => Err(TraceError::MalformedStrategyResponse(
            "expected operationSampling, PROBABILISTIC or RATE_LIMITING".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockClient;

    fn active_of(response: &str, initial: Sampler) -> (Arc<ArcSwap<Sampler>>, TraceResult<bool>) {
        let active = Arc::new(ArcSwap::from_pointee(initial));
        let parsed: SamplingStrategyResponse =
            serde_json::from_str(response).expect("valid test json");
        let changed = reconcile(&active, parsed, 10);
        (active, changed)
    }

    #[test]
    fn probabilistic_response_replaces_active_sampler() {
        let initial = Sampler::Probabilistic(ProbabilisticSampler::new(0.001).expect("valid"));
        let (active, changed) = active_of(
            r#"{"strategyType":"PROBABILISTIC","probabilisticSampling":{"samplingRate":0.5}}"#,
            initial,
        );
        assert!(changed.expect("reconciled"));
        match active.load().as_ref() {
            Sampler::Probabilistic(s) => assert_eq!(s.sampling_rate(), 0.5),
            other => panic!("unexpected sampler {other}"),
        }
    }

    #[test]
    fn identical_probabilistic_response_is_a_noop() {
        let initial = Sampler::Probabilistic(ProbabilisticSampler::new(0.5).expect("valid"));
        let (_, changed) = active_of(
            r#"{"strategyType":"PROBABILISTIC","probabilisticSampling":{"samplingRate":0.5}}"#,
            initial,
        );
        assert!(!changed.expect("reconciled"));
    }

    #[test]
    fn rate_limiting_response_updates_existing_sampler_in_place() {
        let initial = Sampler::RateLimiting(RateLimitingSampler::new(1.0).expect("valid"));
        let (active, changed) = active_of(
            r#"{"strategyType":"RATE_LIMITING","rateLimitingSampling":{"maxTracesPerSecond":3}}"#,
            initial,
        );
        assert!(changed.expect("reconciled"));
        match active.load().as_ref() {
            Sampler::RateLimiting(s) => assert_eq!(s.max_traces_per_second(), 3.0),
            other => panic!("unexpected sampler {other}"),
        }
    }

    #[test]
    fn per_operation_response_installs_and_then_updates() {
        let initial = Sampler::Probabilistic(ProbabilisticSampler::new(0.001).expect("valid"));
        let body = r#"{"operationSampling":{
            "defaultSamplingProbability":0.2,
            "defaultLowerBoundTracesPerSecond":1.0,
            "perOperationStrategies":[{"operation":"op","probabilisticSampling":{"samplingRate":0.7}}]}}"#;
        let (active, changed) = active_of(body, initial);
        assert!(changed.expect("reconciled"));
        assert!(matches!(active.load().as_ref(), Sampler::PerOperation(_)));

        // same response again routes through PerOperationSampler::update
        let parsed: SamplingStrategyResponse = serde_json::from_str(body).expect("valid");
        let changed = reconcile(&active, parsed, 10).expect("reconciled");
        assert!(!changed);
        assert!(matches!(active.load().as_ref(), Sampler::PerOperation(_)));
    }

    #[test]
    fn malformed_response_leaves_sampler_unchanged() {
        let initial = Sampler::Probabilistic(ProbabilisticSampler::new(0.5).expect("valid"));
        let (active, changed) = active_of(r#"{"strategyType":"PROBABILISTIC"}"#, initial);
        assert!(matches!(
            changed,
            Err(TraceError::MalformedStrategyResponse(_))
        ));
        match active.load().as_ref() {
            Sampler::Probabilistic(s) => assert_eq!(s.sampling_rate(), 0.5),
            other => panic!("unexpected sampler {other}"),
        }
    }

    #[test]
    fn endpoint_includes_urlencoded_service_name() {
        let endpoint =
            build_endpoint("http://localhost:5778/sampling", "my service").expect("valid");
        assert_eq!(
            endpoint.to_string(),
            "http://localhost:5778/sampling?service=my+service"
        );
        assert!(build_endpoint("", "svc").is_err());
        assert!(build_endpoint("http://localhost:5778/sampling", "").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_applies_rate_limiting_strategy() {
        let client = MockClient::new(vec![Ok(
            r#"{"strategyType":"RATE_LIMITING","rateLimitingSampling":{"maxTracesPerSecond":2}}"#
                .to_string(),
        )]);
        let sampler = RemoteControlledSampler::builder("svc", client.clone())
            .with_refresh_interval(Duration::from_millis(50))
            .build()
            .expect("valid builder");

        // wait out the jitter and the first tick
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if matches!(sampler.sampler().as_ref(), Sampler::RateLimiting(_)) {
                break;
            }
        }
        match sampler.sampler().as_ref() {
            Sampler::RateLimiting(s) => assert_eq!(s.max_traces_per_second(), 2.0),
            other => panic!("strategy was not applied, still {other}"),
        }

        // at most two decisions admitted from a bucket of size two
        let admitted = (0..10)
            .filter(|_| sampler.is_sampled("op", &mut Vec::new()))
            .count();
        assert!(admitted <= 2, "admitted {admitted} > 2");
        sampler.close();
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_keeps_previous_sampler() {
        let client = MockClient::new(vec![Err("connection refused".to_string())]);
        let factory = crate::metrics::InMemoryMetricsFactory::new();
        let sampler = RemoteControlledSampler::builder("svc", client.clone())
            .with_refresh_interval(Duration::from_millis(50))
            .with_metrics(crate::metrics::Metrics::new(&factory))
            .build()
            .expect("valid builder");

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if client.request_count() > 0 {
                break;
            }
        }
        assert!(client.request_count() > 0);
        assert!(factory.counter_value("jaeger.sampler_queries", &[("result", "err")]) > 0);
        match sampler.sampler().as_ref() {
            Sampler::Probabilistic(s) => assert_eq!(s.sampling_rate(), 0.001),
            other => panic!("default sampler was replaced by {other}"),
        }
        sampler.close();
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_the_refresh_loop() {
        let client = MockClient::new(vec![Ok(
            r#"{"strategyType":"PROBABILISTIC","probabilisticSampling":{"samplingRate":0.5}}"#
                .to_string(),
        )]);
        let sampler = RemoteControlledSampler::builder("svc", client.clone())
            .with_refresh_interval(Duration::from_millis(50))
            .build()
            .expect("valid builder");

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if client.request_count() > 0 {
                break;
            }
        }
        sampler.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_close = client.request_count();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(client.request_count(), after_close);
    }

    #[tokio::test(start_paused = true)]
    async fn update_callback_observes_the_new_sampler() {
        let client = MockClient::new(vec![Ok(
            r#"{"strategyType":"PROBABILISTIC","probabilisticSampling":{"samplingRate":0.5}}"#
                .to_string(),
        )]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sampler = RemoteControlledSampler::builder("svc", client)
            .with_refresh_interval(Duration::from_millis(50))
            .with_update_callback(move |sampler| {
                let _ = tx.send(sampler.to_string());
            })
            .build()
            .expect("valid builder");

        let mut seen = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(description) = rx.try_recv() {
                seen = Some(description);
                break;
            }
        }
        assert_eq!(
            seen.as_deref(),
            Some("ProbabilisticSampler(samplingRate=0.5)")
        );
        sampler.close();
    }
}
