use crate::core::errors::{ClassifiedError, ExchangeError};
use crate::core::kernel::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::core::kernel::classifier::ErrorClassifier;
use crate::core::kernel::limiter::{RateLimitConfig, TokenBucketLimiter};
use crate::core::kernel::retry::RetryPolicy;
use crate::core::types::{HttpRequest, RawResponse, RequestOptions};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, instrument, trace, warn};

/// Transport settings for the reqwest-backed client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Default per-call deadline in milliseconds
    pub timeout_ms: u64,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: "LotusLink/0.1".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One network round trip. No retries, no limits, no classification.
///
/// Any HTTP status is a successful transport call; only failures to get a
/// response at all are errors here.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<RawResponse, ExchangeError>;
}

/// Hook for venue authentication, applied to every attempt with a fresh timestamp.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, request: &mut HttpRequest, timestamp_ms: u64) -> Result<(), ExchangeError>;
}

/// `HttpTransport` over a pooled reqwest client
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, config: &HttpConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn build_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn execute(&self, request: HttpRequest) -> Result<RawResponse, ExchangeError> {
        let url = self.build_url(&request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(request.timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout(format!("{} timed out: {}", url, e))
            } else {
                ExchangeError::Request(e)
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| ExchangeError::Network(format!("Failed to read response body: {}", e)))?
            .to_vec();

        trace!(status, bytes = body.len(), "response received");
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

/// HTTP client with admission control, bounded retry and a circuit breaker.
///
/// Per logical `request()`: acquire the operation's weight from the limiter,
/// consult the breaker (fail fast while open), then run up to
/// `max_attempts` transport calls with exponential backoff between
/// retryable failures. The breaker hears exactly one verdict per logical
/// call. Only the final [`ClassifiedError`] ever reaches the caller.
#[derive(Clone)]
pub struct ResilientHttpClient {
    venue: String,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<TokenBucketLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    classifier: ErrorClassifier,
    signer: Option<Arc<dyn RequestSigner>>,
    default_timeout: Duration,
}

impl std::fmt::Debug for ResilientHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientHttpClient")
            .field("venue", &self.venue)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker.state())
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl ResilientHttpClient {
    pub fn builder(venue: impl Into<String>, base_url: impl Into<String>) -> ResilientHttpClientBuilder {
        ResilientHttpClientBuilder::new(venue, base_url)
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[instrument(skip(self, options), fields(venue = %self.venue, method = %method, path = %path))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<RawResponse, ClassifiedError> {
        let operation = options.operation.as_deref().unwrap_or(path);
        self.limiter.acquire(operation).await;

        if let Err(rejected) = self.breaker.try_acquire() {
            debug!(retry_in_ms = rejected.retry_in.as_millis() as u64, "circuit open, failing fast");
            return Err(ClassifiedError::service_unavailable(format!(
                "circuit open for {}, retry in {:?}",
                self.venue, rejected.retry_in
            ))
            .with_venue(self.venue.clone()));
        }

        let mut guard = TrialGuard::new(&self.breaker);
        let outcome = self.run_with_retry(&method, path, &options).await;
        guard.disarm();

        match &outcome {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        outcome
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ClassifiedError> {
        let response = self.request(Method::GET, path, options).await?;
        self.decode(&response)
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T, ClassifiedError> {
        let options = options
            .json(body)
            .map_err(|e| self.classifier.classify(ExchangeError::InvalidParameters(format!(
                "Failed to serialize request body: {}",
                e
            ))))?;
        let response = self.request(Method::POST, path, options).await?;
        self.decode(&response)
    }

    pub async fn delete_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ClassifiedError> {
        let response = self.request(Method::DELETE, path, options).await?;
        self.decode(&response)
    }

    fn decode<T: DeserializeOwned>(&self, response: &RawResponse) -> Result<T, ClassifiedError> {
        response
            .json()
            .map_err(|e| self.classifier.classify(ExchangeError::Json(e)))
    }

    async fn run_with_retry(
        &self,
        method: &Method,
        path: &str,
        options: &RequestOptions,
    ) -> Result<RawResponse, ClassifiedError> {
        let mut attempt = 1;
        loop {
            match self.attempt(method, path, options).await {
                Ok(response) => {
                    if attempt > 1 {
                        debug!(attempt, "request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if !self.retry.should_retry(&err) {
                        debug!(attempt, error = %err, "non-retryable failure");
                        return Err(err);
                    }
                    if attempt >= self.retry.max_attempts {
                        warn!(attempts = attempt, error = %err, "retries exhausted");
                        return Err(err);
                    }

                    let delay = self.retry.delay_with_hint(attempt, err.retry_after);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        path: &str,
        options: &RequestOptions,
    ) -> Result<RawResponse, ClassifiedError> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let mut request = HttpRequest {
            method: method.clone(),
            path: path.to_string(),
            headers: options.headers.clone(),
            query: options.query.clone(),
            body: options.body.clone().unwrap_or_default(),
            timeout,
        };

        if options.signed {
            let signer = self.signer.as_ref().ok_or_else(|| {
                self.classifier.classify(ExchangeError::AuthError(
                    "Authentication required but no signer provided".to_string(),
                ))
            })?;
            let timestamp = timestamp_ms().map_err(|e| self.classifier.classify(e))?;
            signer
                .sign(&mut request, timestamp)
                .map_err(|e| self.classifier.classify(e))?;
        }

        let response = match tokio::time::timeout(timeout, self.transport.execute(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.classifier.classify(e)),
            Err(_) => {
                return Err(self.classifier.classify(ExchangeError::Timeout(format!(
                    "{} {} exceeded {:?}",
                    method, path, timeout
                ))))
            }
        };

        if !response.is_success() {
            let retry_after = parse_retry_after(&response);
            return Err(self.classifier.classify(ExchangeError::Http {
                status: response.status,
                body: response.text(),
                retry_after,
            }));
        }

        if let Some(failure) = self
            .classifier
            .table()
            .failure_in_success_body(response.status, &response.body)
        {
            return Err(self.classifier.classify(failure));
        }

        Ok(response)
    }
}

/// Gives a half-open trial slot back if the request future is dropped mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial();
        }
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
fn parse_retry_after(response: &RawResponse) -> Option<Duration> {
    response
        .header("Retry-After")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn timestamp_ms() -> Result<u64, ExchangeError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| ExchangeError::Other(format!("Failed to get timestamp: {}", e)))
}

/// Builder for [`ResilientHttpClient`]
pub struct ResilientHttpClientBuilder {
    venue: String,
    base_url: String,
    http: HttpConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    limiter: Option<Arc<TokenBucketLimiter>>,
    rate_limit: RateLimitConfig,
    breaker: CircuitBreakerConfig,
    retry: RetryPolicy,
    classifier: Option<ErrorClassifier>,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl ResilientHttpClientBuilder {
    pub fn new(venue: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            base_url: base_url.into(),
            http: HttpConfig::default(),
            transport: None,
            limiter: None,
            rate_limit: RateLimitConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            classifier: None,
            signer: None,
        }
    }

    pub fn with_http_config(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    /// Replace the reqwest transport, e.g. with a recorded one in tests.
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share a limiter with other components of the same adapter instance.
    pub fn with_limiter(mut self, limiter: Arc<TokenBucketLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Give the client its own limiter. Ignored when [`Self::with_limiter`] supplies one.
    pub fn with_rate_limit(mut self, config: &RateLimitConfig) -> Self {
        self.rate_limit = config.clone();
        self
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn build(self) -> Result<ResilientHttpClient, ExchangeError> {
        if self.retry.max_attempts == 0 {
            return Err(ExchangeError::InvalidParameters(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        let limiter = match self.limiter {
            Some(limiter) => limiter,
            None => Arc::new(TokenBucketLimiter::new(&self.rate_limit)?),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.base_url, &self.http)?),
        };
        let classifier = self
            .classifier
            .unwrap_or_default()
            .for_venue(self.venue.clone());

        Ok(ResilientHttpClient {
            venue: self.venue,
            transport,
            limiter,
            breaker: Arc::new(CircuitBreaker::new(self.breaker)),
            retry: self.retry,
            classifier,
            signer: self.signer,
            default_timeout: self.http.timeout(),
        })
    }
}
