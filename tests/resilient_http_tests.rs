
use integration_test_config::{utils, ScriptedTransport, TestConfig};
use lotus_link::core::errors::{ErrorKind, ExchangeError};
use lotus_link::core::kernel::{
    CircuitBreakerConfig, CircuitState, ErrorClassifier, RateLimitConfig, RequestSigner,
    ResilientHttpClient, RetryPolicy, VenueErrorTable,
};
use lotus_link::core::types::{HttpRequest, RequestOptions};
use reqwest::Method;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn client(transport: Arc<ScriptedTransport>) -> ResilientHttpClient {
    TestConfig::init_tracing();
    ResilientHttpClient::builder("testex", "https://api.testex.invalid")
        .with_transport(transport)
        .with_retry_policy(RetryPolicy::new(3, 100, 10_000, 2.0))
        .with_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout_ms: 30_000,
        })
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_three_503s_retry_on_schedule_then_surface() {
    let transport = ScriptedTransport::always(503, "Service Unavailable");
    let client = client(transport.clone());

    let err = client
        .request(Method::GET, "/api/v3/ticker", RequestOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::TransientError);
    assert!(err.retryable);
    assert_eq!(err.status, Some(503));
    assert_eq!(err.venue.as_deref(), Some("testex"));

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    let first = calls[0].at;
    let offsets: Vec<Duration> = calls.iter().map(|c| c.at - first).collect();
    assert_eq!(
        offsets,
        vec![
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::from_millis(300)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_fails_fast_without_network() {
    let transport = ScriptedTransport::new(vec![
        Ok(utils::response(503, "down")),
        Ok(utils::response(503, "down")),
        Ok(utils::response(200, "{}")),
    ]);
    let client = ResilientHttpClient::builder("testex", "https://api.testex.invalid")
        .with_transport(transport.clone())
        .with_retry_policy(RetryPolicy::none())
        .with_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout_ms: 5_000,
        })
        .build()
        .unwrap();

    for _ in 0..2 {
        let err = client
            .request(Method::GET, "/status", RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransientError);
    }
    assert_eq!(client.breaker_state(), CircuitState::Open);

    let err = client
        .request(Method::GET, "/status", RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
    assert!(!err.retryable);
    assert_eq!(transport.call_count(), 2);

    // Cooldown elapsed: one trial goes through and closes the circuit
    tokio::time::advance(Duration::from_secs(5)).await;
    client
        .request(Method::GET, "/status", RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(client.breaker_state(), CircuitState::Closed);
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_counts_logical_calls_not_attempts() {
    let transport = ScriptedTransport::new(vec![
        Ok(utils::response(503, "busy")),
        Ok(utils::response(503, "busy")),
        Ok(utils::response(503, "busy")),
        Ok(utils::response(200, "{}")),
    ]);
    let client = client(transport.clone());

    // Three failed attempts, one failed logical call, threshold is two
    assert!(client
        .request(Method::GET, "/depth", RequestOptions::new())
        .await
        .is_err());
    assert_eq!(transport.call_count(), 3);
    assert_eq!(client.breaker_state(), CircuitState::Closed);

    client
        .request(Method::GET, "/depth", RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(client.breaker_state(), CircuitState::Closed);
}

fn single_attempt_client(transport: Arc<ScriptedTransport>) -> ResilientHttpClient {
    TestConfig::init_tracing();
    ResilientHttpClient::builder("testex", "https://api.testex.invalid")
        .with_transport(transport)
        .with_retry_policy(RetryPolicy::none())
        .with_breaker(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout_ms: 5_000,
        })
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_every_failed_call_extends_the_failure_streak() {
    let transport = ScriptedTransport::new(vec![
        Ok(utils::response(503, "down")),
        Ok(utils::response(404, "no such endpoint")),
        Ok(utils::response(503, "down")),
    ]);
    let client = single_attempt_client(transport.clone());

    let err = client
        .request(Method::GET, "/depth", RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::TransientError);
    assert_eq!(client.breaker_state(), CircuitState::Closed);

    // A non-retryable failure is still a failure, not a reset
    let err = client
        .request(Method::GET, "/depth", RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFoundError);
    assert_eq!(client.breaker_state(), CircuitState::Open);

    let err = client
        .request(Method::GET, "/depth", RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failures_open_the_circuit() {
    let transport = ScriptedTransport::always(401, "invalid api key");
    let client = single_attempt_client(transport.clone());

    for _ in 0..2 {
        let err = client
            .request(Method::GET, "/account", RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationError);
    }
    assert_eq!(client.breaker_state(), CircuitState::Open);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_half_open_trial_reopens_circuit() {
    let transport = ScriptedTransport::new(vec![
        Ok(utils::response(503, "down")),
        Ok(utils::response(503, "down")),
        Ok(utils::response(400, "bad request")),
        Ok(utils::response(200, "{}")),
    ]);
    let client = single_attempt_client(transport.clone());

    for _ in 0..2 {
        assert!(client
            .request(Method::GET, "/status", RequestOptions::new())
            .await
            .is_err());
    }
    assert_eq!(client.breaker_state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(5)).await;
    let err = client
        .request(Method::GET, "/status", RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnclassifiedError);
    assert_eq!(client.breaker_state(), CircuitState::Open);
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_lengthens_backoff() {
    let transport = ScriptedTransport::new(vec![
        Ok(utils::response_with_header(429, "slow down", "retry-after", "2")),
        Ok(utils::response(200, r#"{"ok":true}"#)),
    ]);
    let client = client(transport.clone());

    let response = client
        .request(Method::GET, "/orders", RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    let calls = transport.calls();
    assert_eq!(calls[1].at - calls[0].at, Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_venue_code_drives_classification() {
    let transport = ScriptedTransport::always(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#);
    let table = VenueErrorTable::new()
        .with_code_pointer("/code")
        .with_message_pointer("/msg")
        .with_code("-1121", ErrorKind::ValidationError);
    let client = ResilientHttpClient::builder("binance", "https://api.testex.invalid")
        .with_transport(transport.clone())
        .with_classifier(ErrorClassifier::new(table))
        .build()
        .unwrap();

    let err = client
        .request(Method::GET, "/api/v3/depth", RequestOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ValidationError);
    assert!(!err.retryable);
    assert_eq!(err.venue_code.as_deref(), Some("-1121"));
    assert_eq!(err.message, "Invalid symbol.");
    assert!(err.cause.is_some());
    assert_eq!(transport.call_count(), 1);
    assert_eq!(client.breaker_state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failure_inside_success_body_is_retried() {
    let transport = ScriptedTransport::new(vec![
        Ok(utils::response(200, r#"{"retCode":10006,"retMsg":"Too many visits!"}"#)),
        Ok(utils::response(200, r#"{"retCode":0,"retMsg":"OK","result":{"list":[]}}"#)),
    ]);
    let table = VenueErrorTable::new()
        .with_code_pointer("/retCode")
        .with_message_pointer("/retMsg")
        .with_success_codes(["0"])
        .with_code("10006", ErrorKind::RateLimitedError);
    let client = ResilientHttpClient::builder("bybit", "https://api.testex.invalid")
        .with_transport(transport.clone())
        .with_classifier(ErrorClassifier::new(table))
        .build()
        .unwrap();

    let body: serde_json::Value = client
        .get_json("/v5/market/tickers", RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(body["retCode"], 0);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_per_call_deadline_is_transient() {
    let transport =
        ScriptedTransport::with_latency(vec![Ok(utils::response(200, "{}"))], Duration::from_secs(5));
    let client = ResilientHttpClient::builder("testex", "https://api.testex.invalid")
        .with_transport(transport.clone())
        .with_retry_policy(RetryPolicy::none())
        .build()
        .unwrap();

    let err = client
        .request(
            Method::GET,
            "/slow",
            RequestOptions::new().timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::TransientError);
    assert!(err.retryable);
    assert!(matches!(
        err.cause.as_deref(),
        Some(ExchangeError::Timeout(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_limiter_is_charged_once_per_logical_call() {
    let transport = ScriptedTransport::always(503, "busy");
    let client = ResilientHttpClient::builder("testex", "https://api.testex.invalid")
        .with_transport(transport.clone())
        .with_rate_limit(&RateLimitConfig::new(10, 0.001).with_weight("createOrder", 4))
        .with_retry_policy(RetryPolicy::new(3, 100, 1_000, 2.0))
        .build()
        .unwrap();

    let _ = client
        .request(
            Method::POST,
            "/api/v3/order",
            RequestOptions::new().operation("createOrder"),
        )
        .await;

    assert_eq!(transport.call_count(), 3);
    assert!((client.limiter().available() - 6.0).abs() < 0.01);
}

struct CountingSigner {
    signed: AtomicU32,
}

impl RequestSigner for CountingSigner {
    fn sign(&self, request: &mut HttpRequest, timestamp_ms: u64) -> Result<(), ExchangeError> {
        self.signed.fetch_add(1, Ordering::SeqCst);
        request
            .headers
            .push(("X-TS".to_string(), timestamp_ms.to_string()));
        request
            .headers
            .push(("X-SIGN".to_string(), format!("sig:{}", request.query_string())));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_signer_runs_on_every_attempt() {
    let transport = ScriptedTransport::new(vec![
        Ok(utils::response(502, "bad gateway")),
        Ok(utils::response(200, "{}")),
    ]);
    let signer = Arc::new(CountingSigner {
        signed: AtomicU32::new(0),
    });
    let client = ResilientHttpClient::builder("testex", "https://api.testex.invalid")
        .with_transport(transport.clone())
        .with_signer(signer.clone())
        .build()
        .unwrap();

    client
        .request(
            Method::GET,
            "/api/v3/account",
            RequestOptions::new().query("recvWindow", "5000").signed(),
        )
        .await
        .unwrap();

    assert_eq!(signer.signed.load(Ordering::SeqCst), 2);
    for call in transport.calls() {
        let sign = call
            .request
            .headers
            .iter()
            .find(|(k, _)| k == "X-SIGN")
            .map(|(_, v)| v.clone());
        assert_eq!(sign.as_deref(), Some("sig:recvWindow=5000"));
        // Signing adds to a fresh copy of the options each time
        assert_eq!(call.request.headers.len(), 2);
    }
}

#[tokio::test(start_paused = true)]
async fn test_signed_request_without_signer_is_auth_error() {
    let transport = ScriptedTransport::always(200, "{}");
    let client = client(transport.clone());

    let err = client
        .request(Method::GET, "/private", RequestOptions::new().signed())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::AuthenticationError);
    assert_eq!(transport.call_count(), 0);
}
