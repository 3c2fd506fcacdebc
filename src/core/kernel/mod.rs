//! `LotusLink` Kernel - shared connectivity substrate for venue adapters
//!
//! Every venue adapter composes the same four pieces instead of re-implementing
//! them: admission control, resilient HTTP, a multiplexed streaming connection
//! and a generic error taxonomy. The kernel contains no venue-specific logic;
//! adapters inject weights, thresholds, channel naming and error-code tables
//! as configuration.
//!
//! # Architecture
//!
//! ## Admission
//! - `TokenBucketLimiter`: weighted token bucket, lazily refilled
//!
//! ## Request/Response
//! - `ResilientHttpClient`: limiter + circuit breaker + bounded retry around an `HttpTransport`
//! - `CircuitBreaker`: Closed/Open/HalfOpen fault isolation
//! - `RetryPolicy`: exponential backoff schedule
//! - `RequestSigner`: pluggable per-attempt request signing
//!
//! ## Streaming
//! - `StreamingConnectionManager`: one connection, many subscriptions, reconnect and heartbeat
//! - `SubscriptionHandle`: bounded drop-oldest event sequence for one channel key
//! - `WsCodec`: venue-specific subscribe encoding and frame routing
//! - `WsConnector`: transport seam, `TungsteniteConnector` by default
//!
//! ## Errors
//! - `ErrorClassifier`: raw failure + `VenueErrorTable` -> `ClassifiedError`
//!
//! ## Composition
//! - `VenueSession`: one of each, wired from a `VenueConfig`
//!
//! # Usage
//!
//! ## Fetch and watch through one session
//! ```rust,no_run
//! use lotus_link::core::config::VenueConfig;
//! use lotus_link::core::kernel::*;
//! use lotus_link::core::types::RequestOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = VenueConfig::new(
//!     "binance",
//!     "https://api.binance.com",
//!     "wss://stream.binance.com:9443/stream",
//! );
//! config.rate_limit = RateLimitConfig::new(1200, 20.0).with_weight("fetchOrderBook", 5);
//!
//! let session = VenueSession::from_config(config, JsonCodec::new())?;
//!
//! let book: serde_json::Value = session
//!     .fetch_json(
//!         "fetchOrderBook",
//!         "/api/v3/depth",
//!         RequestOptions::new().query("symbol", "BTCUSDT"),
//!     )
//!     .await?;
//!
//! let mut trades = session.watch("btcusdt@trade").await?;
//! while let Some(event) = trades.next().await {
//!     match event {
//!         Ok(trade) => println!("{} {}", book["lastUpdateId"], trade),
//!         Err(fault) if fault.is_retryable() => continue,
//!         Err(fault) => return Err(fault.into()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Venue error table
//! ```rust
//! use lotus_link::core::errors::ErrorKind;
//! use lotus_link::core::kernel::*;
//!
//! let table = VenueErrorTable::new()
//!     .with_code_pointer("/retCode")
//!     .with_message_pointer("/retMsg")
//!     .with_success_codes(["0"])
//!     .with_code("10006", ErrorKind::RateLimitedError)
//!     .with_code("10003", ErrorKind::AuthenticationError);
//! let classifier = ErrorClassifier::new(table).for_venue("bybit");
//! # let _ = classifier;
//! ```
pub mod breaker;
pub mod classifier;
pub mod codec;
pub mod limiter;
pub mod rest;
pub mod retry;
pub mod session;
pub mod stream;
pub mod subscription;
pub mod ws;

// Re-export key types for convenience
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState};
pub use classifier::{classify, ErrorClassifier, MessagePattern, VenueErrorRule, VenueErrorTable};
pub use codec::{JsonCodec, WsCodec, WsFrame};
pub use limiter::{RateLimitConfig, RateLimitState, TokenBucketLimiter};
pub use rest::{
    HttpConfig, HttpTransport, ReqwestTransport, RequestSigner, ResilientHttpClient,
    ResilientHttpClientBuilder,
};
pub use retry::RetryPolicy;
pub use session::{VenueSession, VenueSessionBuilder};
pub use stream::{StreamConfig, StreamStats, StreamingConnectionManager};
pub use subscription::SubscriptionHandle;
pub use ws::{TungsteniteConnector, WsConnection, WsConnector};
