use crate::core::kernel::breaker::CircuitBreakerConfig;
use crate::core::kernel::classifier::VenueErrorTable;
use crate::core::kernel::limiter::RateLimitConfig;
use crate::core::kernel::rest::HttpConfig;
use crate::core::kernel::retry::RetryPolicy;
use crate::core::kernel::stream::StreamConfig;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;

/// Everything one venue adapter hands to the kernel.
///
/// Every section has a default so a config document only needs to spell out
/// what differs for the venue:
///
/// ```json
/// {
///   "name": "bybit",
///   "rest_url": "https://api.bybit.com",
///   "ws_url": "wss://stream.bybit.com/v5/public/linear",
///   "rate_limit": { "capacity": 10, "refill_per_second": 1.0, "weights": { "createOrder": 5 } },
///   "errors": { "code_pointer": "/retCode", "success_codes": ["0"] }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    pub name: String,
    pub rest_url: String,
    pub ws_url: String,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub http: HttpConfig,
    pub stream: StreamConfig,
    pub errors: VenueErrorTable,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            name: "venue".to_string(),
            rest_url: String::new(),
            ws_url: String::new(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            http: HttpConfig::default(),
            stream: StreamConfig::default(),
            errors: VenueErrorTable::default(),
        }
    }
}

impl VenueConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, rest_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rest_url: rest_url.into(),
            ws_url: ws_url.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON config document.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)
            .map_err(|e| ConfigError::InvalidConfiguration(format!("Malformed venue config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the kernel components cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(invalid("venue name must not be empty"));
        }

        self.rate_limit.validate()?;

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier must be at least 1.0"));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(invalid("retry.max_delay_ms must not be below retry.initial_delay_ms"));
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(invalid("breaker thresholds must be positive"));
        }

        if self.stream.queue_capacity == 0 {
            return Err(invalid("stream.queue_capacity must be positive"));
        }
        if self.stream.heartbeat_interval_ms == 0 || self.stream.pong_timeout_ms == 0 {
            return Err(invalid("stream heartbeat timings must be positive"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfiguration(message.to_string())
}

/// API credentials for one venue session. Never serialized in clear.
#[derive(Debug, Clone)]
pub struct Credentials {
    api_key: Secret<String>,
    secret_key: Secret<String>,
}

impl Serialize for Credentials {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Credentials", 2)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("secret_key", "[REDACTED]")?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Credentials {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct CredentialsHelper {
            api_key: String,
            secret_key: String,
        }

        let helper = CredentialsHelper::deserialize(deserializer)?;
        Ok(Self::new(helper.api_key, helper.secret_key))
    }
}

impl Credentials {
    #[must_use]
    pub fn new(api_key: String, secret_key: String) -> Self {
        Self {
            api_key: Secret::new(api_key),
            secret_key: Secret::new(secret_key),
        }
    }

    /// Read `{PREFIX}_API_KEY` and `{PREFIX}_SECRET_KEY`.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let api_key_var = format!("{}_API_KEY", prefix.to_uppercase());
        let secret_key_var = format!("{}_SECRET_KEY", prefix.to_uppercase());

        let api_key = env::var(&api_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(api_key_var))?;
        let secret_key = env::var(&secret_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secret_key_var))?;

        Ok(Self::new(api_key, secret_key))
    }

    /// Load a `.env` style file first (a missing file is fine), then read the environment.
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str, path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(path) {
            Ok(()) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.secret_key.expose_secret().is_empty()
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get secret key (use carefully - exposes secret)
    pub fn secret_key(&self) -> &str {
        self.secret_key.expose_secret()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorKind;

    #[test]
    fn test_defaults_are_valid() {
        let config = VenueConfig::new("okx", "https://www.okx.com", "wss://ws.okx.com:8443/ws/v5/public");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let document = r#"{
            "name": "bybit",
            "rest_url": "https://api.bybit.com",
            "rate_limit": { "capacity": 10, "refill_per_second": 1.0, "weights": { "createOrder": 5 } },
            "retry": { "max_attempts": 3, "initial_delay_ms": 100, "max_delay_ms": 1000, "multiplier": 2.0 },
            "errors": { "codes": { "10003": { "kind": "AuthenticationError" } } }
        }"#;

        let config = VenueConfig::from_json_str(document).unwrap();
        assert_eq!(config.rate_limit.capacity, 10);
        assert_eq!(config.rate_limit.weights.get("createOrder"), Some(&5));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.retry.retryable_status_codes.contains(&503));
        assert_eq!(config.stream.queue_capacity, StreamConfig::default().queue_capacity);
        assert_eq!(
            config.errors.codes.get("10003").map(|rule| rule.kind),
            Some(ErrorKind::AuthenticationError)
        );
    }

    #[test]
    fn test_rejects_zero_weight() {
        let mut config = VenueConfig::new("binance", "https://fapi.binance.com", "");
        config.rate_limit.weights.insert("cancelOrder".to_string(), 0);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cancelOrder"));
    }

    #[test]
    fn test_rejects_bad_retry_policy() {
        let mut config = VenueConfig::new("binance", "https://fapi.binance.com", "");
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = VenueConfig::new("binance", "https://fapi.binance.com", "");
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let credentials = Credentials::new("key".to_string(), "secret".to_string());
        let json = serde_json::to_string(&credentials).unwrap();
        assert!(!json.contains("\"secret\""));
        assert!(json.contains("[REDACTED]"));
        assert!(credentials.has_credentials());
        assert_eq!(credentials.api_key(), "key");
    }

    #[test]
    fn test_missing_env_credentials() {
        let err = Credentials::from_env("LOTUS_LINK_DOES_NOT_EXIST").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvironmentVariable(_)));
    }

    #[cfg(feature = "env-file")]
    #[test]
    fn test_credentials_from_env_file() {
        let path = std::env::temp_dir().join(format!("lotus_link_{}.env", std::process::id()));
        std::fs::write(
            &path,
            "LOTUS_LINK_FILE_API_KEY=file-key\nLOTUS_LINK_FILE_SECRET_KEY=file-secret\n",
        )
        .unwrap();

        let credentials =
            Credentials::from_env_file("LOTUS_LINK_FILE", path.to_str().unwrap()).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(credentials.api_key(), "file-key");
        assert_eq!(credentials.secret_key(), "file-secret");
    }

    #[cfg(feature = "env-file")]
    #[test]
    fn test_missing_env_file_falls_back_to_environment() {
        let err = Credentials::from_env_file("LOTUS_LINK_NO_FILE", "/nonexistent/lotus.env")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvironmentVariable(_)));
    }
}
