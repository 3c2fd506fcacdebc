use crate::core::config::VenueConfig;
use crate::core::errors::{ClassifiedError, ExchangeError};
use crate::core::kernel::classifier::ErrorClassifier;
use crate::core::kernel::codec::WsCodec;
use crate::core::kernel::limiter::TokenBucketLimiter;
use crate::core::kernel::rest::{HttpTransport, RequestSigner, ResilientHttpClient};
use crate::core::kernel::stream::StreamingConnectionManager;
use crate::core::kernel::subscription::SubscriptionHandle;
use crate::core::kernel::ws::WsConnector;
use crate::core::types::RequestOptions;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::instrument;

/// Everything one adapter instance shares between its operations:
/// one limiter, one breaker-guarded HTTP client, one streaming connection.
///
/// Nothing here is shared across sessions.
#[derive(Debug)]
pub struct VenueSession<C: WsCodec> {
    config: VenueConfig,
    http: ResilientHttpClient,
    stream: StreamingConnectionManager<C>,
}

impl<C: WsCodec> VenueSession<C> {
    /// Validate `config` and wire the session with the default transports.
    pub fn from_config(config: VenueConfig, codec: C) -> Result<Self, ExchangeError> {
        VenueSessionBuilder::new(config, codec).build()
    }

    pub fn builder(config: VenueConfig, codec: C) -> VenueSessionBuilder<C> {
        VenueSessionBuilder::new(config, codec)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &VenueConfig {
        &self.config
    }

    pub fn http(&self) -> &ResilientHttpClient {
        &self.http
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        self.http.limiter()
    }

    pub fn stream(&self) -> &StreamingConnectionManager<C> {
        &self.stream
    }

    /// `fetchX`: admission, resilient request and decoding, with `operation` naming the weight.
    #[instrument(skip(self, options), fields(venue = %self.config.name, operation = %operation))]
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ClassifiedError> {
        self.http
            .get_json(path, options.operation(operation))
            .await
    }

    /// `watchX`: a handle on the session's shared streaming connection.
    pub async fn watch(
        &self,
        channel_key: impl Into<String>,
    ) -> Result<SubscriptionHandle<C::Message>, ClassifiedError> {
        self.stream.subscribe(channel_key).await
    }

    /// Close the streaming connection. HTTP calls keep working.
    pub async fn close(&self) {
        self.stream.shutdown().await;
    }
}

/// Builder for [`VenueSession`] when transports or signing need replacing.
pub struct VenueSessionBuilder<C: WsCodec> {
    config: VenueConfig,
    codec: C,
    transport: Option<Arc<dyn HttpTransport>>,
    connector: Option<Arc<dyn WsConnector>>,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl<C: WsCodec> VenueSessionBuilder<C> {
    pub fn new(config: VenueConfig, codec: C) -> Self {
        Self {
            config,
            codec,
            transport: None,
            connector: None,
            signer: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn WsConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn build(self) -> Result<VenueSession<C>, ExchangeError> {
        let config = self.config;
        config.validate()?;

        let classifier = ErrorClassifier::new(config.errors.clone());

        let mut http = ResilientHttpClient::builder(config.name.clone(), config.rest_url.clone())
            .with_http_config(config.http.clone())
            .with_rate_limit(&config.rate_limit)
            .with_retry_policy(config.retry.clone())
            .with_breaker(config.breaker.clone())
            .with_classifier(classifier.clone());
        if let Some(transport) = self.transport {
            http = http.with_transport(transport);
        }
        if let Some(signer) = self.signer {
            http = http.with_signer(signer);
        }

        let mut stream = StreamingConnectionManager::new(
            config.name.clone(),
            config.ws_url.clone(),
            self.codec,
            config.stream.clone(),
        )
        .with_classifier(classifier);
        if let Some(connector) = self.connector {
            stream = stream.with_connector(connector);
        }

        Ok(VenueSession {
            http: http.build()?,
            stream,
            config,
        })
    }
}
