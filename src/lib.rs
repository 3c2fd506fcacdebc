pub mod core;

pub use crate::core::config::{ConfigError, Credentials, VenueConfig};
pub use crate::core::errors::{ClassifiedError, ErrorKind, ExchangeError};
pub use crate::core::kernel::{
    classify, ErrorClassifier, JsonCodec, ResilientHttpClient, StreamingConnectionManager,
    SubscriptionHandle, TokenBucketLimiter, VenueErrorTable, VenueSession, WsCodec,
};
pub use crate::core::types::*;
