use crate::core::errors::ExchangeError;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_tungstenite::tungstenite::Message;

/// What one incoming data frame means to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame<M> {
    /// An event for the subscription registered under `channel`.
    Data { channel: String, message: M },
    /// Application-level heartbeat reply.
    Pong,
    /// A venue-reported failure, scoped to one channel when `channel` is set.
    Error {
        channel: Option<String>,
        code: Option<String>,
        message: String,
    },
}

/// Codec trait for handling exchange-specific WebSocket message encoding/decoding
///
/// Each venue implements this to translate channel keys into its subscribe
/// wire format and to tell the manager which channel an incoming frame
/// belongs to. The payload itself is handed on untouched for the adapter to
/// normalize.
pub trait WsCodec: Send + Sync + 'static {
    /// The type representing decoded events from this venue
    type Message: Send + 'static;

    /// Encode a subscription request for the given channel keys
    fn encode_subscription(
        &self,
        streams: &[impl AsRef<str> + Send + Sync],
    ) -> Result<Message, ExchangeError>;

    /// Encode an unsubscription request for the given channel keys
    fn encode_unsubscription(
        &self,
        streams: &[impl AsRef<str> + Send + Sync],
    ) -> Result<Message, ExchangeError>;

    /// Optional login frame sent right after the transport opens, before any subscription.
    fn encode_auth(&self) -> Result<Option<Message>, ExchangeError> {
        Ok(None)
    }

    /// Heartbeat probe. Venues with text pings override this.
    fn encode_ping(&self) -> Message {
        Message::Ping(Vec::new())
    }

    /// Decode a raw data message.
    ///
    /// Control frames (ping, pong, close) never reach the codec.
    ///
    /// # Returns
    /// - `Ok(Some(frame))` - a routable frame
    /// - `Ok(None)` - acknowledgements and other frames the manager can ignore
    /// - `Err(error)` - the frame could not be decoded
    fn decode_message(&self, message: Message) -> Result<Option<WsFrame<Self::Message>>, ExchangeError>;
}

/// Configurable codec for the common JSON `{"method": ..., "params": [...]}` family of protocols.
///
/// Defaults follow the Binance combined-stream shape; every field name and
/// pointer can be changed for venues such as Bybit (`op`/`args`, `/topic`).
/// Venues whose subscriptions are objects, like OKX's
/// `{"channel": "tickers", "instId": "BTC-USDT"}`, use composite channel keys
/// (`tickers:BTC-USDT`) via [`JsonCodec::with_channel_fields`].
#[derive(Debug)]
pub struct JsonCodec {
    op_field: String,
    subscribe_op: String,
    unsubscribe_op: String,
    args_field: String,
    id_field: Option<String>,
    channel_pointer: String,
    channel_fields: Option<ChannelFields>,
    data_pointer: Option<String>,
    error_pointer: Option<String>,
    error_value: Option<String>,
    error_code_pointer: Option<String>,
    error_message_pointer: Option<String>,
    ping_text: Option<String>,
    pong_text: Option<String>,
    auth_message: Option<Value>,
    next_id: AtomicU64,
}

/// Composite channel key layout: one subscription argument field and one frame pointer per part.
#[derive(Debug)]
struct ChannelFields {
    separator: String,
    fields: Vec<(String, String)>,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            op_field: "method".to_string(),
            subscribe_op: "SUBSCRIBE".to_string(),
            unsubscribe_op: "UNSUBSCRIBE".to_string(),
            args_field: "params".to_string(),
            id_field: Some("id".to_string()),
            channel_pointer: "/stream".to_string(),
            channel_fields: None,
            data_pointer: Some("/data".to_string()),
            error_pointer: Some("/error".to_string()),
            error_value: None,
            error_code_pointer: Some("/error/code".to_string()),
            error_message_pointer: Some("/error/msg".to_string()),
            ping_text: None,
            pong_text: None,
            auth_message: None,
            next_id: AtomicU64::new(1),
        }
    }
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the operation field and its subscribe/unsubscribe values.
    pub fn with_operations(
        mut self,
        op_field: impl Into<String>,
        subscribe: impl Into<String>,
        unsubscribe: impl Into<String>,
    ) -> Self {
        self.op_field = op_field.into();
        self.subscribe_op = subscribe.into();
        self.unsubscribe_op = unsubscribe.into();
        self
    }

    pub fn with_args_field(mut self, field: impl Into<String>) -> Self {
        self.args_field = field.into();
        self
    }

    pub fn without_request_id(mut self) -> Self {
        self.id_field = None;
        self
    }

    /// JSON pointer to the channel key in data frames.
    pub fn with_channel_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.channel_pointer = pointer.into();
        self
    }

    /// Split channel keys on `separator` into subscription argument objects.
    ///
    /// Each `(field, pointer)` pair names the argument field for one key part
    /// and where that part is found in incoming frames. With
    /// `[("channel", "/arg/channel"), ("instId", "/arg/instId")]` and `:`,
    /// the key `tickers:BTC-USDT` subscribes with
    /// `{"channel":"tickers","instId":"BTC-USDT"}` and routes frames whose
    /// `arg` carries both values. Overrides the single channel pointer.
    pub fn with_channel_fields<I, F, P>(mut self, separator: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (F, P)>,
        F: Into<String>,
        P: Into<String>,
    {
        self.channel_fields = Some(ChannelFields {
            separator: separator.into(),
            fields: fields
                .into_iter()
                .map(|(field, pointer)| (field.into(), pointer.into()))
                .collect(),
        });
        self
    }

    /// JSON pointer to the payload; `None` hands over the whole frame.
    pub fn with_data_pointer(mut self, pointer: Option<String>) -> Self {
        self.data_pointer = pointer;
        self
    }

    /// A frame is an error when `pointer` is present (and equals `value`, if given).
    pub fn with_error_marker(mut self, pointer: impl Into<String>, value: Option<String>) -> Self {
        self.error_pointer = Some(pointer.into());
        self.error_value = value;
        self
    }

    pub fn with_error_fields(
        mut self,
        code_pointer: impl Into<String>,
        message_pointer: impl Into<String>,
    ) -> Self {
        self.error_code_pointer = Some(code_pointer.into());
        self.error_message_pointer = Some(message_pointer.into());
        self
    }

    /// Text heartbeat, e.g. OKX's bare `ping`/`pong`.
    pub fn with_text_heartbeat(mut self, ping: impl Into<String>, pong: impl Into<String>) -> Self {
        self.ping_text = Some(ping.into());
        self.pong_text = Some(pong.into());
        self
    }

    pub fn with_auth_message(mut self, message: Value) -> Self {
        self.auth_message = Some(message);
        self
    }

    fn encode_request(&self, op: &str, streams: &[impl AsRef<str>]) -> Result<Message, ExchangeError> {
        let params = streams
            .iter()
            .map(|s| self.encode_arg(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut request = Map::new();
        request.insert(self.op_field.clone(), json!(op));
        request.insert(self.args_field.clone(), Value::Array(params));
        if let Some(id_field) = &self.id_field {
            request.insert(id_field.clone(), json!(self.next_id.fetch_add(1, Ordering::Relaxed)));
        }
        Ok(Message::Text(Value::Object(request).to_string()))
    }

    fn encode_arg(&self, key: &str) -> Result<Value, ExchangeError> {
        let Some(layout) = &self.channel_fields else {
            return Ok(json!(key));
        };
        let parts: Vec<&str> = key.splitn(layout.fields.len(), layout.separator.as_str()).collect();
        if parts.len() != layout.fields.len() || parts.iter().any(|part| part.is_empty()) {
            return Err(ExchangeError::InvalidParameters(format!(
                "channel key '{}' must have {} parts separated by '{}'",
                key,
                layout.fields.len(),
                layout.separator
            )));
        }
        let arg: Map<String, Value> = layout
            .fields
            .iter()
            .zip(parts)
            .map(|((field, _), part)| (field.clone(), json!(part)))
            .collect();
        Ok(Value::Object(arg))
    }

    fn channel_of(&self, value: &Value) -> Option<String> {
        let Some(layout) = &self.channel_fields else {
            return pointer_string(value, Some(&self.channel_pointer));
        };
        let parts = layout
            .fields
            .iter()
            .map(|(_, pointer)| pointer_string(value, Some(pointer)))
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join(&layout.separator))
    }

    fn is_error(&self, value: &Value) -> bool {
        let Some(pointer) = self.error_pointer.as_deref() else {
            return false;
        };
        match (value.pointer(pointer), &self.error_value) {
            (None | Some(Value::Null), _) => false,
            (Some(found), Some(expected)) => found.as_str() == Some(expected.as_str()),
            (Some(_), None) => true,
        }
    }
}

fn pointer_string(value: &Value, pointer: Option<&str>) -> Option<String> {
    match value.pointer(pointer?)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

impl WsCodec for JsonCodec {
    type Message = Value;

    fn encode_subscription(
        &self,
        streams: &[impl AsRef<str> + Send + Sync],
    ) -> Result<Message, ExchangeError> {
        self.encode_request(&self.subscribe_op, streams)
    }

    fn encode_unsubscription(
        &self,
        streams: &[impl AsRef<str> + Send + Sync],
    ) -> Result<Message, ExchangeError> {
        self.encode_request(&self.unsubscribe_op, streams)
    }

    fn encode_auth(&self) -> Result<Option<Message>, ExchangeError> {
        Ok(self
            .auth_message
            .as_ref()
            .map(|message| Message::Text(message.to_string())))
    }

    fn encode_ping(&self) -> Message {
        match &self.ping_text {
            Some(text) => Message::Text(text.clone()),
            None => Message::Ping(Vec::new()),
        }
    }

    fn decode_message(&self, message: Message) -> Result<Option<WsFrame<Value>>, ExchangeError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8(data).map_err(|e| {
                ExchangeError::InvalidParameters(format!("Invalid UTF-8 in binary message: {}", e))
            })?,
            _ => return Ok(None),
        };

        if self.pong_text.as_deref() == Some(text.trim()) {
            return Ok(Some(WsFrame::Pong));
        }

        let value: Value = serde_json::from_str(&text)?;
        let channel = self.channel_of(&value);

        if self.is_error(&value) {
            let message = pointer_string(&value, self.error_message_pointer.as_deref())
                .unwrap_or_else(|| text.clone());
            return Ok(Some(WsFrame::Error {
                channel,
                code: pointer_string(&value, self.error_code_pointer.as_deref()),
                message,
            }));
        }

        let Some(channel) = channel else {
            // Subscription acks, heartbeats and other bookkeeping frames
            return Ok(None);
        };

        let payload = match self.data_pointer.as_deref() {
            Some(pointer) => match value.pointer(pointer) {
                Some(data) => data.clone(),
                None => return Ok(None),
            },
            None => value,
        };

        Ok(Some(WsFrame::Data {
            channel,
            message: payload,
        }))
    }
}
