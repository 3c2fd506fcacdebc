use crate::core::errors::{ClassifiedError, ExchangeError};
use crate::core::kernel::classifier::ErrorClassifier;
use crate::core::kernel::codec::{WsCodec, WsFrame};
use crate::core::kernel::subscription::{DeliveryQueue, SubscriptionHandle};
use crate::core::kernel::ws::{TungsteniteConnector, WsConnection, WsConnector};
use crate::core::types::{ConnectionState, SubscriptionState};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, trace, warn};

/// Streaming connection settings supplied by each adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-subscription delivery queue bound (K).
    pub queue_capacity: usize,
    pub heartbeat_interval_ms: u64,
    /// Missing pong after this long forces the transport closed.
    pub pong_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Uniform random extra delay added to every reconnect.
    pub reconnect_jitter_ms: u64,
    /// How long a connection must stay up before the reconnect attempt counter resets.
    pub stable_after_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            heartbeat_interval_ms: 20_000,
            pong_timeout_ms: 10_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_jitter_ms: 250,
            stable_after_ms: 10_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl StreamConfig {
    /// `min(base * 2^attempt, max)`, before jitter.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Backoff for `attempt` plus `jitter_ms`, still capped at the max delay.
    pub fn jittered_delay(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let delay = self.reconnect_delay(attempt).as_millis() as u64;
        Duration::from_millis(
            delay
                .saturating_add(jitter_ms)
                .min(self.reconnect_max_delay_ms),
        )
    }
}

/// Connection-level counters, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_received: u64,
    pub decode_errors: u64,
    pub unroutable_frames: u64,
    pub dropped_events: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
    unroutable_frames: AtomicU64,
    dropped_events: AtomicU64,
    reconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamStats {
        StreamStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unroutable_frames: self.unroutable_frames.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Messages from handles and the manager to the owning task.
pub(crate) enum Command<M> {
    Subscribe {
        key: String,
        id: u64,
        queue: Arc<DeliveryQueue<M>>,
        reply: oneshot::Sender<Result<(), ClassifiedError>>,
    },
    Unsubscribe {
        key: String,
        id: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// One physical streaming connection multiplexing any number of subscriptions.
///
/// All session state lives in a single task spawned on first use; the
/// manager and every [`SubscriptionHandle`] talk to it over a channel.
/// The task connects, authenticates, replays every registered channel key,
/// keeps the heartbeat, routes frames by channel key, and reconnects with
/// exponential backoff until [`shutdown`](Self::shutdown) is called or the
/// manager and all handles are dropped.
pub struct StreamingConnectionManager<C: WsCodec> {
    venue: String,
    url: String,
    config: StreamConfig,
    codec: Arc<C>,
    connector: Arc<dyn WsConnector>,
    classifier: ErrorClassifier,
    commands: mpsc::UnboundedSender<Command<C::Message>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Command<C::Message>>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    counters: Arc<Counters>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl<C: WsCodec> StreamingConnectionManager<C> {
    pub fn new(venue: impl Into<String>, url: impl Into<String>, codec: C, config: StreamConfig) -> Self {
        let venue = venue.into();
        let (commands, inbox) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let connector = TungsteniteConnector::new(Duration::from_millis(config.connect_timeout_ms));
        Self {
            classifier: ErrorClassifier::default().for_venue(venue.clone()),
            venue,
            url: url.into(),
            config,
            codec: Arc::new(codec),
            connector: Arc::new(connector),
            commands,
            inbox: Mutex::new(Some(inbox)),
            state: Arc::new(state),
            counters: Arc::new(Counters::default()),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn WsConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Classifier for stream faults and venue error frames.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier.for_venue(self.venue.clone());
        self
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver observing every connection state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StreamStats {
        self.counters.snapshot()
    }

    /// Open the connection eagerly instead of on the first subscription.
    pub fn connect(&self) -> Result<(), ClassifiedError> {
        self.ensure_started()
    }

    /// Register `channel_key` and return its event handle.
    ///
    /// Returns immediately after registration; the subscribe message goes out
    /// on the current connection or, if none is up yet, right after the next
    /// one opens.
    #[instrument(skip(self, channel_key), fields(venue = %self.venue))]
    pub async fn subscribe(
        &self,
        channel_key: impl Into<String>,
    ) -> Result<SubscriptionHandle<C::Message>, ClassifiedError> {
        let key = channel_key.into();
        if key.is_empty() {
            return Err(ClassifiedError::validation("channel key must not be empty"));
        }
        self.ensure_started()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(DeliveryQueue::new(self.config.queue_capacity));
        let (reply, registered) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                key: key.clone(),
                id,
                queue: queue.clone(),
                reply,
            })
            .map_err(|_| self.stopped())?;
        registered.await.map_err(|_| self.stopped())??;

        debug!(channel = %key, "subscription registered");
        Ok(SubscriptionHandle::new(key, id, queue, self.commands.clone()))
    }

    /// Close the connection and end every subscription. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let never_started = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if never_started {
            return;
        }

        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        info!(venue = %self.venue, "streaming connection shut down");
    }

    fn stopped(&self) -> ClassifiedError {
        ClassifiedError::service_unavailable("streaming connection manager is shut down")
            .with_venue(self.venue.clone())
    }

    fn ensure_started(&self) -> Result<(), ClassifiedError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(self.stopped());
        }
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(inbox) = inbox {
            let session = Session {
                venue: self.venue.clone(),
                url: self.url.clone(),
                config: self.config.clone(),
                codec: self.codec.clone(),
                connector: self.connector.clone(),
                classifier: self.classifier.clone(),
                commands: inbox,
                state: self.state.clone(),
                counters: self.counters.clone(),
                subscriptions: BTreeMap::new(),
                attempt: 0,
                shutdown_replies: Vec::new(),
            };
            tokio::spawn(session.run());
        }
        Ok(())
    }
}

impl<C: WsCodec> std::fmt::Debug for StreamingConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingConnectionManager")
            .field("venue", &self.venue)
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Registration<M> {
    id: u64,
    queue: Arc<DeliveryQueue<M>>,
}

enum Opened {
    Connection(WsConnection),
    Failed(ExchangeError),
    Shutdown,
}

enum SessionEnd {
    Fault(ExchangeError),
    Shutdown,
}

/// The single task owning the transport and the subscription table.
struct Session<C: WsCodec> {
    venue: String,
    url: String,
    config: StreamConfig,
    codec: Arc<C>,
    connector: Arc<dyn WsConnector>,
    classifier: ErrorClassifier,
    commands: mpsc::UnboundedReceiver<Command<C::Message>>,
    state: Arc<watch::Sender<ConnectionState>>,
    counters: Arc<Counters>,
    subscriptions: BTreeMap<String, Registration<C::Message>>,
    /// Reconnect attempts since the last stable connection.
    attempt: u32,
    shutdown_replies: Vec<oneshot::Sender<()>>,
}

impl<C: WsCodec> Session<C> {
    #[instrument(name = "stream_session", skip(self), fields(venue = %self.venue))]
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            let connection = match self.open().await {
                Opened::Connection(connection) => connection,
                Opened::Shutdown => break,
                Opened::Failed(err) => {
                    warn!(error = %err, attempt = self.attempt, "streaming connect failed");
                    self.fail_all(err);
                    if !self.backoff().await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnectionState::Connected);
            match self.serve(connection).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Fault(err) => {
                    warn!(error = %err, "streaming connection lost");
                    Counters::bump(&self.counters.reconnects);
                    self.fail_all(err);
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }
        self.finish();
    }

    /// Open the transport while still serving commands.
    async fn open(&mut self) -> Opened {
        let connector = self.connector.clone();
        let url = self.url.clone();
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = tokio::time::timeout(limit, async move { connector.connect(&url).await });
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                opened = &mut connecting => {
                    return match opened {
                        Ok(Ok(connection)) => Opened::Connection(connection),
                        Ok(Err(err)) => Opened::Failed(err),
                        Err(_) => Opened::Failed(ExchangeError::Timeout(
                            "WebSocket connection timeout".to_string(),
                        )),
                    };
                }
                command = self.commands.recv() => {
                    if !self.handle_offline(command) {
                        return Opened::Shutdown;
                    }
                }
            }
        }
    }

    /// Wait out the reconnect delay while still serving commands.
    /// Returns `false` if the session should end instead.
    async fn backoff(&mut self) -> bool {
        self.set_state(ConnectionState::Reconnecting);
        let jitter = match self.config.reconnect_jitter_ms {
            0 => 0,
            max => rand::thread_rng().gen_range(0..=max),
        };
        let delay = self.config.jittered_delay(self.attempt, jitter);
        self.attempt = self.attempt.saturating_add(1);
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let wait = sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => return true,
                command = self.commands.recv() => {
                    if !self.handle_offline(command) {
                        return false;
                    }
                }
            }
        }
    }

    /// Command handling while no transport is up. Returns `false` on shutdown.
    fn handle_offline(&mut self, command: Option<Command<C::Message>>) -> bool {
        match command {
            None => false,
            Some(Command::Subscribe {
                key,
                id,
                queue,
                reply,
            }) => {
                let _ = reply.send(self.register(key, id, queue));
                true
            }
            Some(Command::Unsubscribe { key, id }) => {
                self.unregister(&key, id);
                true
            }
            Some(Command::Shutdown { reply }) => {
                self.shutdown_replies.push(reply);
                false
            }
        }
    }

    fn register(
        &mut self,
        key: String,
        id: u64,
        queue: Arc<DeliveryQueue<C::Message>>,
    ) -> Result<(), ClassifiedError> {
        if self.subscriptions.contains_key(&key) {
            return Err(ClassifiedError::validation(format!(
                "channel {} is already subscribed",
                key
            ))
            .with_venue(self.venue.clone()));
        }
        self.subscriptions.insert(key, Registration { id, queue });
        Ok(())
    }

    /// Remove `key` if it still belongs to handle `id`.
    fn unregister(&mut self, key: &str, id: u64) -> bool {
        match self.subscriptions.get(key) {
            Some(registration) if registration.id == id => {
                registration.queue.close();
                self.subscriptions.remove(key);
                debug!(channel = %key, "subscription released");
                true
            }
            _ => false,
        }
    }

    /// Drive one open transport until it faults or the session ends.
    async fn serve(&mut self, mut connection: WsConnection) -> SessionEnd {
        if let Err(err) = self.handshake(&mut connection).await {
            return SessionEnd::Fault(err);
        }

        let heartbeat_every = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let pong_timeout = Duration::from_millis(self.config.pong_timeout_ms);
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        let stable = sleep(Duration::from_millis(self.config.stable_after_ms));
        tokio::pin!(stable);
        let mut stable_reached = false;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let outcome = match command {
                        None => Err(None),
                        Some(command) => self.handle_online(command, &mut connection).await,
                    };
                    match outcome {
                        Ok(()) => {}
                        Err(Some(err)) => return SessionEnd::Fault(err),
                        Err(None) => {
                            connection.close().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                frame = connection.next() => {
                    let result = match frame {
                        None => Err(ExchangeError::ConnectionClosed("stream ended".to_string())),
                        Some(Err(err)) => Err(err),
                        Some(Ok(message)) => self.on_message(message, &mut connection, &mut pong_deadline).await,
                    };
                    if let Err(err) = result {
                        return SessionEnd::Fault(err);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = connection.send(self.codec.encode_ping()).await {
                        return SessionEnd::Fault(err);
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + pong_timeout);
                    }
                }
                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    warn!(timeout_ms = self.config.pong_timeout_ms, "heartbeat pong overdue, dropping transport");
                    return SessionEnd::Fault(ExchangeError::Timeout(format!(
                        "no pong within {}ms",
                        self.config.pong_timeout_ms
                    )));
                }
                _ = &mut stable, if !stable_reached => {
                    stable_reached = true;
                    if self.attempt > 0 {
                        debug!(attempts = self.attempt, "connection stable, reconnect backoff reset");
                    }
                    self.attempt = 0;
                }
            }
        }
    }

    /// Auth, then replay every registered channel key in one subscribe message.
    async fn handshake(&mut self, connection: &mut WsConnection) -> Result<(), ExchangeError> {
        if let Some(auth) = self.codec.encode_auth()? {
            connection.send(auth).await?;
            debug!("auth frame sent");
        }

        if self.subscriptions.is_empty() {
            return Ok(());
        }
        let keys: Vec<&str> = self.subscriptions.keys().map(String::as_str).collect();
        let message = self.codec.encode_subscription(keys.as_slice())?;
        connection.send(message).await?;
        for registration in self.subscriptions.values() {
            registration.queue.set_state(SubscriptionState::Active);
        }
        info!(channels = keys.len(), "subscriptions replayed");
        Ok(())
    }

    /// `Err(None)` ends the session, `Err(Some(_))` drops the transport.
    async fn handle_online(
        &mut self,
        command: Command<C::Message>,
        connection: &mut WsConnection,
    ) -> Result<(), Option<ExchangeError>> {
        match command {
            Command::Subscribe {
                key,
                id,
                queue,
                reply,
            } => {
                let registered = self.register(key.clone(), id, queue.clone());
                let accepted = registered.is_ok();
                let _ = reply.send(registered);
                if accepted {
                    let message = self.codec.encode_subscription(&[key.as_str()]).map_err(Some)?;
                    connection.send(message).await.map_err(Some)?;
                    queue.set_state(SubscriptionState::Active);
                }
                Ok(())
            }
            Command::Unsubscribe { key, id } => {
                if self.unregister(&key, id) {
                    let message = self.codec.encode_unsubscription(&[key.as_str()]).map_err(Some)?;
                    connection.send(message).await.map_err(Some)?;
                }
                Ok(())
            }
            Command::Shutdown { reply } => {
                self.shutdown_replies.push(reply);
                Err(None)
            }
        }
    }

    async fn on_message(
        &mut self,
        message: Message,
        connection: &mut WsConnection,
        pong_deadline: &mut Option<Instant>,
    ) -> Result<(), ExchangeError> {
        match message {
            Message::Ping(payload) => connection.send(Message::Pong(payload)).await,
            Message::Pong(_) => {
                *pong_deadline = None;
                Ok(())
            }
            Message::Close(frame) => Err(ExchangeError::ConnectionClosed(
                frame
                    .map(|f| f.reason.into_owned())
                    .unwrap_or_else(|| "closed by peer".to_string()),
            )),
            Message::Frame(_) => Ok(()),
            data => {
                Counters::bump(&self.counters.frames_received);
                match self.codec.decode_message(data) {
                    Ok(Some(frame)) => self.route(frame, pong_deadline),
                    Ok(None) => Ok(()),
                    Err(err) => {
                        Counters::bump(&self.counters.decode_errors);
                        warn!(error = %err, "undecodable frame skipped");
                        Ok(())
                    }
                }
            }
        }
    }

    fn route(
        &mut self,
        frame: WsFrame<C::Message>,
        pong_deadline: &mut Option<Instant>,
    ) -> Result<(), ExchangeError> {
        match frame {
            WsFrame::Data { channel, message } => {
                match self.subscriptions.get(&channel) {
                    Some(registration) => {
                        trace!(channel = %channel, "frame routed");
                        if registration.queue.push(message) {
                            Counters::bump(&self.counters.dropped_events);
                            trace!(channel = %channel, "queue full, oldest event dropped");
                        }
                    }
                    None => {
                        Counters::bump(&self.counters.unroutable_frames);
                        trace!(channel = %channel, "frame for unknown channel dropped");
                    }
                }
                Ok(())
            }
            WsFrame::Pong => {
                *pong_deadline = None;
                Ok(())
            }
            WsFrame::Error {
                channel,
                code,
                message,
            } => {
                let raw = match code {
                    Some(code) => ExchangeError::Venue {
                        code,
                        message,
                        status: None,
                    },
                    None => ExchangeError::Other(message),
                };
                let classified = self.classifier.classify(raw);
                warn!(kind = %classified.kind, error = %classified, "venue error frame");

                if let Some(registration) = channel.as_ref().and_then(|c| self.subscriptions.get(c)) {
                    registration.queue.fail(classified);
                    return Ok(());
                }
                if classified.retryable {
                    let cause = classified.message.clone();
                    return Err(ExchangeError::ConnectionClosed(format!(
                        "venue reported a session error: {}",
                        cause
                    )));
                }
                for registration in self.subscriptions.values() {
                    registration.queue.fail(classified.clone());
                }
                Ok(())
            }
        }
    }

    fn fail_all(&mut self, err: ExchangeError) {
        if self.subscriptions.is_empty() {
            return;
        }
        let classified = self.classifier.classify(err);
        for registration in self.subscriptions.values() {
            registration.queue.set_state(SubscriptionState::Pending);
            registration.queue.fail(classified.clone());
        }
    }

    fn finish(&mut self) {
        for (_, registration) in std::mem::take(&mut self.subscriptions) {
            registration.queue.close();
        }
        self.set_state(ConnectionState::Disconnected);
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_doubles_up_to_cap() {
        let config = StreamConfig {
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 1_000,
            ..StreamConfig::default()
        };
        let delays: Vec<u64> = (0..6)
            .map(|attempt| config.reconnect_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(config.reconnect_delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = StreamConfig {
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 1_000,
            reconnect_jitter_ms: 250,
            ..StreamConfig::default()
        };
        assert_eq!(config.jittered_delay(0, 250), Duration::from_millis(350));
        assert_eq!(config.jittered_delay(3, 250), Duration::from_millis(1_000));
        assert_eq!(config.jittered_delay(10, 250), Duration::from_millis(1_000));
        assert_eq!(config.jittered_delay(10, u64::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_stats_snapshot() {
        let counters = Counters::default();
        Counters::bump(&counters.frames_received);
        Counters::bump(&counters.frames_received);
        Counters::bump(&counters.dropped_events);

        let stats = counters.snapshot();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.dropped_events, 1);
        assert_eq!(stats.reconnects, 0);
    }
}
