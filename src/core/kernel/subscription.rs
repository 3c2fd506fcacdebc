use crate::core::errors::ClassifiedError;
use crate::core::kernel::stream::Command;
use crate::core::types::SubscriptionState;
use futures_util::Stream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};

struct QueueInner<M> {
    events: VecDeque<M>,
    /// Pending stream fault, handed out ahead of queued events.
    fault: Option<ClassifiedError>,
    state: SubscriptionState,
}

/// Bounded FIFO between the receive loop and one consumer.
///
/// Pushing never waits: at capacity the oldest event is evicted and counted.
pub(crate) struct DeliveryQueue<M> {
    inner: Mutex<QueueInner<M>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<M> DeliveryQueue<M> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::with_capacity(capacity.min(1024)),
                fault: None,
                state: SubscriptionState::Pending,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `event`; returns `true` when an older event was evicted to make room.
    pub(crate) fn push(&self, event: M) -> bool {
        let evicted = {
            let mut inner = self.lock();
            if inner.state == SubscriptionState::Closed {
                return false;
            }
            let evicted = if inner.events.len() >= self.capacity {
                inner.events.pop_front();
                true
            } else {
                false
            };
            inner.events.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Surface `error` on the next pull. A newer fault replaces an unread one.
    pub(crate) fn fail(&self, error: ClassifiedError) {
        {
            let mut inner = self.lock();
            if inner.state == SubscriptionState::Closed {
                return;
            }
            inner.fault = Some(error);
        }
        self.notify.notify_one();
    }

    pub(crate) fn set_state(&self, state: SubscriptionState) {
        let mut inner = self.lock();
        if inner.state != SubscriptionState::Closed {
            inner.state = state;
        }
    }

    /// Terminal: drops whatever is queued and wakes the consumer.
    pub(crate) fn close(&self) {
        {
            let mut inner = self.lock();
            inner.state = SubscriptionState::Closed;
            inner.events.clear();
            inner.fault = None;
        }
        self.notify.notify_one();
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.lock().state
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) async fn pop(&self) -> Option<Result<M, ClassifiedError>> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(fault) = inner.fault.take() {
                    return Some(Err(fault));
                }
                if let Some(event) = inner.events.pop_front() {
                    return Some(Ok(event));
                }
                if inner.state == SubscriptionState::Closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a push between the check and here is not lost
            self.notify.notified().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<M>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consumer side of one logical subscription.
///
/// Yields decoded events in venue-send order until cancelled or the manager
/// shuts down. A stream fault arrives as one `Err` item; the subscription
/// itself survives it and resumes after the manager reconnects. Dropping the
/// handle cancels it.
pub struct SubscriptionHandle<M> {
    key: String,
    id: u64,
    queue: Arc<DeliveryQueue<M>>,
    commands: mpsc::UnboundedSender<Command<M>>,
    cancelled: bool,
}

impl<M: Send + 'static> SubscriptionHandle<M> {
    pub(crate) fn new(
        key: String,
        id: u64,
        queue: Arc<DeliveryQueue<M>>,
        commands: mpsc::UnboundedSender<Command<M>>,
    ) -> Self {
        Self {
            key,
            id,
            queue,
            commands,
            cancelled: false,
        }
    }

    pub fn channel_key(&self) -> &str {
        &self.key
    }

    /// Next event, a stream fault, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Result<M, ClassifiedError>> {
        self.queue.pop().await
    }

    /// Unsubscribe and release the queue. Idempotent and non-blocking.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.queue.close();
        // The manager may already be gone; nothing left to unsubscribe then
        let _ = self.commands.send(Command::Unsubscribe {
            key: self.key.clone(),
            id: self.id,
        });
    }

    pub fn state(&self) -> SubscriptionState {
        self.queue.state()
    }

    /// Events evicted from this subscription's queue under backpressure.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Events currently buffered.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Adapt into a `futures::Stream`. Dropping the stream cancels the subscription.
    pub fn into_stream(self) -> impl Stream<Item = Result<M, ClassifiedError>> + Send {
        futures_util::stream::unfold(self, |mut handle| async move {
            let item = handle.next().await?;
            Some((item, handle))
        })
    }
}

impl<M> Drop for SubscriptionHandle<M> {
    fn drop(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.queue.close();
            let _ = self.commands.send(Command::Unsubscribe {
                key: std::mem::take(&mut self.key),
                id: self.id,
            });
        }
    }
}

impl<M> std::fmt::Debug for SubscriptionHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorKind;
    use futures_util::StreamExt;

    fn handle(capacity: usize) -> (SubscriptionHandle<u32>, mpsc::UnboundedReceiver<Command<u32>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(DeliveryQueue::new(capacity));
        (SubscriptionHandle::new("trades:BTC".to_string(), 7, queue, tx), rx)
    }

    #[tokio::test]
    async fn test_drop_oldest_at_capacity() {
        let (mut handle, _rx) = handle(3);
        for i in 0..10 {
            handle.queue.push(i);
        }

        assert_eq!(handle.buffered(), 3);
        assert_eq!(handle.dropped(), 7);
        assert_eq!(handle.next().await.unwrap().unwrap(), 7);
        assert_eq!(handle.next().await.unwrap().unwrap(), 8);
        assert_eq!(handle.next().await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_fault_is_delivered_before_events() {
        let (mut handle, _rx) = handle(8);
        handle.queue.push(1);
        handle.queue.fail(ClassifiedError::transient("connection reset"));

        let fault = handle.next().await.unwrap().unwrap_err();
        assert_eq!(fault.kind, ErrorKind::TransientError);
        assert_eq!(handle.next().await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiting_consumer_is_woken() {
        let (mut handle, _rx) = handle(8);
        let queue = handle.queue.clone();

        let producer = tokio::spawn(async move {
            tokio::task::yield_now().await;
            queue.push(42);
        });

        assert_eq!(handle.next().await.unwrap().unwrap(), 42);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_sends_unsubscribe_once() {
        let (mut handle, mut rx) = handle(8);
        handle.queue.push(1);

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.state(), SubscriptionState::Closed);
        assert!(handle.next().await.is_none());

        match rx.recv().await {
            Some(Command::Unsubscribe { key, id }) => {
                assert_eq!(key, "trades:BTC");
                assert_eq!(id, 7);
            }
            _ => panic!("expected unsubscribe"),
        }
        drop(handle);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let (handle, mut rx) = handle(8);
        drop(handle);
        assert!(matches!(rx.recv().await, Some(Command::Unsubscribe { id: 7, .. })));
    }

    #[tokio::test]
    async fn test_into_stream_ends_on_close() {
        let (handle, _rx) = handle(8);
        let queue = handle.queue.clone();
        queue.push(1);
        queue.push(2);
        queue.set_state(SubscriptionState::Active);

        let mut stream = Box::pin(handle.into_stream());
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);

        queue.close();
        assert!(stream.next().await.is_none());
    }
}
