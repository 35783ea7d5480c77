//! In-process message broker.
//!
//! [`MemoryBroker`] implements [`Connection`] with the delivery semantics the
//! pipeline relies on from an AMQP broker:
//!
//! - named queues, declared explicitly or implicitly on publish
//! - push-style consumption with manual acknowledgment
//! - per-channel prefetch limiting unacknowledged deliveries
//! - redelivery of unacknowledged messages when their channel closes,
//!   with a per-message delivery counter
//!
//! All state lives behind one mutex; a condition variable wakes consumers
//! when messages arrive or prefetch slots free up.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{AckHandle, Acknowledger, Channel, Connection, Delivery, TransportError};

/// In-process broker shared by publishers and consumers.
///
/// Cloning is cheap; clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    changed: Condvar,
}

struct BrokerState {
    open: bool,
    next_channel_id: u64,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    channels: HashMap<u64, ChannelState>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            open: true,
            next_channel_id: 1,
            queues: HashMap::new(),
            channels: HashMap::new(),
        }
    }
}

struct StoredMessage {
    payload: Vec<u8>,
    delivery_count: u32,
}

struct ChannelState {
    prefetch: u16,
    consuming: Option<String>,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

impl BrokerState {
    fn channel_mut(&mut self, id: u64) -> Result<&mut ChannelState, TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }
        self.channels
            .get_mut(&id)
            .ok_or(TransportError::ChannelClosed(id))
    }

    /// Put a closed channel's unacknowledged messages back at the head of
    /// their queues, oldest first.
    fn requeue_unacked(&mut self, channel: ChannelState) {
        let mut pending: Vec<_> = channel.unacked.into_iter().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        for (_, unacked) in pending.into_iter().rev() {
            self.queues
                .entry(unacked.queue)
                .or_default()
                .push_front(unacked.message);
        }
    }
}

impl MemoryBroker {
    /// Create an empty, open broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting for delivery on `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Number of delivered but unsettled messages across all channels.
    pub fn unacked_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }
}

impl Connection for MemoryBroker {
    fn create_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        let mut state = self.inner.state.lock();
        if !state.open {
            return Err(TransportError::ConnectionClosed);
        }
        let id = state.next_channel_id;
        state.next_channel_id += 1;
        state.channels.insert(
            id,
            ChannelState {
                prefetch: 0,
                consuming: None,
                next_tag: 1,
                unacked: HashMap::new(),
            },
        );
        debug!(channel = id, "memory broker channel opened");

        Ok(Box::new(MemoryChannel {
            id,
            inner: Arc::clone(&self.inner),
            acker: Arc::new(ChannelAcker {
                channel_id: id,
                inner: Arc::clone(&self.inner),
            }),
        }))
    }

    fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    fn close(&self) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        if !state.open {
            return Ok(());
        }
        state.open = false;
        let channels: Vec<ChannelState> = state.channels.drain().map(|(_, c)| c).collect();
        let count = channels.len();
        for channel in channels {
            state.requeue_unacked(channel);
        }
        drop(state);
        self.inner.changed.notify_all();

        debug!(channels = count, "memory broker closed");
        Ok(())
    }
}

/// A channel on a [`MemoryBroker`]. Closed on drop.
struct MemoryChannel {
    id: u64,
    inner: Arc<BrokerInner>,
    acker: Arc<ChannelAcker>,
}

impl Channel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        let state = self.inner.state.lock();
        state.open && state.channels.contains_key(&self.id)
    }

    fn queue_declare(&mut self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state.channel_mut(self.id)?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    fn basic_publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state.channel_mut(self.id)?;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                payload: payload.to_vec(),
                delivery_count: 0,
            });
        drop(state);
        self.inner.changed.notify_all();
        Ok(())
    }

    fn basic_qos(&mut self, prefetch: u16) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state.channel_mut(self.id)?.prefetch = prefetch;
        drop(state);
        self.inner.changed.notify_all();
        Ok(())
    }

    fn basic_consume(&mut self, queue: &str) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state.channel_mut(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }
        state.channel_mut(self.id)?.consuming = Some(queue.to_string());
        Ok(())
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.state.lock();

        loop {
            let state = &mut *guard;
            if !state.open {
                return Err(TransportError::ConnectionClosed);
            }
            let Some(channel) = state.channels.get_mut(&self.id) else {
                return Err(TransportError::ChannelClosed(self.id));
            };
            let Some(queue) = channel.consuming.clone() else {
                return Err(TransportError::NotConsuming);
            };

            let has_capacity =
                channel.prefetch == 0 || channel.unacked.len() < usize::from(channel.prefetch);
            if has_capacity
                && let Some(mut message) = state.queues.get_mut(&queue).and_then(VecDeque::pop_front)
            {
                message.delivery_count += 1;
                let tag = channel.next_tag;
                channel.next_tag += 1;

                let delivery = Delivery {
                    payload: message.payload.clone(),
                    redelivered: message.delivery_count > 1,
                    delivery_count: message.delivery_count,
                    ack: AckHandle::new(tag, self.acker.clone()),
                };
                channel.unacked.insert(tag, Unacked { queue, message });
                return Ok(Some(delivery));
            }

            if self
                .inner
                .changed
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        if let Some(channel) = state.channels.remove(&self.id) {
            let requeued = channel.unacked.len();
            state.requeue_unacked(channel);
            drop(state);
            self.inner.changed.notify_all();
            debug!(channel = self.id, requeued, "memory broker channel closed");
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let _ = Channel::close(self);
    }
}

/// Settles deliveries made on one channel.
struct ChannelAcker {
    channel_id: u64,
    inner: Arc<BrokerInner>,
}

impl Acknowledger for ChannelAcker {
    fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        state
            .channel_mut(self.channel_id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(TransportError::UnknownDeliveryTag(delivery_tag))?;
        drop(state);
        self.inner.changed.notify_all();
        Ok(())
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        let unacked = state
            .channel_mut(self.channel_id)?
            .unacked
            .remove(&delivery_tag)
            .ok_or(TransportError::UnknownDeliveryTag(delivery_tag))?;
        if requeue {
            state
                .queues
                .entry(unacked.queue)
                .or_default()
                .push_back(unacked.message);
        }
        drop(state);
        self.inner.changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "lift_rides";
    const WAIT: Duration = Duration::from_millis(20);

    fn consumer(broker: &MemoryBroker, prefetch: u16) -> Box<dyn Channel> {
        let mut channel = broker.create_channel().unwrap();
        channel.queue_declare(QUEUE).unwrap();
        channel.basic_qos(prefetch).unwrap();
        channel.basic_consume(QUEUE).unwrap();
        channel
    }

    fn publish(broker: &MemoryBroker, payloads: &[&[u8]]) {
        let mut channel = broker.create_channel().unwrap();
        for payload in payloads {
            channel.basic_publish(QUEUE, payload).unwrap();
        }
    }

    // =========================================================================
    // Publish / consume / ack
    // =========================================================================

    #[test]
    fn test_publish_and_consume_in_order() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker, 0);
        publish(&broker, &[b"one", b"two"]);

        let first = channel.next_delivery(WAIT).unwrap().unwrap();
        let second = channel.next_delivery(WAIT).unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert!(!first.redelivered);
        assert_eq!(first.delivery_count, 1);
        assert_eq!(broker.unacked_count(), 2);

        first.ack.ack().unwrap();
        second.ack.ack().unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.ready_count(QUEUE), 0);
    }

    #[test]
    fn test_next_delivery_times_out_when_empty() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker, 0);
        assert!(channel.next_delivery(WAIT).unwrap().is_none());
    }

    #[test]
    fn test_double_ack_is_rejected() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker, 0);
        publish(&broker, &[b"one"]);

        let delivery = channel.next_delivery(WAIT).unwrap().unwrap();
        let tag = delivery.ack.delivery_tag();
        delivery.ack.ack().unwrap();

        // A forged second handle for the same tag must fail
        let acker = Arc::new(ChannelAcker {
            channel_id: channel.id(),
            inner: Arc::clone(&broker.inner),
        });
        assert_eq!(
            AckHandle::new(tag, acker).ack(),
            Err(TransportError::UnknownDeliveryTag(tag))
        );
    }

    // =========================================================================
    // Prefetch
    // =========================================================================

    #[test]
    fn test_prefetch_limits_outstanding_deliveries() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker, 2);
        publish(&broker, &[b"a", b"b", b"c"]);

        let a = channel.next_delivery(WAIT).unwrap().unwrap();
        let _b = channel.next_delivery(WAIT).unwrap().unwrap();
        assert!(channel.next_delivery(WAIT).unwrap().is_none());
        assert_eq!(broker.ready_count(QUEUE), 1);

        a.ack.ack().unwrap();
        let c = channel.next_delivery(WAIT).unwrap().unwrap();
        assert_eq!(c.payload, b"c");
    }

    // =========================================================================
    // Redelivery
    // =========================================================================

    #[test]
    fn test_closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker, 0);
        publish(&broker, &[b"a", b"b"]);

        let a = channel.next_delivery(WAIT).unwrap().unwrap();
        let _b = channel.next_delivery(WAIT).unwrap().unwrap();
        channel.close().unwrap();

        assert_eq!(broker.ready_count(QUEUE), 2);
        assert_eq!(a.ack.ack(), Err(TransportError::ChannelClosed(channel.id())));

        let mut other = consumer(&broker, 0);
        let again = other.next_delivery(WAIT).unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert!(again.redelivered);
        assert_eq!(again.delivery_count, 2);
    }

    #[test]
    fn test_nack_requeue_and_reject() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker, 0);
        publish(&broker, &[b"a", b"b"]);

        let a = channel.next_delivery(WAIT).unwrap().unwrap();
        let b = channel.next_delivery(WAIT).unwrap().unwrap();
        a.ack.nack(true).unwrap();
        b.ack.reject().unwrap();

        assert_eq!(broker.ready_count(QUEUE), 1);
        let again = channel.next_delivery(WAIT).unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert_eq!(again.delivery_count, 2);
    }

    #[test]
    fn test_dropping_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        {
            let mut channel = consumer(&broker, 0);
            publish(&broker, &[b"a"]);
            let _a = channel.next_delivery(WAIT).unwrap().unwrap();
        }
        assert_eq!(broker.ready_count(QUEUE), 1);
        assert_eq!(broker.unacked_count(), 0);
    }

    // =========================================================================
    // Errors and shutdown
    // =========================================================================

    #[test]
    fn test_consume_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        let mut channel = broker.create_channel().unwrap();
        assert_eq!(
            channel.basic_consume("missing"),
            Err(TransportError::QueueNotFound("missing".into()))
        );
        assert_eq!(
            channel.next_delivery(WAIT).unwrap_err(),
            TransportError::NotConsuming
        );
    }

    #[test]
    fn test_broker_close_fails_everything() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker, 0);
        broker.close().unwrap();

        assert!(!broker.is_open());
        assert!(!channel.is_open());
        assert_eq!(
            channel.basic_publish(QUEUE, b"x"),
            Err(TransportError::ConnectionClosed)
        );
        assert!(matches!(
            broker.create_channel(),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_blocked_consumer_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut channel = consumer(&broker, 0);

        let publisher = broker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publish(&publisher, &[b"late"]);
        });

        let delivery = channel.next_delivery(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(delivery.unwrap().payload, b"late");
    }
}
