//! Transport abstraction over the external message queue.
//!
//! The pipeline talks to its queue through two object-safe traits:
//!
//! - [`Connection`] - one long-lived connection that hands out channels
//! - [`Channel`] - a logical publish/consume path with manual acknowledgment
//!
//! Consumers receive [`Delivery`] values carrying an [`AckHandle`], an opaque
//! acknowledgment capability. Downstream components (the batch writer in
//! particular) settle messages through the handle without knowing which
//! transport produced them.
//!
//! [`AmqpConnection`] talks to an external AMQP 0-9-1 broker such as
//! RabbitMQ. [`MemoryBroker`] is a complete in-process implementation with
//! named queues, per-channel prefetch, and redelivery of unacknowledged
//! messages; its contents don't outlive the process.

mod amqp;
mod memory;

pub use amqp::{AmqpConfig, AmqpConnection};
pub use memory::MemoryBroker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The underlying connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel has been closed.
    #[error("channel {0} closed")]
    ChannelClosed(u64),

    /// The delivery tag is unknown to the channel (already settled or never issued).
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// `next_delivery` called before `basic_consume`.
    #[error("channel is not consuming")]
    NotConsuming,

    /// Consuming from a queue that hasn't been declared.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Error reported by an external broker or its client library.
    #[error("broker error: {0}")]
    Broker(String),
}

/// A long-lived connection to the message queue.
///
/// Implementations must be safe to share across threads; channels are the
/// unit of single-threaded use.
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection.
    fn create_channel(&self) -> Result<Box<dyn Channel>, TransportError>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Close the connection and every channel opened on it.
    fn close(&self) -> Result<(), TransportError>;
}

/// A single logical path to the queue, used by one caller at a time.
pub trait Channel: Send {
    /// Channel identifier, unique within its connection.
    fn id(&self) -> u64;

    /// Whether the channel (and its connection) is still open.
    fn is_open(&self) -> bool;

    /// Declare a queue, creating it if it doesn't exist.
    fn queue_declare(&mut self, queue: &str) -> Result<(), TransportError>;

    /// Publish a payload to a queue via the default exchange.
    fn basic_publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Limit the number of unacknowledged deliveries outstanding on this
    /// channel. Zero means unlimited.
    fn basic_qos(&mut self, prefetch: u16) -> Result<(), TransportError>;

    /// Start consuming from a queue with manual acknowledgment.
    fn basic_consume(&mut self, queue: &str) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next delivery.
    ///
    /// Returns `Ok(None)` on timeout.
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Close the channel. Unacknowledged deliveries are returned to their queue.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Settles deliveries on behalf of an [`AckHandle`].
pub trait Acknowledger: Send + Sync {
    /// Acknowledge a delivery; the broker forgets the message.
    fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Negatively acknowledge a delivery, optionally returning it to the queue.
    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}

/// Capability to settle exactly one delivery.
///
/// Every settling method consumes the handle, so a delivery can be settled at
/// most once. Dropping the handle without settling leaves the message
/// unacknowledged; the broker redelivers it once the channel closes.
pub struct AckHandle {
    delivery_tag: u64,
    acknowledger: Arc<dyn Acknowledger>,
}

impl AckHandle {
    /// Create a handle for `delivery_tag`, settled through `acknowledger`.
    pub fn new(delivery_tag: u64, acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            acknowledger,
        }
    }

    /// The delivery tag this handle settles.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Acknowledge the delivery.
    pub fn ack(self) -> Result<(), TransportError> {
        self.acknowledger.ack(self.delivery_tag)
    }

    /// Negatively acknowledge the delivery.
    pub fn nack(self, requeue: bool) -> Result<(), TransportError> {
        self.acknowledger.nack(self.delivery_tag, requeue)
    }

    /// Discard the delivery without requeueing it.
    pub fn reject(self) -> Result<(), TransportError> {
        self.nack(false)
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}

/// A message handed to a consumer.
#[derive(Debug)]
pub struct Delivery {
    /// Raw message body.
    pub payload: Vec<u8>,

    /// Whether this message was delivered before.
    pub redelivered: bool,

    /// How many times this message has been delivered, including this one.
    pub delivery_count: u32,

    /// Handle used to settle this delivery.
    pub ack: AckHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingAcker {
        settled: Mutex<Vec<(u64, &'static str)>>,
    }

    impl Acknowledger for RecordingAcker {
        fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
            self.settled.lock().push((delivery_tag, "ack"));
            Ok(())
        }

        fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
            let kind = if requeue { "requeue" } else { "reject" };
            self.settled.lock().push((delivery_tag, kind));
            Ok(())
        }
    }

    #[test]
    fn test_ack_handle_routes_to_acknowledger() {
        let acker = Arc::new(RecordingAcker::default());
        AckHandle::new(1, acker.clone()).ack().unwrap();
        AckHandle::new(2, acker.clone()).nack(true).unwrap();
        AckHandle::new(3, acker.clone()).reject().unwrap();

        assert_eq!(
            *acker.settled.lock(),
            vec![(1, "ack"), (2, "requeue"), (3, "reject")]
        );
    }

    #[test]
    fn test_ack_handle_debug_hides_acknowledger() {
        let handle = AckHandle::new(7, Arc::new(RecordingAcker::default()));
        let debug = format!("{:?}", handle);
        assert!(debug.contains("delivery_tag: 7"));
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::ChannelClosed(4).to_string(), "channel 4 closed");
        assert!(
            TransportError::QueueNotFound("rides".into())
                .to_string()
                .contains("rides")
        );
    }
}
