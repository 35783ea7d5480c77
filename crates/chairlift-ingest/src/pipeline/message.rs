//! A decoded event paired with the capability to acknowledge it.

use chairlift_core::{Event, RideRecord};

use crate::transport::{AckHandle, TransportError};

/// An event removed from the external queue and not yet settled.
///
/// Owned by the pipeline until the batch containing it is durably written.
/// Settling consumes the message, so each one is acknowledged at most once.
#[derive(Debug)]
pub struct QueuedMessage {
    pub event: Event,
    delivery_count: u32,
    ack: AckHandle,
}

impl QueuedMessage {
    pub fn new(event: Event, delivery_count: u32, ack: AckHandle) -> Self {
        Self {
            event,
            delivery_count,
            ack,
        }
    }

    /// How many times the broker has delivered this message.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn delivery_tag(&self) -> u64 {
        self.ack.delivery_tag()
    }

    /// The storage record for this message's event.
    pub fn record(&self) -> RideRecord {
        self.event.to_record()
    }

    /// Acknowledge the message. Only call after its event is durable.
    pub fn ack(self) -> Result<(), TransportError> {
        self.ack.ack()
    }

    /// Negatively acknowledge the message.
    pub fn nack(self, requeue: bool) -> Result<(), TransportError> {
        self.ack.nack(requeue)
    }
}
