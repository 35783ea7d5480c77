//! Bounded in-process queue between consumers and flush workers.
//!
//! Consumers `put` (blocking while full, which is the backpressure that stops
//! them pulling more from the broker) and flush workers `drain_up_to` without
//! ever blocking.

use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError};

use super::QueuedMessage;

/// Default capacity of the batch queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// FIFO of [`QueuedMessage`]s with a fixed capacity.
///
/// The queue owns both ends of its channel, so it never disconnects while
/// alive.
pub struct EventQueue {
    sender: Sender<QueuedMessage>,
    receiver: Receiver<QueuedMessage>,
    capacity: usize,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` messages (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Insert a message, blocking while the queue is full.
    pub fn put(&self, message: QueuedMessage) {
        // Both ends live in `self`, so send can't observe a disconnect.
        let _ = self.sender.send(message);
    }

    /// Insert a message, waiting at most `timeout` for space.
    ///
    /// Hands the message back if the queue stayed full.
    pub fn put_timeout(&self, message: QueuedMessage, timeout: Duration) -> Result<(), QueuedMessage> {
        match self.sender.send_timeout(message, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(m) | SendTimeoutError::Disconnected(m)) => Err(m),
        }
    }

    /// Remove up to `max` messages in FIFO order without blocking.
    pub fn drain_up_to(&self, max: usize) -> Vec<QueuedMessage> {
        let mut batch = Vec::with_capacity(max.min(self.receiver.len()));
        while batch.len() < max {
            match self.receiver.try_recv() {
                Ok(message) => batch.push(message),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
