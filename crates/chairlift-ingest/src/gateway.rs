//! Ingress gateway: publishes validated events to the queue.
//!
//! Each [`IngressGateway::accept`] borrows a channel from the pool, publishes
//! the event's JSON payload to the target queue, and returns the channel on
//! every exit path. A channel whose publish failed is invalidated rather than
//! returned. There is no retry here; callers decide how to surface a failure.

use std::sync::Arc;

use chairlift_core::Event;
use chairlift_core::metrics::increment;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pool::{ChannelPool, PoolError};
use crate::transport::TransportError;

/// Errors returned when publishing an event.
#[derive(Debug, Error)]
pub enum PublishError {
    /// No channel became available in time. Transient; the client may retry.
    #[error("no publish channel available: {0}")]
    PoolExhausted(PoolError),

    /// The channel pool has been shut down.
    #[error("channel pool closed")]
    PoolClosed,

    /// The broker rejected the publish or the channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The event could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[from] chairlift_core::Error),
}

impl PublishError {
    /// Whether the failure is transient resource exhaustion.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted(_))
    }
}

impl From<PoolError> for PublishError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } => Self::PoolExhausted(err),
            PoolError::Closed => Self::PoolClosed,
            PoolError::Transport(e) => Self::Transport(e),
        }
    }
}

/// Receipt for a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub queue: String,
    pub payload_bytes: usize,
}

/// Publishes events to one named queue through a shared channel pool.
pub struct IngressGateway {
    pool: Arc<ChannelPool>,
    queue: String,
}

impl IngressGateway {
    /// Create a gateway publishing to `queue`.
    pub fn new(pool: Arc<ChannelPool>, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    /// The target queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The pool this gateway borrows from.
    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// Declare the target queue. Called once at startup.
    pub fn declare_queue(&self) -> Result<(), PublishError> {
        let mut channel = self.pool.borrow()?;
        if let Err(e) = channel.queue_declare(&self.queue) {
            channel.invalidate();
            return Err(e.into());
        }
        debug!(queue = %self.queue, "declared queue");
        Ok(())
    }

    /// Serialize and publish one event.
    pub fn accept(&self, event: &Event) -> Result<Accepted, PublishError> {
        let payload = event.to_payload()?;
        let result = self.publish_payload(&payload);

        match &result {
            Ok(_) => increment("ingress_events_accepted_total", 1),
            Err(e) => {
                increment("ingress_publish_errors_total", 1);
                warn!(
                    skier_id = event.skier_id,
                    queue = %self.queue,
                    error = %e,
                    "failed to publish event"
                );
            }
        }
        result
    }

    /// Publish an already-encoded payload.
    pub fn publish_payload(&self, payload: &[u8]) -> Result<Accepted, PublishError> {
        let mut channel = self.pool.borrow()?;
        if let Err(e) = channel.basic_publish(&self.queue, payload) {
            channel.invalidate();
            return Err(e.into());
        }

        Ok(Accepted {
            queue: self.queue.clone(),
            payload_bytes: payload.len(),
        })
    }
}
