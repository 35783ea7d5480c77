//! Dead-letter publishing for messages the pipeline gives up on.
//!
//! Two paths end here: payloads that never decode into an [`Event`] after
//! `max_deliveries` attempts, and events still unprocessed when a bounded
//! retry budget runs out. Either way the original message is acknowledged
//! only after the dead-letter publish succeeds.
//!
//! [`Event`]: chairlift_core::Event

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gateway::{IngressGateway, PublishError};

/// Envelope published to the dead-letter queue.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    /// Why the message was dead-lettered.
    pub reason: String,
    /// Original payload, lossily decoded as UTF-8.
    pub payload: String,
    pub delivery_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(reason: impl Into<String>, payload: &[u8], delivery_count: u32) -> Self {
        Self {
            reason: reason.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            delivery_count,
            failed_at: Utc::now(),
        }
    }
}

/// Destination for dead-lettered messages.
pub trait DeadLetterSink: Send + Sync {
    fn send(&self, record: &DeadLetterRecord) -> Result<(), PublishError>;
}

/// Publishes dead-letter records through a gateway bound to the DLQ.
pub struct DeadLetterPublisher {
    gateway: IngressGateway,
}

impl DeadLetterPublisher {
    pub fn new(gateway: IngressGateway) -> Self {
        Self { gateway }
    }

    pub fn queue(&self) -> &str {
        self.gateway.queue()
    }
}

impl DeadLetterSink for DeadLetterPublisher {
    fn send(&self, record: &DeadLetterRecord) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(record).map_err(chairlift_core::Error::from)?;
        self.gateway.publish_payload(&payload)?;
        tracing::warn!(
            queue = %self.gateway.queue(),
            reason = %record.reason,
            delivery_count = record.delivery_count,
            "message dead-lettered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ChannelPool, PoolConfig};
    use crate::transport::{Channel, Connection, MemoryBroker};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_publisher_writes_json_envelope_to_dlq() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(ChannelPool::new(
            Arc::new(broker.clone()),
            PoolConfig::default(),
        ));
        let publisher = DeadLetterPublisher::new(IngressGateway::new(pool, "lift_rides.dlq"));

        let record = DeadLetterRecord::new("undecodable payload", b"\xffoops", 3);
        publisher.send(&record).unwrap();

        let mut channel = broker.create_channel().unwrap();
        channel.basic_consume("lift_rides.dlq").unwrap();
        let delivery = channel
            .next_delivery(Duration::from_millis(50))
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();

        assert_eq!(json["reason"], "undecodable payload");
        assert_eq!(json["delivery_count"], 3);
        assert!(json["payload"].as_str().unwrap().ends_with("oops"));
        assert!(json["failed_at"].is_string());
    }
}
