//! Chairlift ingestion pipeline components.
//!
//! This crate moves validated lift rides from the ingress edge to durable
//! storage with at-least-once delivery.
//!
//! # Modules
//!
//! - [`transport`] - Connection/channel abstraction, AMQP and in-process brokers
//! - [`pool`] - Bounded pool of publish channels
//! - [`gateway`] - Publishes events through the pool
//! - [`pipeline`] - Consumer pool, bounded queue, batch writer, dead letters
//! - [`storage`] - Storage engines (in-memory, ClickHouse)
//! - [`service`] - Wires everything into one running service
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ IngressGateway  │  borrows a channel from ChannelPool, publishes JSON
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Message queue  │  (AMQP broker, or MemoryBroker in-process)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  ConsumerPool   │  one channel per worker, manual acks, prefetch
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   EventQueue    │  bounded; blocks consumers when full
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   BatchWriter   │  ≤25 per bulk write, retries unprocessed items,
//! └────────┬────────┘  acks only after the write is durable
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  StorageEngine  │  idempotent by ride key
//! └─────────────────┘
//! ```

pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod pool;
pub mod service;
pub mod storage;
pub mod transport;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use gateway::{Accepted, IngressGateway, PublishError};
pub use pool::{ChannelPool, PoolConfig, PoolError, PoolStats, PooledChannel};
pub use service::{IngestConfig, IngestMode, IngestService, ServiceStats};
pub use transport::{
    AckHandle, AmqpConfig, AmqpConnection, Channel, Connection, Delivery, MemoryBroker,
    TransportError,
};

// Re-export pipeline components for convenience
pub use pipeline::{
    BatchWriter, BatchWriterConfig, BatchWriterStats, ConsumerConfig, ConsumerPool, ConsumerStats,
    DeadLetterPublisher, DeadLetterRecord, DeadLetterSink, DirectWriter, EventQueue,
    MAX_BATCH_SIZE, MessageHandler, QueuedMessage, RetryPolicy,
};

// Re-export storage engines
pub use storage::{
    ClickHouseConfig, ClickHouseStore, MemoryStore, StorageEngine, StorageError, WriteRequest,
};

#[cfg(test)]
pub(crate) mod test_support {
    //! Fakes shared by the unit tests.

    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use chairlift_core::{Event, RideKey, RideRecord};
    use parking_lot::Mutex;

    use crate::pipeline::QueuedMessage;
    use crate::storage::{
        MemoryStore, StorageEngine, StorageError, WriteRequest, check_batch_size,
    };
    use crate::transport::{AckHandle, Acknowledger, TransportError};

    /// A valid event for `skier_id` at minute `time`.
    pub fn sample_event(skier_id: i32, time: i32) -> Event {
        Event {
            skier_id,
            resort_id: 1,
            season_id: "2025".to_string(),
            day_id: "1".to_string(),
            lift_id: 5,
            time,
        }
    }

    /// Poll `condition` until it holds or `timeout` passes.
    pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    pub struct NoopAcker;

    impl Acknowledger for NoopAcker {
        fn ack(&self, _delivery_tag: u64) -> Result<(), TransportError> {
            Ok(())
        }

        fn nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Something that happened to storage or to a message.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Entry {
        Write(Vec<RideKey>),
        Ack(u64),
        Nack { tag: u64, requeue: bool },
    }

    /// Ordered log shared by [`ScriptedStore`] and [`JournalAcker`], so tests
    /// can check that acks only follow writes.
    #[derive(Clone, Default)]
    pub struct Journal(Arc<Mutex<Vec<Entry>>>);

    impl Journal {
        fn push(&self, entry: Entry) {
            self.0.lock().push(entry);
        }

        pub fn entries(&self) -> Vec<Entry> {
            self.0.lock().clone()
        }

        pub fn writes(&self) -> Vec<Vec<RideKey>> {
            self.entries()
                .into_iter()
                .filter_map(|e| match e {
                    Entry::Write(keys) => Some(keys),
                    _ => None,
                })
                .collect()
        }

        pub fn acks(&self) -> Vec<u64> {
            self.entries()
                .into_iter()
                .filter_map(|e| match e {
                    Entry::Ack(tag) => Some(tag),
                    _ => None,
                })
                .collect()
        }

        pub fn nacks(&self) -> Vec<(u64, bool)> {
            self.entries()
                .into_iter()
                .filter_map(|e| match e {
                    Entry::Nack { tag, requeue } => Some((tag, requeue)),
                    _ => None,
                })
                .collect()
        }
    }

    pub struct JournalAcker {
        journal: Journal,
    }

    impl Acknowledger for JournalAcker {
        fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
            self.journal.push(Entry::Ack(delivery_tag));
            Ok(())
        }

        fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
            self.journal.push(Entry::Nack {
                tag: delivery_tag,
                requeue,
            });
            Ok(())
        }
    }

    /// A message for `sample_event(skier_id, time)` settled into `journal`.
    pub fn journal_message(journal: &Journal, tag: u64, skier_id: i32, time: i32) -> QueuedMessage {
        let acker = Arc::new(JournalAcker {
            journal: journal.clone(),
        });
        QueuedMessage::new(sample_event(skier_id, time), 1, AckHandle::new(tag, acker))
    }

    /// What a [`ScriptedStore`] does with one call.
    #[derive(Debug, Clone, Copy)]
    pub enum Step {
        Persist,
        /// Leave the first `n` requests unprocessed, persist the rest.
        Unprocessed(usize),
        /// Fail the whole call.
        Fail,
        /// Panic inside the call.
        Panic,
    }

    /// Storage engine following a script of per-call outcomes.
    pub struct ScriptedStore {
        journal: Journal,
        script: Mutex<VecDeque<Step>>,
        fallback: Step,
        inner: MemoryStore,
    }

    impl ScriptedStore {
        pub fn new(journal: &Journal, script: Vec<Step>) -> Self {
            Self {
                journal: journal.clone(),
                script: Mutex::new(script.into()),
                fallback: Step::Persist,
                inner: MemoryStore::new(),
            }
        }

        /// Step used once the script runs out.
        pub fn fallback(mut self, step: Step) -> Self {
            self.fallback = step;
            self
        }

        pub fn stored(&self) -> Vec<RideRecord> {
            self.inner.records()
        }
    }

    impl StorageEngine for ScriptedStore {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn batch_write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteRequest>, StorageError> {
            check_batch_size(requests.len())?;
            self.journal
                .push(Entry::Write(requests.iter().map(WriteRequest::key).collect()));

            let step = self.script.lock().pop_front().unwrap_or(self.fallback);
            match step {
                Step::Persist => self.inner.batch_write(requests),
                Step::Unprocessed(n) => {
                    let split = n.min(requests.len());
                    self.inner.batch_write(&requests[split..])?;
                    Ok(requests[..split].to_vec())
                }
                Step::Fail => Err(StorageError::Backend("scripted failure".into())),
                Step::Panic => panic!("scripted storage panic"),
            }
        }
    }

    /// Storage engine that panics on every call.
    pub struct PanicStore;

    impl StorageEngine for PanicStore {
        fn name(&self) -> &'static str {
            "panic"
        }

        fn batch_write(&self, _requests: &[WriteRequest]) -> Result<Vec<WriteRequest>, StorageError> {
            panic!("storage engine panicked");
        }
    }
}
