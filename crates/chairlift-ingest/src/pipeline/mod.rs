//! Consumer-side pipeline: from queue deliveries to durable, acknowledged rides.
//!
//! - [`ConsumerPool`] - worker threads pulling deliveries off the external queue
//! - [`EventQueue`] - bounded hand-off between consumers and flush workers
//! - [`BatchWriter`] - bounded bulk writes with unprocessed-item retry
//! - [`DirectWriter`] - the same commit rules, one message at a time
//! - [`DeadLetterPublisher`] - where messages go when the pipeline gives up
//!
//! # Architecture
//!
//! ```text
//! [Broker] → [ConsumerPool] → [EventQueue] → [BatchWriter] → [StorageEngine]
//!                 │                                │
//!            poison → DLQ                 ack after commit
//! ```

mod batch;
mod consumer;
mod dead_letter;
mod message;
mod queue;

pub use batch::{BatchWriter, BatchWriterConfig, BatchWriterStats, DirectWriter, MAX_BATCH_SIZE, RetryPolicy};
pub use consumer::{ConsumerConfig, ConsumerPool, ConsumerStats, MessageHandler};
pub use dead_letter::{DeadLetterPublisher, DeadLetterRecord, DeadLetterSink};
pub use message::QueuedMessage;
pub use queue::{DEFAULT_QUEUE_CAPACITY, EventQueue};
