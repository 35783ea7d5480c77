//! Composition of the pipeline into one process-scoped service.
//!
//! [`IngestService`] owns everything that lives for the life of the process:
//! the shared connection, the channel pool and gateway used by ingress, the
//! writer, and the consumer pool. Nothing here is global; the binary builds
//! one service and hands the gateway to the HTTP layer.

use std::sync::Arc;

use tracing::{info, warn};

use crate::gateway::IngressGateway;
use crate::pipeline::{
    BatchWriter, BatchWriterConfig, BatchWriterStats, ConsumerConfig, ConsumerPool,
    ConsumerStats, DeadLetterPublisher, DeadLetterSink, DirectWriter, MessageHandler,
};
use crate::pool::{ChannelPool, PoolConfig, PoolStats};
use crate::storage::StorageEngine;
use crate::transport::Connection;
use crate::{Error, Result};

/// How consumed messages reach storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IngestMode {
    /// Through the bounded queue and flush workers, up to 25 per write.
    #[default]
    Batched,
    /// One write per message on the consumer thread.
    Direct,
}

/// Configuration for the whole pipeline.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Queue events are published to and consumed from.
    pub queue_name: String,
    pub pool: PoolConfig,
    /// Consumer settings; its `queue_name` is replaced by the one above.
    pub consumer: ConsumerConfig,
    pub batch: BatchWriterConfig,
    pub mode: IngestMode,
    /// Queue for poison messages and events that exhaust the retry budget.
    pub dead_letter_queue: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_name: "lift_rides".to_string(),
            pool: PoolConfig::default(),
            consumer: ConsumerConfig::default(),
            batch: BatchWriterConfig::default(),
            mode: IngestMode::default(),
            dead_letter_queue: None,
        }
    }
}

impl IngestConfig {
    /// Check for settings the pipeline can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.is_empty() {
            return Err(Error::Config("queue name must not be empty".into()));
        }
        if self.pool.max_total == 0 {
            return Err(Error::Config("channel pool needs at least one channel".into()));
        }
        if self.consumer.prefetch == 0 {
            return Err(Error::Config(
                "consumer prefetch must be at least 1 (0 disables flow control)".into(),
            ));
        }
        if self.consumer.workers == 0 {
            return Err(Error::Config("at least one consumer worker is required".into()));
        }
        if self.mode == IngestMode::Batched && self.batch.flush_workers == 0 {
            return Err(Error::Config("batched mode needs at least one flush worker".into()));
        }
        if self.dead_letter_queue.as_deref() == Some(self.queue_name.as_str()) {
            return Err(Error::Config(
                "dead-letter queue must differ from the ingest queue".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of every component's statistics.
#[derive(Debug, Clone, Copy)]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub consumers: ConsumerStats,
    pub writer: BatchWriterStats,
}

enum Writer {
    Batched(Arc<BatchWriter>),
    Direct(Arc<DirectWriter>),
}

impl Writer {
    fn stats(&self) -> BatchWriterStats {
        match self {
            Self::Batched(writer) => writer.stats(),
            Self::Direct(writer) => writer.stats(),
        }
    }
}

/// The running ingestion pipeline.
pub struct IngestService {
    connection: Arc<dyn Connection>,
    pool: Arc<ChannelPool>,
    gateway: Arc<IngressGateway>,
    writer: Writer,
    consumers: ConsumerPool,
}

impl IngestService {
    /// Declare queues, start the writer, then start consuming.
    pub fn start(
        connection: Arc<dyn Connection>,
        storage: Arc<dyn StorageEngine>,
        config: IngestConfig,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(ChannelPool::new(Arc::clone(&connection), config.pool.clone()));
        let gateway = Arc::new(IngressGateway::new(Arc::clone(&pool), &config.queue_name));
        gateway.declare_queue()?;

        let dead_letter: Option<Arc<dyn DeadLetterSink>> = match &config.dead_letter_queue {
            Some(queue) => {
                let dlq = IngressGateway::new(Arc::clone(&pool), queue.as_str());
                dlq.declare_queue()?;
                Some(Arc::new(DeadLetterPublisher::new(dlq)))
            }
            None => None,
        };

        let (writer, handler): (Writer, Arc<dyn MessageHandler>) = match config.mode {
            IngestMode::Batched => {
                let batch = Arc::new(BatchWriter::new(
                    Arc::clone(&storage),
                    config.batch.clone(),
                    dead_letter.clone(),
                ));
                batch.start()?;
                let handler: Arc<dyn MessageHandler> = batch.clone();
                (Writer::Batched(batch), handler)
            }
            IngestMode::Direct => {
                let direct = Arc::new(DirectWriter::new(
                    Arc::clone(&storage),
                    config.batch.retry.clone(),
                    dead_letter.clone(),
                ));
                let handler: Arc<dyn MessageHandler> = direct.clone();
                (Writer::Direct(direct), handler)
            }
        };

        let consumer_config = ConsumerConfig {
            queue_name: config.queue_name.clone(),
            ..config.consumer
        };
        let consumers = match ConsumerPool::start(&connection, consumer_config, handler, dead_letter) {
            Ok(consumers) => consumers,
            Err(e) => {
                if let Writer::Batched(batch) = &writer {
                    batch.shutdown();
                }
                pool.close();
                return Err(e);
            }
        };

        info!(
            "Ingest service started: queue={}, mode={:?}, storage={}, dead_letter={:?}",
            config.queue_name,
            config.mode,
            storage.name(),
            config.dead_letter_queue
        );

        Ok(Self {
            connection,
            pool,
            gateway,
            writer,
            consumers,
        })
    }

    /// Gateway for publishing events.
    pub fn gateway(&self) -> &Arc<IngressGateway> {
        &self.gateway
    }

    /// The batch writer, in batched mode.
    pub fn batch_writer(&self) -> Option<&Arc<BatchWriter>> {
        match &self.writer {
            Writer::Batched(writer) => Some(writer),
            Writer::Direct(_) => None,
        }
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            pool: self.pool.stats(),
            consumers: self.consumers.stats(),
            writer: self.writer.stats(),
        }
    }

    /// Stop consuming, flush what was consumed, and release all channels.
    ///
    /// Blocks until the workers have exited. Messages that couldn't be
    /// persisted go back to the broker.
    pub fn shutdown(&self) {
        info!("Ingest service shutting down");

        match &self.writer {
            Writer::Batched(batch) => {
                // Consumers may be waiting for queue space behind a stalled writer
                batch.close_intake();
                self.consumers.stop();
                batch.shutdown();
            }
            Writer::Direct(direct) => {
                // Consumers may be stuck retrying inside the writer
                direct.stop();
                self.consumers.stop();
            }
        }
        self.consumers.close_channels();
        self.pool.close();

        if let Err(e) = self.connection.close() {
            warn!(error = %e, "error closing connection");
        }

        let stats = self.stats();
        info!(
            "Ingest service stopped: {} events committed, {} dead-lettered, {} requeued",
            stats.writer.events_committed, stats.writer.dead_lettered, stats.writer.requeued
        );
    }
}
