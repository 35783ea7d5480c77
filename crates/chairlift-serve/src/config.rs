//! Command-line and environment configuration.
//!
//! Every flag can also be set through the environment variable named next to
//! it, and a `.env` file is loaded before parsing.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use chairlift_ingest::{
    AmqpConfig, BatchWriterConfig, ClickHouseConfig, ConsumerConfig, IngestConfig, IngestMode,
    PoolConfig, RetryPolicy,
};

/// How consumed events are written to storage.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Batched bulk writes through the flush workers.
    Batched,
    /// One write per event on the consumer thread.
    Direct,
}

impl From<Mode> for IngestMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Batched => IngestMode::Batched,
            Mode::Direct => IngestMode::Direct,
        }
    }
}

/// Chairlift lift-ride ingestion service.
#[derive(Parser, Debug, Clone)]
#[command(name = "chairlift")]
#[command(about = "Accepts lift rides over HTTP and stores them durably", long_about = None)]
pub struct Config {
    /// HTTP bind address.
    #[arg(long, env = "CHAIRLIFT_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// AMQP broker URL; an in-process queue is used if unset.
    #[arg(long, env = "AMQP_URL")]
    pub amqp_url: Option<String>,

    /// Declare transient classic queues instead of durable quorum queues.
    #[arg(long, env = "CHAIRLIFT_AMQP_CLASSIC_QUEUES")]
    pub amqp_classic_queues: bool,

    /// Queue rides are published to and consumed from.
    #[arg(long, env = "CHAIRLIFT_QUEUE", default_value = "lift_rides")]
    pub queue: String,

    /// Queue for messages the pipeline gives up on (disabled if unset).
    #[arg(long, env = "CHAIRLIFT_DEAD_LETTER_QUEUE")]
    pub dead_letter_queue: Option<String>,

    /// Maximum publish channels in the pool.
    #[arg(long, env = "CHAIRLIFT_POOL_MAX_TOTAL", default_value_t = 500)]
    pub pool_max_total: usize,

    /// Maximum idle publish channels kept open.
    #[arg(long, env = "CHAIRLIFT_POOL_MAX_IDLE", default_value_t = 500)]
    pub pool_max_idle: usize,

    /// How long a request waits for a publish channel, in milliseconds.
    #[arg(long, env = "CHAIRLIFT_POOL_MAX_WAIT_MS", default_value_t = 5000)]
    pub pool_max_wait_ms: u64,

    /// Fail immediately instead of waiting when the pool is exhausted.
    #[arg(long, env = "CHAIRLIFT_POOL_FAIL_FAST")]
    pub pool_fail_fast: bool,

    /// Consumer worker threads.
    #[arg(long, env = "CHAIRLIFT_CONSUMERS", default_value_t = 50)]
    pub consumers: usize,

    /// Unacknowledged deliveries per consumer.
    #[arg(long, env = "CHAIRLIFT_PREFETCH", default_value_t = 10)]
    pub prefetch: u16,

    /// Deliveries of an undecodable message before it is dead-lettered.
    #[arg(long, env = "CHAIRLIFT_MAX_DELIVERIES", default_value_t = 3)]
    pub max_deliveries: u32,

    /// Write mode.
    #[arg(long, env = "CHAIRLIFT_MODE", value_enum, default_value_t = Mode::Batched)]
    pub mode: Mode,

    /// Flush worker threads.
    #[arg(long, env = "CHAIRLIFT_FLUSH_WORKERS", default_value_t = 30)]
    pub flush_workers: usize,

    /// Events per bulk write (at most 25).
    #[arg(long, env = "CHAIRLIFT_BATCH_SIZE", default_value_t = 25)]
    pub batch_size: usize,

    /// Capacity of the in-process batch queue.
    #[arg(long, env = "CHAIRLIFT_QUEUE_CAPACITY", default_value_t = 1000)]
    pub queue_capacity: usize,

    /// Flush worker sleep when the batch queue is empty, in milliseconds.
    #[arg(long, env = "CHAIRLIFT_IDLE_DELAY_MS", default_value_t = 50)]
    pub idle_delay_ms: u64,

    /// First retry backoff for unprocessed items, in milliseconds.
    #[arg(long, env = "CHAIRLIFT_RETRY_INITIAL_MS", default_value_t = 10)]
    pub retry_initial_ms: u64,

    /// Maximum retry backoff, in milliseconds.
    #[arg(long, env = "CHAIRLIFT_RETRY_MAX_MS", default_value_t = 1000)]
    pub retry_max_ms: u64,

    /// Write attempts per batch before dead-lettering (unbounded if unset).
    #[arg(long, env = "CHAIRLIFT_RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: Option<u32>,

    /// ClickHouse URL; rides are kept in memory if unset.
    #[arg(long, env = "CLICKHOUSE_URL")]
    pub clickhouse_url: Option<String>,

    /// ClickHouse database.
    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "chairlift")]
    pub clickhouse_database: String,

    /// ClickHouse table.
    #[arg(long, env = "CLICKHOUSE_TABLE", default_value = "lift_rides")]
    pub clickhouse_table: String,

    /// Prometheus metrics port (0 disables).
    #[arg(long, env = "CHAIRLIFT_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,
}

impl Config {
    /// Pipeline configuration derived from the flags.
    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            queue_name: self.queue.clone(),
            pool: PoolConfig {
                max_total: self.pool_max_total,
                max_idle: self.pool_max_idle,
                block_when_exhausted: !self.pool_fail_fast,
                max_wait: Duration::from_millis(self.pool_max_wait_ms),
            },
            consumer: ConsumerConfig {
                workers: self.consumers,
                prefetch: self.prefetch,
                queue_name: self.queue.clone(),
                max_deliveries: self.max_deliveries,
                ..Default::default()
            },
            batch: BatchWriterConfig {
                flush_workers: self.flush_workers,
                max_batch_size: self.batch_size,
                idle_delay: Duration::from_millis(self.idle_delay_ms),
                queue_capacity: self.queue_capacity,
                retry: RetryPolicy {
                    initial_backoff: Duration::from_millis(self.retry_initial_ms),
                    max_backoff: Duration::from_millis(self.retry_max_ms),
                    max_attempts: self.retry_max_attempts,
                },
            },
            mode: self.mode.into(),
            dead_letter_queue: self.dead_letter_queue.clone(),
        }
    }

    /// AMQP broker, if one is configured.
    pub fn amqp_config(&self) -> Option<AmqpConfig> {
        self.amqp_url.as_ref().map(|url| AmqpConfig {
            url: url.clone(),
            quorum_queues: !self.amqp_classic_queues,
        })
    }

    /// ClickHouse target, if one is configured.
    pub fn clickhouse_config(&self) -> Option<ClickHouseConfig> {
        self.clickhouse_url.as_ref().map(|url| ClickHouseConfig {
            url: url.clone(),
            database: self.clickhouse_database.clone(),
            table: self.clickhouse_table.clone(),
        })
    }
}
