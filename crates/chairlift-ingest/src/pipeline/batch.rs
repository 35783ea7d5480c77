//! Batch writer: drains the event queue into bounded bulk writes.
//!
//! # Architecture
//!
//! ```text
//!   ConsumerPool ──put──► EventQueue ──drain_up_to(25)──► flush worker × N
//!                                                              │
//!                                                              ▼
//!                                          StorageEngine::batch_write(≤25)
//!                                                              │
//!                                           unprocessed? ──yes──┘ (resubmit
//!                                                │ no              only those)
//!                                                ▼
//!                                       ack every message in the batch
//! ```
//!
//! A message is acknowledged only once the record it maps to has been
//! reported persisted. Requests are correlated back to messages by
//! [`RideKey`]; two messages carrying the same ride share one request.
//!
//! With the default [`RetryPolicy`] the unprocessed set is resubmitted until
//! it is empty. With `max_attempts` set, whatever is still unprocessed when
//! the budget runs out goes to the dead-letter sink (then acked) or, without
//! a sink, is nacked with requeue so the broker delivers it again.
//!
//! On shutdown the workers keep draining until the queue is empty. Batches
//! still failing at that point get one attempt and are then requeued.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chairlift_core::RideKey;
use chairlift_core::metrics::{
    decrement_gauge, increment, increment_gauge, record_duration, set_gauge,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::consumer::MessageHandler;
use super::dead_letter::{DeadLetterRecord, DeadLetterSink};
use super::queue::{DEFAULT_QUEUE_CAPACITY, EventQueue};
use super::QueuedMessage;
use crate::gateway::PublishError;
use crate::storage::{StorageEngine, WriteRequest};

pub use crate::storage::MAX_BATCH_SIZE;

/// How long a consumer waits for queue space before re-checking for shutdown.
const ENQUEUE_POLL: Duration = Duration::from_millis(100);

/// Backoff and budget for resubmitting unprocessed requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,

    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,

    /// Total attempts per batch; `None` retries until everything persists.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempt` failed attempts (1-based), doubling each
    /// time up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempts` attempts.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Number of flush worker threads.
    pub flush_workers: usize,

    /// Messages per bulk write, clamped to `1..=MAX_BATCH_SIZE`.
    pub max_batch_size: usize,

    /// Sleep between polls of an empty queue.
    pub idle_delay: Duration,

    /// Capacity of the internal queue.
    pub queue_capacity: usize,

    pub retry: RetryPolicy,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            flush_workers: 30,
            max_batch_size: MAX_BATCH_SIZE,
            idle_delay: Duration::from_millis(50),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}

impl BatchWriterConfig {
    /// The batch size actually used.
    pub fn batch_limit(&self) -> usize {
        self.max_batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// Counters reported by [`BatchWriter::stats`] and [`DirectWriter::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWriterStats {
    /// Batches fully persisted and acknowledged.
    pub batches: u64,
    /// Messages acknowledged after their record was persisted.
    pub events_committed: u64,
    pub write_calls: u64,
    /// Requests resubmitted after being reported unprocessed.
    pub items_retried: u64,
    pub dead_lettered: u64,
    /// Messages handed back to the broker with requeue.
    pub requeued: u64,
    pub ack_failures: u64,
    /// Flush workers that panicked, counted when joined.
    pub failed_workers: u64,
    pub queue_depth: usize,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    events_committed: AtomicU64,
    write_calls: AtomicU64,
    items_retried: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
    ack_failures: AtomicU64,
    failed_workers: AtomicU64,
}

impl Counters {
    fn snapshot(&self, queue_depth: usize) -> BatchWriterStats {
        BatchWriterStats {
            batches: self.batches.load(Ordering::Relaxed),
            events_committed: self.events_committed.load(Ordering::Relaxed),
            write_calls: self.write_calls.load(Ordering::Relaxed),
            items_retried: self.items_retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            failed_workers: self.failed_workers.load(Ordering::Relaxed),
            queue_depth,
        }
    }
}

enum Outcome {
    Persisted,
    /// Retry budget spent.
    Exhausted,
    /// Shutdown while requests were still unprocessed.
    Abandoned,
}

/// Writes batches to storage and settles their messages.
struct Committer {
    storage: Arc<dyn StorageEngine>,
    retry: RetryPolicy,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    running: Arc<AtomicBool>,
    counters: Counters,
}

impl Committer {
    fn commit(&self, batch: Vec<QueuedMessage>) {
        if batch.is_empty() {
            return;
        }
        let started = Instant::now();

        let mut positions: HashMap<RideKey, usize> = HashMap::with_capacity(batch.len());
        let mut pending: Vec<WriteRequest> = Vec::with_capacity(batch.len());
        for message in &batch {
            let request = WriteRequest::from(message.record());
            match positions.get(&request.key()) {
                Some(&i) => pending[i] = request,
                None => {
                    positions.insert(request.key(), pending.len());
                    pending.push(request);
                }
            }
        }

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            pending = self.write_attempt(pending);

            if pending.is_empty() {
                break Outcome::Persisted;
            }
            if !self.running.load(Ordering::SeqCst) {
                break Outcome::Abandoned;
            }
            if !self.retry.allows(attempts) {
                break Outcome::Exhausted;
            }

            self.counters
                .items_retried
                .fetch_add(pending.len() as u64, Ordering::Relaxed);
            increment("batch_items_retried_total", pending.len() as u64);
            debug!(
                attempt = attempts,
                unprocessed = pending.len(),
                "resubmitting unprocessed requests"
            );
            thread::sleep(self.retry.backoff(attempts));
        };

        if let Outcome::Persisted = outcome {
            let count = batch.len() as u64;
            for message in batch {
                self.settle_ack(message);
            }
            self.counters.batches.fetch_add(1, Ordering::Relaxed);
            self.counters
                .events_committed
                .fetch_add(count, Ordering::Relaxed);
            increment("batch_flushed_total", 1);
            increment("batch_events_committed_total", count);
            record_duration("batch_commit_duration_seconds", started.elapsed());
            debug!(events = count, attempts, "batch committed");
            return;
        }

        let failed: HashSet<RideKey> = pending.iter().map(WriteRequest::key).collect();
        warn!(
            attempts,
            unprocessed = failed.len(),
            batch = batch.len(),
            shutting_down = matches!(outcome, Outcome::Abandoned),
            "batch not fully persisted"
        );

        for message in batch {
            if !failed.contains(&message.record().key()) {
                self.counters
                    .events_committed
                    .fetch_add(1, Ordering::Relaxed);
                increment("batch_events_committed_total", 1);
                self.settle_ack(message);
            } else if let Outcome::Exhausted = outcome {
                self.dead_letter_or_requeue(message, attempts);
            } else {
                self.settle_nack(message);
            }
        }
    }

    /// One bulk write. A failed call counts as every request unprocessed.
    fn write_attempt(&self, requests: Vec<WriteRequest>) -> Vec<WriteRequest> {
        self.counters.write_calls.fetch_add(1, Ordering::Relaxed);
        increment("storage_write_calls_total", 1);

        let started = Instant::now();
        let result = self.storage.batch_write(&requests);
        record_duration("storage_write_duration_seconds", started.elapsed());

        match result {
            Ok(unprocessed) => unprocessed,
            Err(e) => {
                increment("storage_write_errors_total", 1);
                warn!(
                    engine = self.storage.name(),
                    requests = requests.len(),
                    error = %e,
                    "bulk write failed"
                );
                requests
            }
        }
    }

    fn dead_letter_or_requeue(&self, message: QueuedMessage, attempts: u32) {
        let Some(sink) = &self.dead_letter else {
            self.settle_nack(message);
            return;
        };

        let reason = format!("still unprocessed after {} write attempts", attempts);
        let sent = message
            .event
            .to_payload()
            .map_err(PublishError::from)
            .and_then(|payload| {
                sink.send(&DeadLetterRecord::new(
                    reason,
                    &payload,
                    message.delivery_count(),
                ))
            });

        match sent {
            Ok(()) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                increment("batch_events_dead_lettered_total", 1);
                self.settle_ack(message);
            }
            Err(e) => {
                warn!(error = %e, "dead-letter publish failed, requeueing message");
                self.settle_nack(message);
            }
        }
    }

    fn settle_ack(&self, message: QueuedMessage) {
        let tag = message.delivery_tag();
        if let Err(e) = message.ack() {
            self.ack_failed(tag, e);
        }
    }

    fn settle_nack(&self, message: QueuedMessage) {
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        let tag = message.delivery_tag();
        if let Err(e) = message.nack(true) {
            self.ack_failed(tag, e);
        }
    }

    fn ack_failed(&self, delivery_tag: u64, e: crate::transport::TransportError) {
        self.counters.ack_failures.fetch_add(1, Ordering::Relaxed);
        increment("batch_ack_failures_total", 1);
        warn!(delivery_tag, error = %e, "failed to settle message");
    }
}

/// Batches queued messages into bulk writes on a pool of flush workers.
pub struct BatchWriter {
    queue: Arc<EventQueue>,
    committer: Arc<Committer>,
    config: BatchWriterConfig,
    running: Arc<AtomicBool>,
    /// Cleared by [`BatchWriter::close_intake`]; handlers then requeue.
    accepting: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchWriter {
    /// Create a stopped writer. Call [`start`](Self::start) to spawn workers.
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        config: BatchWriterConfig,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(false));
        let committer = Arc::new(Committer {
            storage,
            retry: config.retry.clone(),
            dead_letter,
            running: Arc::clone(&running),
            counters: Counters::default(),
        });

        Self {
            queue: Arc::new(EventQueue::new(config.queue_capacity)),
            committer,
            config,
            running,
            accepting: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the flush workers.
    pub fn start(&self) -> io::Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        self.accepting.store(true, Ordering::SeqCst);

        let batch_limit = self.config.batch_limit();
        for worker in 0..self.config.flush_workers {
            let queue = Arc::clone(&self.queue);
            let committer = Arc::clone(&self.committer);
            let running = Arc::clone(&self.running);
            let idle_delay = self.config.idle_delay;

            let handle = thread::Builder::new()
                .name(format!("flush-{}", worker))
                .spawn(move || {
                    flush_loop(worker, &queue, &committer, &running, batch_limit, idle_delay)
                })?;
            workers.push(handle);
        }

        info!(
            "Batch writer started: {} flush workers, batch size {}, engine {}",
            self.config.flush_workers,
            batch_limit,
            self.committer.storage.name()
        );
        Ok(())
    }

    /// Enqueue a message, blocking while the queue is full.
    pub fn submit(&self, message: QueuedMessage) {
        self.queue.put(message);
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn config(&self) -> &BatchWriterConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether [`handle`](MessageHandler::handle) still enqueues messages.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && self.is_running()
    }

    /// Stop taking new messages; handlers nack them with requeue from now on.
    ///
    /// Consumers blocked on a full queue give up within one poll interval,
    /// so they can be joined even while storage is refusing writes. The flush
    /// workers keep running until [`shutdown`](Self::shutdown).
    pub fn close_intake(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            debug!("Batch writer intake closed");
        }
    }

    /// Stop the flush workers once the queue is drained and join them.
    ///
    /// Messages left behind by workers that died are requeued at the broker.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        let workers = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        for handle in workers {
            let name = handle.thread().name().unwrap_or("flush").to_string();
            if handle.join().is_err() {
                self.committer
                    .counters
                    .failed_workers
                    .fetch_add(1, Ordering::Relaxed);
                increment("batch_worker_panics_total", 1);
                error!("Flush worker {} panicked", name);
            }
        }

        let leftovers = self.queue.drain_up_to(usize::MAX);
        if !leftovers.is_empty() {
            warn!("Requeueing {} messages left in the batch queue", leftovers.len());
            for message in leftovers {
                self.committer.settle_nack(message);
            }
        }

        info!("Batch writer stopped: {} flush workers joined", count);
    }

    pub fn stats(&self) -> BatchWriterStats {
        self.committer.counters.snapshot(self.queue.len())
    }
}

impl MessageHandler for BatchWriter {
    fn handle(&self, message: QueuedMessage) {
        let mut message = message;
        loop {
            if !self.is_accepting() {
                self.committer.settle_nack(message);
                return;
            }
            match self.queue.put_timeout(message, ENQUEUE_POLL) {
                Ok(()) => return,
                Err(returned) => message = returned,
            }
        }
    }
}

fn flush_loop(
    worker: usize,
    queue: &EventQueue,
    committer: &Committer,
    running: &AtomicBool,
    batch_limit: usize,
    idle_delay: Duration,
) {
    increment_gauge("batch_workers_running", 1.0);
    debug!(worker, "flush worker started");

    loop {
        let batch = queue.drain_up_to(batch_limit);
        set_gauge("batch_queue_depth", queue.len() as f64);

        if batch.is_empty() {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(idle_delay);
            continue;
        }
        committer.commit(batch);
    }

    debug!(worker, "flush worker stopped");
    decrement_gauge("batch_workers_running", 1.0);
}

/// Writes each message on its own, synchronously on the consumer thread.
///
/// Same retry and settlement rules as [`BatchWriter`], with a batch of one.
pub struct DirectWriter {
    committer: Committer,
}

impl DirectWriter {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        retry: RetryPolicy,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        Self {
            committer: Committer {
                storage,
                retry,
                dead_letter,
                running: Arc::new(AtomicBool::new(true)),
                counters: Counters::default(),
            },
        }
    }

    /// Stop retrying; messages still failing are requeued.
    pub fn stop(&self) {
        self.committer.running.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> BatchWriterStats {
        self.committer.counters.snapshot(0)
    }
}

impl MessageHandler for DirectWriter {
    fn handle(&self, message: QueuedMessage) {
        self.committer.commit(vec![message]);
    }
}
