//! Consumer pool: worker threads pulling deliveries off the external queue.
//!
//! Each worker owns one channel on the shared connection, limits its
//! unacknowledged deliveries with QoS, decodes each payload into an
//! [`Event`], and hands the resulting [`QueuedMessage`] to a
//! [`MessageHandler`]. Workers never acknowledge decoded messages themselves;
//! the handler settles them once their event is durable.
//!
//! Payloads that fail to decode are requeued until they have been delivered
//! `max_deliveries` times, then dead-lettered (or rejected when no
//! dead-letter sink is configured).
//!
//! Stopping the pool joins the workers but keeps their channels open, so
//! messages already handed to the batch writer can still be acknowledged.
//! [`ConsumerPool::close_channels`] closes them afterwards, returning
//! anything unacknowledged to the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chairlift_core::Event;
use chairlift_core::metrics::{decrement_gauge, increment, increment_gauge};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::QueuedMessage;
use super::dead_letter::{DeadLetterRecord, DeadLetterSink};
use crate::Result;
use crate::transport::{Channel, Connection, Delivery, TransportError};

/// Receives decoded messages from consumer workers.
///
/// Implementations take ownership of the message and are responsible for
/// settling it exactly once.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: QueuedMessage);
}

/// Configuration for the consumer pool.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of worker threads, each with its own channel.
    pub workers: usize,

    /// Unacknowledged deliveries allowed per worker channel.
    pub prefetch: u16,

    /// Queue to consume from.
    pub queue_name: String,

    /// How long a worker waits for a delivery before re-checking for shutdown.
    pub poll_interval: Duration,

    /// Deliveries of an undecodable payload before it is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 50,
            prefetch: 10,
            queue_name: "lift_rides".to_string(),
            poll_interval: Duration::from_millis(100),
            max_deliveries: 3,
        }
    }
}

/// Consumer pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub workers_running: usize,
    pub received: u64,
    /// Deliveries whose payload didn't decode.
    pub poison: u64,
    /// Poison messages dead-lettered or rejected.
    pub dead_lettered: u64,
    /// Workers that exited because their channel failed.
    pub failed_workers: u64,
}

#[derive(Default)]
struct Counters {
    workers_running: AtomicUsize,
    received: AtomicU64,
    poison: AtomicU64,
    dead_lettered: AtomicU64,
    failed_workers: AtomicU64,
}

/// A pool of consumer worker threads.
pub struct ConsumerPool {
    config: ConsumerConfig,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<Option<Box<dyn Channel>>>>>,
    parked: Mutex<Vec<Box<dyn Channel>>>,
    counters: Arc<Counters>,
}

impl ConsumerPool {
    /// Open one consuming channel per worker and start the workers.
    ///
    /// Fails without starting anything if a channel can't be set up.
    pub fn start(
        connection: &Arc<dyn Connection>,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Result<Self> {
        let mut channels = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            channels.push(open_consumer_channel(connection.as_ref(), &config)?);
        }

        let pool = Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
            workers: Mutex::new(Vec::with_capacity(channels.len())),
            parked: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        };

        for (id, channel) in channels.into_iter().enumerate() {
            let worker = Worker {
                id,
                running: Arc::clone(&pool.running),
                handler: Arc::clone(&handler),
                dead_letter: dead_letter.clone(),
                counters: Arc::clone(&pool.counters),
                poll_interval: pool.config.poll_interval,
                max_deliveries: pool.config.max_deliveries,
            };
            let spawned = thread::Builder::new()
                .name(format!("consumer-{}", id))
                .spawn(move || worker.run(channel));

            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.stop();
                    pool.close_channels();
                    return Err(e.into());
                }
            }
        }

        info!(
            "Consumer pool started: {} workers on queue '{}', prefetch {}",
            pool.config.workers, pool.config.queue_name, pool.config.prefetch
        );
        Ok(pool)
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Stop the workers and wait for them to exit.
    ///
    /// Channels stay open until [`close_channels`](Self::close_channels).
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let workers = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        for handle in workers {
            match handle.join() {
                Ok(Some(channel)) => self.parked.lock().push(channel),
                Ok(None) => {}
                Err(_) => error!("Consumer worker panicked"),
            }
        }

        info!("Consumer pool stopped: {} workers joined", count);
    }

    /// Close the channels of stopped workers, requeueing unacked deliveries.
    pub fn close_channels(&self) {
        let channels = std::mem::take(&mut *self.parked.lock());
        for mut channel in channels {
            if let Err(e) = channel.close() {
                debug!(channel = channel.id(), error = %e, "error closing consumer channel");
            }
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            workers_running: self.counters.workers_running.load(Ordering::SeqCst),
            received: self.counters.received.load(Ordering::Relaxed),
            poison: self.counters.poison.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            failed_workers: self.counters.failed_workers.load(Ordering::Relaxed),
        }
    }
}

fn open_consumer_channel(
    connection: &dyn Connection,
    config: &ConsumerConfig,
) -> std::result::Result<Box<dyn Channel>, TransportError> {
    let mut channel = connection.create_channel()?;
    channel.queue_declare(&config.queue_name)?;
    channel.basic_qos(config.prefetch)?;
    channel.basic_consume(&config.queue_name)?;
    Ok(channel)
}

struct Worker {
    id: usize,
    running: Arc<AtomicBool>,
    handler: Arc<dyn MessageHandler>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    counters: Arc<Counters>,
    poll_interval: Duration,
    max_deliveries: u32,
}

impl Worker {
    /// Consume until stopped. Returns the channel unless it failed.
    fn run(self, mut channel: Box<dyn Channel>) -> Option<Box<dyn Channel>> {
        self.counters.workers_running.fetch_add(1, Ordering::SeqCst);
        increment_gauge("consumer_workers_running", 1.0);
        debug!(worker = self.id, channel = channel.id(), "consumer worker started");

        let result = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Some(channel);
            }
            match channel.next_delivery(self.poll_interval) {
                Ok(Some(delivery)) => self.dispatch(delivery),
                Ok(None) => {}
                Err(e) => {
                    error!(worker = self.id, error = %e, "consumer channel failed, worker exiting");
                    self.counters.failed_workers.fetch_add(1, Ordering::Relaxed);
                    break None;
                }
            }
        };

        self.counters.workers_running.fetch_sub(1, Ordering::SeqCst);
        decrement_gauge("consumer_workers_running", 1.0);
        debug!(worker = self.id, "consumer worker stopped");
        result
    }

    fn dispatch(&self, delivery: Delivery) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        increment("consumer_messages_received_total", 1);

        match Event::from_payload(&delivery.payload) {
            Ok(event) => self.handler.handle(QueuedMessage::new(
                event,
                delivery.delivery_count,
                delivery.ack,
            )),
            Err(e) => self.poison(delivery, e),
        }
    }

    fn poison(&self, delivery: Delivery, err: chairlift_core::Error) {
        self.counters.poison.fetch_add(1, Ordering::Relaxed);
        increment("consumer_poison_messages_total", 1);

        let count = delivery.delivery_count;
        if count < self.max_deliveries {
            warn!(
                worker = self.id,
                delivery_count = count,
                error = %err,
                "undecodable message, requeueing"
            );
            self.settle(delivery.ack.nack(true));
            return;
        }

        let settled = match &self.dead_letter {
            Some(sink) => {
                let record =
                    DeadLetterRecord::new(format!("undecodable payload: {}", err), &delivery.payload, count);
                match sink.send(&record) {
                    Ok(()) => delivery.ack.ack(),
                    Err(e) => {
                        warn!(worker = self.id, error = %e, "dead-letter publish failed, requeueing");
                        self.settle(delivery.ack.nack(true));
                        return;
                    }
                }
            }
            None => {
                warn!(
                    worker = self.id,
                    delivery_count = count,
                    error = %err,
                    "undecodable message rejected"
                );
                delivery.ack.reject()
            }
        };

        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        increment("consumer_dead_lettered_total", 1);
        self.settle(settled);
    }

    fn settle(&self, result: std::result::Result<(), TransportError>) {
        if let Err(e) = result {
            warn!(worker = self.id, error = %e, "failed to settle delivery");
        }
    }
}
