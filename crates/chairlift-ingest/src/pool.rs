//! Bounded pool of reusable transport channels.
//!
//! Opening a channel costs a broker round trip, so the ingress path borrows
//! one from a [`ChannelPool`] for each publish and hands it back afterwards.
//!
//! ```text
//!   borrow() ──► idle channel? ──yes──► PooledChannel ──drop──► back to idle
//!                    │ no                                      (or closed if
//!                    ▼                                         broken / over
//!              live < max_total? ──yes──► create on Connection  max_idle)
//!                    │ no
//!                    ▼
//!              wait up to max_wait ──► PoolError::Exhausted
//! ```
//!
//! The pool never has more than `max_total` live channels, counting both
//! idle and borrowed ones. Channels are created lazily.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chairlift_core::metrics::{increment, record_duration, set_gauge};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{Channel, Connection, TransportError};

/// Configuration for the channel pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live channels (idle + borrowed).
    pub max_total: usize,

    /// Maximum number of idle channels kept for reuse.
    pub max_idle: usize,

    /// Whether `borrow` waits for a channel when the pool is exhausted.
    pub block_when_exhausted: bool,

    /// How long `borrow` waits before giving up.
    pub max_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 500,
            max_idle: 500,
            block_when_exhausted: true,
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Errors returned by [`ChannelPool::borrow`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every channel is in use and none came back in time.
    #[error("channel pool exhausted after waiting {waited:?} (max_total={max_total})")]
    Exhausted { waited: Duration, max_total: usize },

    /// The pool has been closed.
    #[error("channel pool closed")]
    Closed,

    /// Opening a new channel failed.
    #[error("failed to open channel: {0}")]
    Transport(#[from] TransportError),
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrow_timeouts: u64,
}

struct PoolState {
    idle: Vec<Box<dyn Channel>>,
    /// Idle plus borrowed channels.
    live: usize,
    closed: bool,
}

/// A bounded, thread-safe pool of channels opened on one shared connection.
pub struct ChannelPool {
    connection: Arc<dyn Connection>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    created: AtomicU64,
    destroyed: AtomicU64,
    borrow_timeouts: AtomicU64,
}

impl ChannelPool {
    /// Create an empty pool that opens channels on `connection`.
    pub fn new(connection: Arc<dyn Connection>, config: PoolConfig) -> Self {
        info!(
            "Channel pool created: max_total={}, max_idle={}, max_wait={:?}",
            config.max_total, config.max_idle, config.max_wait
        );

        Self {
            connection,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                live: 0,
                closed: false,
            }),
            available: Condvar::new(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            borrow_timeouts: AtomicU64::new(0),
        }
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a channel.
    ///
    /// Reuses an idle channel when one is open, otherwise opens a new one if
    /// the pool is below `max_total`. When exhausted, waits up to `max_wait`
    /// (or fails at once if `block_when_exhausted` is off).
    pub fn borrow(&self) -> Result<PooledChannel<'_>, PoolError> {
        let started = Instant::now();
        let deadline = started.checked_add(self.config.max_wait);
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            while let Some(channel) = state.idle.pop() {
                if channel.is_open() {
                    self.update_gauges(&state);
                    drop(state);
                    record_duration("pool_borrow_wait_seconds", started.elapsed());
                    return Ok(PooledChannel::new(self, channel));
                }
                debug!(channel = channel.id(), "discarding closed idle channel");
                state.live -= 1;
                self.destroy(channel);
            }

            if state.live < self.config.max_total {
                state.live += 1;
                drop(state);
                return self.open_channel(started);
            }

            if !self.config.block_when_exhausted {
                return Err(self.exhausted(started));
            }

            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.available.wait(&mut state);
                    false
                }
            };
            if timed_out
                && !state.closed
                && state.idle.is_empty()
                && state.live >= self.config.max_total
            {
                return Err(self.exhausted(started));
            }
        }
    }

    /// Close the pool.
    ///
    /// Idle channels are closed now, waiting borrowers fail with
    /// [`PoolError::Closed`], and borrowed channels are closed when returned.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        state.live -= idle.len();
        self.update_gauges(&state);
        drop(state);

        let count = idle.len();
        for channel in idle {
            self.destroy(channel);
        }
        self.available.notify_all();

        info!("Channel pool closed: {} idle channels released", count);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.live - state.idle.len(),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            borrow_timeouts: self.borrow_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Open a channel for a slot already reserved in `live`.
    fn open_channel(&self, started: Instant) -> Result<PooledChannel<'_>, PoolError> {
        match self.connection.create_channel() {
            Ok(channel) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                increment("pool_channels_created_total", 1);
                debug!(channel = channel.id(), "pool opened channel");
                self.update_gauges(&self.state.lock());
                record_duration("pool_borrow_wait_seconds", started.elapsed());
                Ok(PooledChannel::new(self, channel))
            }
            Err(e) => {
                self.state.lock().live -= 1;
                self.available.notify_one();
                Err(e.into())
            }
        }
    }

    fn exhausted(&self, started: Instant) -> PoolError {
        self.borrow_timeouts.fetch_add(1, Ordering::Relaxed);
        increment("pool_borrow_timeouts_total", 1);
        let waited = started.elapsed();
        warn!(
            "Channel pool exhausted: max_total={}, waited={:?}",
            self.config.max_total, waited
        );
        PoolError::Exhausted {
            waited,
            max_total: self.config.max_total,
        }
    }

    fn give_back(&self, channel: Box<dyn Channel>) {
        let mut state = self.state.lock();
        if state.closed || !channel.is_open() || state.idle.len() >= self.config.max_idle {
            state.live -= 1;
            self.update_gauges(&state);
            drop(state);
            self.destroy(channel);
        } else {
            state.idle.push(channel);
            self.update_gauges(&state);
            drop(state);
        }
        self.available.notify_one();
    }

    fn release_broken(&self, channel: Box<dyn Channel>) {
        let mut state = self.state.lock();
        state.live -= 1;
        self.update_gauges(&state);
        drop(state);
        self.destroy(channel);
        self.available.notify_one();
    }

    fn destroy(&self, mut channel: Box<dyn Channel>) {
        if let Err(e) = channel.close() {
            debug!(channel = channel.id(), error = %e, "error closing pooled channel");
        }
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        increment("pool_channels_destroyed_total", 1);
    }

    fn update_gauges(&self, state: &PoolState) {
        set_gauge("pool_channels_idle", state.idle.len() as f64);
        set_gauge(
            "pool_channels_active",
            (state.live - state.idle.len()) as f64,
        );
    }
}

/// A channel borrowed from a [`ChannelPool`].
///
/// Dropping the guard returns the channel to the pool; use
/// [`invalidate`](Self::invalidate) when the channel is known to be broken.
pub struct PooledChannel<'a> {
    pool: &'a ChannelPool,
    channel: Option<Box<dyn Channel>>,
}

impl<'a> PooledChannel<'a> {
    fn new(pool: &'a ChannelPool, channel: Box<dyn Channel>) -> Self {
        Self {
            pool,
            channel: Some(channel),
        }
    }

    /// Destroy the channel instead of returning it to the pool.
    pub fn invalidate(mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.release_broken(channel);
        }
    }
}

impl Deref for PooledChannel<'_> {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel
            .as_deref()
            .expect("pooled channel is present until dropped")
    }
}

impl DerefMut for PooledChannel<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.channel
            .as_deref_mut()
            .expect("pooled channel is present until dropped")
    }
}

impl fmt::Debug for PooledChannel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("channel_id", &self.channel.as_ref().map(|c| c.id()))
            .finish_non_exhaustive()
    }
}

impl Drop for PooledChannel<'_> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.give_back(channel);
        }
    }
}
