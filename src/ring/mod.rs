//! Bounded ring buffer and worker pool.
//!
//! The ring is the hand-off point between threads that receive work (log
//! consumers, event publishers) and threads that process it. It is a
//! fixed-size, power-of-two [`ArrayQueue`] with configurable wait behaviour
//! on both sides: producers back off while the ring is full, workers back
//! off while it is empty.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Errors from the ring buffer and worker pool.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("ring size must be a non-zero power of two, got {0}")]
    InvalidSize(usize),

    #[error("ring buffer is closed")]
    Closed,

    #[error("single-producer ring published from a second thread")]
    ForeignProducer,

    #[error("worker pool needs at least one handler")]
    NoWorkers,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RingError>;

// ============================================================================
// Configuration
// ============================================================================

/// How a waiting thread idles while the ring is full or empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    /// Park on a condition variable. Lowest CPU, highest latency.
    #[default]
    Blocking,
    /// Spin, then yield, then sleep briefly.
    Sleeping,
    /// Spin, then yield the time slice.
    Yielding,
    /// Spin without yielding. Burns a core per waiting thread.
    BusySpin,
}

impl WaitStrategy {
    /// Parses a configured name; anything unrecognised falls back to blocking.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "sleeping" => WaitStrategy::Sleeping,
            "yielding" => WaitStrategy::Yielding,
            "busyspin" | "busy_spin" | "busy-spin" => WaitStrategy::BusySpin,
            "blocking" => WaitStrategy::Blocking,
            other => {
                debug!(strategy = %other, "Unknown wait strategy, using blocking");
                WaitStrategy::Blocking
            }
        }
    }
}

impl<'de> Deserialize<'de> for WaitStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(WaitStrategy::from_name(&name))
    }
}

/// Whether one or many threads publish into a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// Only the first thread that publishes may publish again.
    Single,
    Multi,
}

/// Ring buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Slot count. Must be a power of two.
    pub size: usize,
    pub wait_strategy: WaitStrategy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            size: 1024,
            wait_strategy: WaitStrategy::Blocking,
        }
    }
}

// ============================================================================
// Ring buffer
// ============================================================================

const SPIN_TRIES: u32 = 100;
const SLEEP_TRIES: u32 = 200;
const SLEEP_PARK: Duration = Duration::from_micros(100);
// Upper bound on a blocking wait before the condition is rechecked.
const BLOCKING_PARK: Duration = Duration::from_millis(10);

pub struct RingBuffer<T> {
    queue: ArrayQueue<T>,
    wait: WaitStrategy,
    mode: ProducerMode,
    owner: OnceLock<ThreadId>,
    closed: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

impl<T> RingBuffer<T> {
    pub fn new(size: usize, wait: WaitStrategy, mode: ProducerMode) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(RingError::InvalidSize(size));
        }
        Ok(Self {
            queue: ArrayQueue::new(size),
            wait,
            mode,
            owner: OnceLock::new(),
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
            signal: Condvar::new(),
        })
    }

    pub fn from_config(config: &RingConfig, mode: ProducerMode) -> Result<Self> {
        Self::new(config.size, config.wait_strategy, mode)
    }

    /// Publishes `item`, waiting while the ring is full.
    pub fn publish(&self, item: T) -> Result<()> {
        self.check_producer()?;
        let mut item = item;
        let mut idle = Idle::new(self.wait);
        loop {
            if self.is_closed() {
                return Err(RingError::Closed);
            }
            match self.queue.push(item) {
                Ok(()) => {
                    self.wake();
                    return Ok(());
                }
                Err(rejected) => {
                    item = rejected;
                    idle.wait(self, || !self.queue.is_full());
                }
            }
        }
    }

    /// Publishes without waiting. Hands the item back when the ring is full
    /// or closed.
    pub fn try_publish(&self, item: T) -> std::result::Result<(), T> {
        if self.is_closed() || self.check_producer().is_err() {
            return Err(item);
        }
        self.queue.push(item)?;
        self.wake();
        Ok(())
    }

    /// Takes the next item, waiting while the ring is empty.
    ///
    /// Returns `None` once the ring is closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut idle = Idle::new(self.wait);
        loop {
            if let Some(item) = self.queue.pop() {
                self.wake();
                return Some(item);
            }
            if self.is_closed() {
                return self.queue.pop();
            }
            idle.wait(self, || !self.queue.is_empty());
        }
    }

    /// Stops accepting items. Waiting workers drain what is left and stop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.signal.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    fn check_producer(&self) -> Result<()> {
        if self.mode == ProducerMode::Multi {
            return Ok(());
        }
        let current = thread::current().id();
        if *self.owner.get_or_init(|| current) == current {
            Ok(())
        } else {
            Err(RingError::ForeignProducer)
        }
    }

    fn wake(&self) {
        if self.wait == WaitStrategy::Blocking {
            let _guard = self.lock.lock();
            self.signal.notify_all();
        }
    }
}

/// Per-wait idling state for one call to publish or take.
struct Idle {
    strategy: WaitStrategy,
    tries: u32,
}

impl Idle {
    fn new(strategy: WaitStrategy) -> Self {
        let tries = match strategy {
            WaitStrategy::Sleeping => SLEEP_TRIES,
            _ => SPIN_TRIES,
        };
        Self { strategy, tries }
    }

    fn wait<T>(&mut self, ring: &RingBuffer<T>, ready: impl Fn() -> bool) {
        match self.strategy {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding => {
                if self.tries > 0 {
                    self.tries -= 1;
                    std::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
            WaitStrategy::Sleeping => {
                if self.tries > SPIN_TRIES {
                    self.tries -= 1;
                    std::hint::spin_loop();
                } else if self.tries > 0 {
                    self.tries -= 1;
                    thread::yield_now();
                } else {
                    thread::sleep(SLEEP_PARK);
                }
            }
            WaitStrategy::Blocking => {
                let mut guard = ring.lock.lock();
                while !ready() && !ring.is_closed() {
                    if ring.signal.wait_for(&mut guard, BLOCKING_PARK).timed_out() {
                        break;
                    }
                }
            }
        }
    }
}

// ============================================================================
// Worker pool
// ============================================================================

/// Processes items taken from a ring. Each worker thread owns one handler.
pub trait WorkHandler<T>: Send + 'static {
    fn on_event(&mut self, event: T);
}

/// Worker threads draining a shared ring.
///
/// Each item is processed by exactly one worker. Items are not ordered
/// across workers.
pub struct WorkerPool<T> {
    name: String,
    ring: Arc<RingBuffer<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Starts one named thread per handler.
    pub fn start<H, I>(name: &str, ring: Arc<RingBuffer<T>>, handlers: I) -> Result<Self>
    where
        H: WorkHandler<T>,
        I: IntoIterator<Item = H>,
    {
        let mut workers = Vec::new();
        for (i, mut handler) in handlers.into_iter().enumerate() {
            let worker_ring = Arc::clone(&ring);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Some(event) = worker_ring.take() {
                        handler.on_event(event);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    ring.close();
                    return Err(RingError::Spawn(e));
                }
            }
        }
        if workers.is_empty() {
            return Err(RingError::NoWorkers);
        }
        debug!(pool = %name, workers = workers.len(), "Worker pool started");

        Ok(Self {
            name: name.to_string(),
            ring,
            workers: Mutex::new(workers),
        })
    }

    pub fn ring(&self) -> &Arc<RingBuffer<T>> {
        &self.ring
    }

    /// Closes the ring and waits for workers to drain it.
    pub fn shutdown(&self) {
        self.ring.close();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!(pool = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.ring.close();
    }
}

// ============================================================================
// Executor
// ============================================================================

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct JobRunner {
    pool: String,
}

impl WorkHandler<Job> for JobRunner {
    fn on_event(&mut self, job: Job) {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(pool = %self.pool, "Job panicked");
        }
    }
}

/// Fixed pool of threads running boxed jobs off a ring.
pub struct Executor {
    pool: WorkerPool<Job>,
}

impl Executor {
    pub fn start(name: &str, threads: usize, ring: &RingConfig) -> Result<Self> {
        let ring = Arc::new(RingBuffer::from_config(ring, ProducerMode::Multi)?);
        let runners = (0..threads).map(|_| JobRunner {
            pool: name.to_string(),
        });
        Ok(Self {
            pool: WorkerPool::start(name, ring, runners)?,
        })
    }

    /// Queues `job` for a worker thread.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.ring().publish(Box::new(job))
    }

    /// Runs every queued job, then stops the workers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
