//! Event Scheduling
//!
//! Every deferred or retried step of the GC pipeline is an [`Event`]. An
//! event that cannot make progress returns `false` and goes to the back of
//! the queue; nothing retries inline.
//!
//! ```text
//!   enqueue ──▶ [ crossbeam channel ] ──▶ worker N ── execute() ──┐
//!                      ▲                                          │
//!                      └────────────── false: re-enqueue ─────────┘
//! ```
//!
//! [`QueueScheduler`] runs the same contract on the calling thread, one
//! event at a time, for deterministic tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::ports::{Event, EventScheduler};
use crate::error::{Error, Result};

/// How long an idle worker sleeps before checking for shutdown.
const WORKER_POLL: Duration = Duration::from_millis(10);

/// Pause before re-enqueueing when the retried event is all there is.
const IDLE_REQUEUE_DELAY: Duration = Duration::from_micros(200);

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub enqueued: AtomicU64,
    pub executed: AtomicU64,
    pub requeued: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub enqueued: u64,
    pub executed: u64,
    pub requeued: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

struct Shared {
    tx: Sender<Box<dyn Event>>,
    shutdown: AtomicBool,
    /// Events queued or executing
    outstanding: Mutex<u64>,
    idle: Condvar,
    stats: SchedulerStats,
}

impl Shared {
    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// A fixed set of OS threads draining one shared queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(Error::Config("scheduler needs at least one worker".into()));
        }

        let (tx, rx) = channel::unbounded::<Box<dyn Event>>();
        let shared = Arc::new(Shared {
            tx,
            shutdown: AtomicBool::new(false),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            stats: SchedulerStats::default(),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let shared = Arc::clone(&shared);
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("stripeflow-worker-{}", index))
                .spawn(move || worker_loop(index, shared, rx))?;
            workers.push(handle);
        }

        info!("Scheduler started with {} workers", num_workers);
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    pub fn outstanding(&self) -> u64 {
        *self.shared.outstanding.lock()
    }

    /// Block until nothing is queued or executing. False on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            if self.shared.idle.wait_until(&mut outstanding, deadline).timed_out() {
                return *outstanding == 0;
            }
        }
        true
    }

    /// Stop the workers. Queued events are dropped.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("Scheduler worker panicked");
            }
        }
        info!("Scheduler stopped");
    }
}

impl EventScheduler for WorkerPool {
    fn enqueue(&self, event: Box<dyn Event>) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            warn!("Dropping {} enqueued after shutdown", event.name());
            return;
        }
        *self.shared.outstanding.lock() += 1;
        self.shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if self.shared.tx.send(event).is_err() {
            self.shared.finish_one();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, shared: Arc<Shared>, rx: Receiver<Box<dyn Event>>) {
    debug!("Worker {} running", index);
    while !shared.shutdown.load(Ordering::Acquire) {
        let mut event = match rx.recv_timeout(WORKER_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        shared.stats.executed.fetch_add(1, Ordering::Relaxed);
        if event.execute() {
            shared.finish_one();
            continue;
        }

        shared.stats.requeued.fetch_add(1, Ordering::Relaxed);
        if rx.is_empty() {
            thread::sleep(IDLE_REQUEUE_DELAY);
        } else {
            thread::yield_now();
        }
        if shared.tx.send(event).is_err() {
            shared.finish_one();
        }
    }
    debug!("Worker {} exiting", index);
}

// =============================================================================
// Queue Scheduler
// =============================================================================

/// Single-threaded scheduler driven explicitly by the caller.
#[derive(Default)]
pub struct QueueScheduler {
    queue: Mutex<VecDeque<Box<dyn Event>>>,
    stats: SchedulerStats,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Execute the event at the head of the queue. False if it was empty.
    pub fn run_once(&self) -> bool {
        let Some(mut event) = self.queue.lock().pop_front() else {
            return false;
        };
        self.stats.executed.fetch_add(1, Ordering::Relaxed);
        if !event.execute() {
            self.stats.requeued.fetch_add(1, Ordering::Relaxed);
            self.queue.lock().push_back(event);
        }
        true
    }

    /// Run until the queue drains or `max_steps` executions happened.
    /// Returns the number of executions.
    pub fn run_until_idle(&self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps && self.run_once() {
            steps += 1;
        }
        steps
    }
}

impl EventScheduler for QueueScheduler {
    fn enqueue(&self, event: Box<dyn Event>) {
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back(event);
    }
}
