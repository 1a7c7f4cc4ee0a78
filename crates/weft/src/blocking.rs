//! Cached thread pool for blocking work.
//!
//! Threads are spawned on demand when a task arrives and no thread is
//! idle, and retire themselves after an idle timeout. The pool is
//! unbounded: blocking actions must never be starved by each other, only
//! isolated from the worker threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

pub(crate) type BlockingTask = Box<dyn FnOnce() + Send>;

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) struct BlockingPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    name: String,
    queue: SegQueue<BlockingTask>,
    idle: AtomicUsize,
    live: AtomicUsize,
    next_id: AtomicUsize,
    completed: AtomicU64,
    shutdown: AtomicBool,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl BlockingPool {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                queue: SegQueue::new(),
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                sleep_lock: Mutex::new(()),
                wakeup: Condvar::new(),
                handles: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Enqueues a blocking task, spawning a thread when none is idle.
    /// Tasks submitted after shutdown are dropped with a warning.
    pub(crate) fn submit(&self, task: BlockingTask) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            warn!(pool = %self.shared.name, "blocking task submitted after shutdown, dropping");
            return;
        }
        self.shared.queue.push(task);
        if self.shared.idle.load(Ordering::Acquire) == 0 {
            self.spawn_worker();
        } else {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wakeup.notify_one();
        }
    }

    fn spawn_worker(&self) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        shared.live.fetch_add(1, Ordering::AcqRel);
        let result = thread::Builder::new()
            .name(format!("{}-blocking-{}", self.shared.name, id))
            .spawn(move || worker_loop(shared));
        match result {
            Ok(handle) => self.shared.handles.lock().push(handle),
            Err(e) => {
                self.shared.live.fetch_sub(1, Ordering::AcqRel);
                error!(error = %e, "failed to spawn blocking worker");
            }
        }
    }

    pub(crate) fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    pub(crate) fn live_threads(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Stops accepting work, lets workers drain the queue and joins them,
    /// giving up after `timeout`. Returns true on a clean drain.
    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wakeup.notify_all();
        }
        let deadline = Instant::now() + timeout;
        let handles: Vec<_> = self.shared.handles.lock().drain(..).collect();
        let mut clean = true;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                clean = false;
            }
        }
        if !clean {
            warn!(
                pool = %self.shared.name,
                "blocking pool shutdown timed out with work outstanding"
            );
        }
        clean
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        if let Some(task) = shared.queue.pop() {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                debug!(pool = %shared.name, "blocking task panicked");
            }
            shared.completed.fetch_add(1, Ordering::AcqRel);
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared.idle.fetch_add(1, Ordering::AcqRel);
        let timed_out = {
            let mut guard = shared.sleep_lock.lock();
            // Re-check under the lock so a submit between the pop and here
            // cannot be missed.
            if !shared.queue.is_empty() || shared.shutdown.load(Ordering::Acquire) {
                false
            } else {
                shared
                    .wakeup
                    .wait_for(&mut guard, IDLE_TIMEOUT)
                    .timed_out()
            }
        };
        shared.idle.fetch_sub(1, Ordering::AcqRel);
        if timed_out && shared.queue.is_empty() {
            // Idle retirement.
            break;
        }
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
}
