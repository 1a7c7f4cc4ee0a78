//! Worker threads and the thread groups that own them.
//!
//! A thread group is a fixed set of workers sharing a multi-level task
//! queue, a timer service and a scheduling policy kind. Workers loop:
//! fire due timers, pull a task through the policy, execute one dispatch
//! cycle, back off when idle.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::clock::ActorClock;
use crate::group::MultiLevelGroup;
use crate::policy::{FifoPolicy, PriorityPolicy, SchedulingPolicy, TaskSource};
use crate::task::ActorTask;
use crate::wheel::TimerService;

/// Creates the scheduler's threads; replaceable for tests and embedders
/// that need custom thread setup.
pub trait ThreadFactory: Send + Sync {
    fn spawn(
        &self,
        name: String,
        f: Box<dyn FnOnce() + Send>,
    ) -> io::Result<thread::JoinHandle<()>>;
}

pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn spawn(
        &self,
        name: String,
        f: Box<dyn FnOnce() + Send>,
    ) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new().name(name).spawn(f)
    }
}

pub(crate) enum GroupKind {
    /// Priority-arbitrated workers; one queue level per quota entry.
    Cpu { quotas: Vec<f64> },
    /// Single-level FIFO workers for IO-heavy actors.
    Io,
}

pub(crate) struct ThreadGroup {
    name: String,
    kind: GroupKind,
    tasks: MultiLevelGroup,
    timers: Arc<TimerService>,
    clock: Arc<dyn ActorClock>,
    next_worker: AtomicUsize,
    worker_count: usize,
    shutdown: AtomicBool,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadGroup {
    pub(crate) fn new(
        name: String,
        worker_count: usize,
        kind: GroupKind,
        clock: Arc<dyn ActorClock>,
        ticks_per_wheel: usize,
    ) -> Arc<Self> {
        let levels = match &kind {
            GroupKind::Cpu { quotas } => quotas.len(),
            GroupKind::Io => 1,
        };
        let timers = Arc::new(TimerService::new(clock.millis(), ticks_per_wheel));
        Arc::new(Self {
            name,
            kind,
            tasks: MultiLevelGroup::new(levels, worker_count),
            timers,
            clock,
            next_worker: AtomicUsize::new(0),
            worker_count,
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn timer_service(&self) -> &Arc<TimerService> {
        &self.timers
    }

    pub(crate) fn clock(&self) -> &Arc<dyn ActorClock> {
        &self.clock
    }

    /// Routes a runnable task to a worker queue, round-robin. CPU groups
    /// map the task priority to a queue level, IO groups have one level.
    pub(crate) fn submit_task(&self, task: Arc<ActorTask>) {
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.worker_count.max(1);
        let level = match &self.kind {
            GroupKind::Cpu { .. } => task.priority() as usize,
            GroupKind::Io => 0,
        };
        self.tasks.submit(task, level, worker);
    }

    pub(crate) fn start(self: &Arc<Self>, factory: &Arc<dyn ThreadFactory>) {
        for worker_id in 0..self.worker_count {
            let group = Arc::clone(self);
            let thread_name = format!("{}-{}", self.name, worker_id);
            let result = factory.spawn(
                thread_name,
                Box::new(move || {
                    let policy = group.make_policy(worker_id);
                    Worker {
                        group,
                        policy,
                    }
                    .run();
                }),
            );
            match result {
                Ok(handle) => self.handles.lock().push(handle),
                Err(e) => error!(error = %e, group = %self.name, "failed to spawn worker"),
            }
        }
    }

    fn make_policy(self: &Arc<Self>, worker_id: usize) -> Box<dyn SchedulingPolicy> {
        let group = Arc::clone(self);
        let source: TaskSource = Box::new(move |level| group.tasks.next_task(level, worker_id));
        match &self.kind {
            GroupKind::Cpu { quotas } => Box::new(PriorityPolicy::new(quotas.clone(), source)),
            GroupKind::Io => Box::new(FifoPolicy::new(source)),
        }
    }

    /// Signals workers to stop after their current dispatch cycle and joins
    /// them. Returns true when every worker exited within the timeout.
    pub(crate) fn close(&self, timeout: Duration) -> bool {
        self.shutdown.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
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
            debug!(group = %self.name, "worker join timed out");
        }
        clean
    }
}

struct Worker {
    group: Arc<ThreadGroup>,
    policy: Box<dyn SchedulingPolicy>,
}

impl Worker {
    fn run(mut self) {
        trace!("worker started");
        let mut idle = IdleStrategy::new();
        while !self.group.shutdown.load(Ordering::Acquire) {
            self.group.timers.process_expired(&*self.group.clock);
            match self.policy.next_task() {
                Some(task) => {
                    idle.reset();
                    task.execute();
                }
                None => {
                    if self.group.tasks.has_linked_nodes() {
                        // Stale or contended nodes; retry without parking.
                        idle.reset();
                    }
                    idle.idle();
                }
            }
        }
        trace!("worker stopped");
    }
}

/// Backoff between failed task pulls: spin, then yield, then short parks.
/// The park is bounded so timers fed by a controlled clock are still
/// polled promptly.
struct IdleStrategy {
    count: u32,
}

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 128;
const PARK_INTERVAL: Duration = Duration::from_micros(100);

impl IdleStrategy {
    fn new() -> Self {
        Self { count: 0 }
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn idle(&mut self) {
        if self.count < SPIN_LIMIT {
            std::hint::spin_loop();
        } else if self.count < YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(PARK_INTERVAL);
        }
        self.count = self.count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorControl};
    use crate::clock::SystemClock;
    use std::sync::atomic::AtomicU32;

    struct Counting {
        counter: Arc<AtomicU32>,
    }

    impl Actor for Counting {
        fn on_actor_started(&mut self, _ctl: &ActorControl) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_group_runs_submitted_task() {
        let clock: Arc<dyn ActorClock> = Arc::new(SystemClock::new());
        let group = ThreadGroup::new(
            "test-cpu".to_string(),
            2,
            GroupKind::Cpu {
                quotas: vec![1.0],
            },
            clock,
            32,
        );
        let factory: Arc<dyn ThreadFactory> = Arc::new(DefaultThreadFactory);
        group.start(&factory);

        let counter = Arc::new(AtomicU32::new(0));
        let task = ActorTask::new(
            Box::new(Counting {
                counter: Arc::clone(&counter),
            }),
            0,
        );
        let started = task.activate();
        group.submit_task(task);

        assert!(started.block_on_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(group.close(Duration::from_secs(5)));
    }

    #[test]
    fn test_idle_group_closes_promptly() {
        let clock: Arc<dyn ActorClock> = Arc::new(SystemClock::new());
        let group = ThreadGroup::new("test-io".to_string(), 1, GroupKind::Io, clock, 32);
        let factory: Arc<dyn ThreadFactory> = Arc::new(DefaultThreadFactory);
        group.start(&factory);
        assert!(group.close(Duration::from_secs(5)));
    }
}
