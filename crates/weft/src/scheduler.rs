//! Scheduler façade: builder, lifecycle and actor submission.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::actor::{Actor, ActorControl};
use crate::clock::{ActorClock, SystemClock};
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::{Executor, SchedulingHints};
use crate::future::CompletableActorFuture;
use crate::task::{ActorTask, LifecyclePhase};
use crate::wheel::DEFAULT_TICKS_PER_WHEEL;
use crate::worker::{DefaultThreadFactory, ThreadFactory};

const DEFAULT_IO_THREADS: usize = 2;
const DEFAULT_PRIORITY_QUOTAS: [f64; 3] = [0.60, 0.30, 0.10];
const DEFAULT_BLOCKING_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const QUOTA_SUM_TOLERANCE: f64 = 1e-6;

#[repr(u8)]
enum SchedulerState {
    New = 0,
    Running = 1,
    Terminating = 2,
    Terminated = 3,
}

/// Configures and creates an [`ActorScheduler`].
pub struct ActorSchedulerBuilder {
    name: String,
    cpu_thread_count: usize,
    io_thread_count: usize,
    priority_quotas: Vec<f64>,
    blocking_shutdown_timeout: Duration,
    worker_shutdown_timeout: Duration,
    ticks_per_wheel: usize,
    clock: Option<Arc<dyn ActorClock>>,
    thread_factory: Option<Arc<dyn ThreadFactory>>,
}

impl Default for ActorSchedulerBuilder {
    fn default() -> Self {
        Self {
            name: "weft".to_string(),
            cpu_thread_count: num_cpus::get().saturating_sub(2).max(1),
            io_thread_count: DEFAULT_IO_THREADS,
            priority_quotas: DEFAULT_PRIORITY_QUOTAS.to_vec(),
            blocking_shutdown_timeout: DEFAULT_BLOCKING_SHUTDOWN_TIMEOUT,
            worker_shutdown_timeout: DEFAULT_WORKER_SHUTDOWN_TIMEOUT,
            ticks_per_wheel: DEFAULT_TICKS_PER_WHEEL,
            clock: None,
            thread_factory: None,
        }
    }
}

impl ActorSchedulerBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn cpu_threads(mut self, count: usize) -> Self {
        self.cpu_thread_count = count;
        self
    }

    pub fn io_threads(mut self, count: usize) -> Self {
        self.io_thread_count = count;
        self
    }

    /// One entry per priority level; entries must be positive and sum
    /// to 1.0. A task submitted with `CpuBound { priority: n }` runs on
    /// level `n`.
    pub fn priority_quotas(mut self, quotas: Vec<f64>) -> Self {
        self.priority_quotas = quotas;
        self
    }

    pub fn blocking_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_shutdown_timeout = timeout;
        self
    }

    pub fn worker_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.worker_shutdown_timeout = timeout;
        self
    }

    /// Timer wheel size; must be a power of two.
    pub fn ticks_per_wheel(mut self, ticks: usize) -> Self {
        self.ticks_per_wheel = ticks;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn ActorClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Self {
        self.thread_factory = Some(factory);
        self
    }

    pub fn build(self) -> SchedulerResult<ActorScheduler> {
        if self.cpu_thread_count == 0 {
            return Err(SchedulerError::InvalidConfig(
                "cpu thread count must be at least 1".to_string(),
            ));
        }
        if self.io_thread_count == 0 {
            return Err(SchedulerError::InvalidConfig(
                "io thread count must be at least 1".to_string(),
            ));
        }
        if self.priority_quotas.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "at least one priority quota is required".to_string(),
            ));
        }
        if self.priority_quotas.iter().any(|q| *q <= 0.0) {
            return Err(SchedulerError::InvalidConfig(
                "priority quotas must be positive".to_string(),
            ));
        }
        let sum: f64 = self.priority_quotas.iter().sum();
        if (sum - 1.0).abs() > QUOTA_SUM_TOLERANCE {
            return Err(SchedulerError::InvalidConfig(format!(
                "priority quotas must sum to 1.0, got {sum}"
            )));
        }
        if !self.ticks_per_wheel.is_power_of_two() {
            return Err(SchedulerError::InvalidConfig(format!(
                "ticks per wheel must be a power of two, got {}",
                self.ticks_per_wheel
            )));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn ActorClock>);
        let factory = self
            .thread_factory
            .unwrap_or_else(|| Arc::new(DefaultThreadFactory) as Arc<dyn ThreadFactory>);
        let level_count = self.priority_quotas.len();
        let executor = Executor::new(
            &self.name,
            self.cpu_thread_count,
            self.io_thread_count,
            self.priority_quotas,
            clock,
            self.ticks_per_wheel,
        );
        Ok(ActorScheduler {
            name: self.name,
            state: Arc::new(AtomicU8::new(SchedulerState::New as u8)),
            executor,
            factory,
            level_count,
            worker_shutdown_timeout: self.worker_shutdown_timeout,
            blocking_shutdown_timeout: self.blocking_shutdown_timeout,
        })
    }
}

/// The scheduler: a fixed CPU worker group, a fixed IO worker group and a
/// cached blocking pool, multiplexing any number of actors.
pub struct ActorScheduler {
    name: String,
    state: Arc<AtomicU8>,
    executor: Arc<Executor>,
    factory: Arc<dyn ThreadFactory>,
    level_count: usize,
    worker_shutdown_timeout: Duration,
    blocking_shutdown_timeout: Duration,
}

impl ActorScheduler {
    pub fn builder() -> ActorSchedulerBuilder {
        ActorSchedulerBuilder::default()
    }

    /// Starts the worker threads. Valid exactly once.
    pub fn start(&self) -> SchedulerResult<()> {
        self.state
            .compare_exchange(
                SchedulerState::New as u8,
                SchedulerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| {
                SchedulerError::InvalidState("scheduler already started".to_string())
            })?;
        self.executor.start(&self.factory);
        info!(scheduler = %self.name, "scheduler started");
        Ok(())
    }

    /// Submits an actor to the CPU group at the default priority.
    pub fn submit(&self, actor: impl Actor) -> SchedulerResult<ActorHandle> {
        self.submit_with_hints(actor, SchedulingHints::default())
    }

    /// Submits an actor with an explicit placement hint. The actor starts
    /// immediately; the handle's start future resolves once it reached the
    /// started phase.
    pub fn submit_with_hints(
        &self,
        actor: impl Actor,
        hints: SchedulingHints,
    ) -> SchedulerResult<ActorHandle> {
        if self.state.load(Ordering::Acquire) != SchedulerState::Running as u8 {
            return Err(SchedulerError::InvalidState(
                "scheduler is not running".to_string(),
            ));
        }
        let priority = match hints {
            SchedulingHints::CpuBound { priority } => {
                if priority as usize >= self.level_count {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "priority {priority} out of range, {} levels configured",
                        self.level_count
                    )));
                }
                priority
            }
            SchedulingHints::IoBound => 0,
        };
        let task = ActorTask::new(Box::new(actor), priority);
        let started = self.executor.submit(Arc::clone(&task), hints);
        Ok(ActorHandle { task, started })
    }

    /// Initiates shutdown: workers stop pulling tasks, then the blocking
    /// pool drains. The returned future resolves when teardown finished.
    /// Valid from the new state as well; a never-started scheduler tears
    /// down with no workers to join.
    pub fn stop(&self) -> CompletableActorFuture<()> {
        let from_running = self
            .state
            .compare_exchange(
                SchedulerState::Running as u8,
                SchedulerState::Terminating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !from_running
            && self
                .state
                .compare_exchange(
                    SchedulerState::New as u8,
                    SchedulerState::Terminating as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return CompletableActorFuture::failed(SchedulerError::InvalidState(
                "scheduler is already stopping or stopped".to_string(),
            ));
        }
        let fut = CompletableActorFuture::new();
        let done = fut.clone();
        let executor = Arc::clone(&self.executor);
        let worker_timeout = self.worker_shutdown_timeout;
        let blocking_timeout = self.blocking_shutdown_timeout;
        let state = Arc::clone(&self.state);
        let spawn_result = thread::Builder::new()
            .name(format!("{}-shutdown", self.name))
            .spawn(move || {
                executor.close(worker_timeout, blocking_timeout);
                state.store(SchedulerState::Terminated as u8, Ordering::Release);
                done.complete(());
            });
        if let Err(e) = spawn_result {
            error!(error = %e, "failed to spawn shutdown thread, closing inline");
            self.executor
                .close(self.worker_shutdown_timeout, self.blocking_shutdown_timeout);
            self.state
                .store(SchedulerState::Terminated as u8, Ordering::Release);
            fut.complete(());
        }
        fut
    }
}

impl Drop for ActorScheduler {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == SchedulerState::Running as u8 {
            let fut = self.stop();
            let grace = self.worker_shutdown_timeout + self.blocking_shutdown_timeout;
            let _ = fut.block_on_timeout(grace + Duration::from_secs(1));
        }
    }
}

/// Handle to one submitted actor.
pub struct ActorHandle {
    task: Arc<ActorTask>,
    started: CompletableActorFuture<()>,
}

impl ActorHandle {
    /// Resolves once the actor reached the started phase; fails with
    /// `StartupFailure` when the starting chain failed.
    pub fn started(&self) -> &CompletableActorFuture<()> {
        &self.started
    }

    /// Requests a graceful close; resolves once the actor is closed.
    pub fn close(&self) -> CompletableActorFuture<()> {
        let ctl = ActorControl::new(Arc::clone(&self.task));
        ctl.close()
    }

    /// Control surface for external submissions to this actor.
    pub fn control(&self) -> ActorControl {
        ActorControl::new(Arc::clone(&self.task))
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.task.phase()
    }
}
