//! Ties the CPU group, IO group and blocking pool together.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::blocking::BlockingPool;
use crate::clock::ActorClock;
use crate::future::CompletableActorFuture;
use crate::task::{ActorTask, TaskHandles};
use crate::worker::{GroupKind, ThreadFactory, ThreadGroup};

/// Placement hint given at submission time; the binding is permanent for
/// the task's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingHints {
    /// Run on the CPU group at the given priority (0 = highest-quota
    /// level index as configured).
    CpuBound { priority: u8 },
    /// Run on the IO group.
    IoBound,
}

impl Default for SchedulingHints {
    fn default() -> Self {
        Self::CpuBound { priority: 0 }
    }
}

pub(crate) struct Executor {
    cpu: Arc<ThreadGroup>,
    io: Arc<ThreadGroup>,
    blocking: Arc<BlockingPool>,
}

impl Executor {
    pub(crate) fn new(
        name: &str,
        cpu_threads: usize,
        io_threads: usize,
        quotas: Vec<f64>,
        clock: Arc<dyn ActorClock>,
        ticks_per_wheel: usize,
    ) -> Arc<Self> {
        let cpu = ThreadGroup::new(
            format!("{name}-cpu"),
            cpu_threads,
            GroupKind::Cpu { quotas },
            Arc::clone(&clock),
            ticks_per_wheel,
        );
        let io = ThreadGroup::new(
            format!("{name}-io"),
            io_threads,
            GroupKind::Io,
            clock,
            ticks_per_wheel,
        );
        Arc::new(Self {
            cpu,
            io,
            blocking: BlockingPool::new(name.to_string()),
        })
    }

    pub(crate) fn start(&self, factory: &Arc<dyn ThreadFactory>) {
        self.cpu.start(factory);
        self.io.start(factory);
    }

    pub(crate) fn blocking_pool(&self) -> &Arc<BlockingPool> {
        &self.blocking
    }

    /// Binds a task to its group per the hint, seeds its lifecycle and
    /// queues it for a first dispatch cycle.
    pub(crate) fn submit(
        self: &Arc<Self>,
        task: Arc<ActorTask>,
        hint: SchedulingHints,
    ) -> CompletableActorFuture<()> {
        let group = match hint {
            SchedulingHints::CpuBound { .. } => &self.cpu,
            SchedulingHints::IoBound => &self.io,
        };
        task.bind(TaskHandles {
            group: Arc::clone(group),
            executor: Arc::clone(self),
        });
        let started = task.activate();
        group.submit_task(task);
        started
    }

    /// Stops workers, then drains the blocking pool within its timeout.
    pub(crate) fn close(&self, worker_timeout: Duration, blocking_timeout: Duration) -> bool {
        let cpu_clean = self.cpu.close(worker_timeout);
        let io_clean = self.io.close(worker_timeout);
        let blocking_clean = self.blocking.shutdown(blocking_timeout);
        info!(
            cpu_clean,
            io_clean, blocking_clean, "executor shut down"
        );
        cpu_clean && io_clean && blocking_clean
    }
}
