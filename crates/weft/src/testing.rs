//! Deterministic test harness around the scheduler.
//!
//! Wraps a small scheduler with a [`ControlledClock`] so tests drive timer
//! expiry explicitly, plus polling helpers to wait for asynchronous
//! effects without sleeping for fixed amounts.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::actor::{Actor, ActorControl};
use crate::clock::ControlledClock;
use crate::error::SchedulerResult;
use crate::future::CompletableActorFuture;
use crate::scheduler::{ActorHandle, ActorScheduler};

struct UtilityActor;
impl Actor for UtilityActor {
    fn name(&self) -> &str {
        "test-utility"
    }
}

/// A running single-CPU-worker scheduler with a manually advanced clock.
pub struct TestScheduler {
    scheduler: ActorScheduler,
    clock: Arc<ControlledClock>,
    utility: ActorHandle,
}

impl TestScheduler {
    pub fn new() -> SchedulerResult<Self> {
        let clock = Arc::new(ControlledClock::new());
        let scheduler = ActorScheduler::builder()
            .name("weft-test")
            .cpu_threads(1)
            .io_threads(1)
            .priority_quotas(vec![1.0])
            .clock(Arc::clone(&clock) as _)
            .worker_shutdown_timeout(Duration::from_secs(5))
            .blocking_shutdown_timeout(Duration::from_secs(5))
            .build()?;
        scheduler.start()?;
        let utility = scheduler.submit(UtilityActor)?;
        Ok(Self {
            scheduler,
            clock,
            utility,
        })
    }

    pub fn scheduler(&self) -> &ActorScheduler {
        &self.scheduler
    }

    pub fn clock(&self) -> &Arc<ControlledClock> {
        &self.clock
    }

    pub fn submit(&self, actor: impl Actor) -> SchedulerResult<ActorHandle> {
        self.scheduler.submit(actor)
    }

    /// Runs `f` on the internal utility actor and returns its result
    /// future.
    pub fn call<T, F>(&self, f: F) -> CompletableActorFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&ActorControl) -> T + Send + 'static,
    {
        self.utility.control().call(f)
    }

    /// Advances the controlled clock; due timers fire on the workers'
    /// next poll.
    pub fn advance_time(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Stops the scheduler, blocking until teardown completed.
    pub fn stop(self) -> SchedulerResult<()> {
        self.scheduler.stop().block_on()
    }
}

/// Polls `predicate` until it holds or `timeout` elapses. Returns whether
/// the predicate became true.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    predicate()
}
