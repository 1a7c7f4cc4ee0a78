//! The task: execution state of one actor.
//!
//! A task multiplexes every job of its actor onto whichever worker claimed
//! it, preserving single-writer semantics: at most one worker runs a task
//! at a time, arbitrated by a monotonically increasing state count. The
//! task also owns the lifecycle state machine
//! `STARTING -> STARTED -> CLOSE_REQUESTED -> CLOSING -> CLOSED`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::actor::{Actor, ActorControl};
use crate::error::{panic_message, SchedulerError};
use crate::executor::Executor;
use crate::future::CompletableActorFuture;
use crate::job::{Job, JobOutcome};
use crate::subscription::SubscriptionEntry;
use crate::worker::ThreadGroup;

/// Externally visible lifecycle phases, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecyclePhase {
    Starting = 0,
    Started = 1,
    CloseRequested = 2,
    Closing = 3,
    Closed = 4,
}

impl LifecyclePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Started,
            2 => Self::CloseRequested,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Queueing state, advanced by compare-and-swap so a task is enqueued at
/// most once however many wakeup sources fire concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SchedulingState {
    NotScheduled = 0,
    Queued = 1,
    Running = 2,
    Terminated = 3,
}

/// Scheduler services a task is bound to at submission time.
pub(crate) struct TaskHandles {
    pub(crate) group: Arc<ThreadGroup>,
    pub(crate) executor: Arc<Executor>,
}

enum SubmittedQueue {
    Open(VecDeque<Job>),
    Closed,
}

struct TaskInner {
    phase: LifecyclePhase,
    /// Jobs created from within the actor; never rejected while the task
    /// lives, drained before external work.
    fast_lane: VecDeque<Job>,
    subscriptions: Vec<Arc<SubscriptionEntry>>,
    started_future: Option<CompletableActorFuture<()>>,
    close_future: Option<CompletableActorFuture<()>>,
    close_requested: bool,
    /// Pending continuations registered during a non-started phase; the
    /// phase cannot advance while any are outstanding.
    phase_blockers: usize,
}

enum NextJob {
    Ready(Job),
    Idle,
    Terminate,
}

/// Work that must run after the inner lock is released: settling futures
/// and rejecting jobs may invoke continuations that re-enter the task.
#[derive(Default)]
struct DeferredWork {
    complete_started: Option<CompletableActorFuture<()>>,
    complete_closed: Option<CompletableActorFuture<()>>,
    fail_futures: Vec<(CompletableActorFuture<()>, SchedulerError)>,
    rejected: Vec<Job>,
    cancel_subscriptions: Vec<Arc<SubscriptionEntry>>,
    then_terminate: bool,
}

impl DeferredWork {
    fn is_empty(&self) -> bool {
        self.complete_started.is_none()
            && self.complete_closed.is_none()
            && self.fail_futures.is_empty()
            && self.rejected.is_empty()
            && self.cancel_subscriptions.is_empty()
            && !self.then_terminate
    }

    fn run(self) -> bool {
        for entry in self.cancel_subscriptions {
            entry.cancel();
        }
        for job in self.rejected {
            job.reject(SchedulerError::ActorClosed);
        }
        for (fut, err) in self.fail_futures {
            fut.fail(err);
        }
        if let Some(fut) = self.complete_started {
            fut.complete(());
        }
        if let Some(fut) = self.complete_closed {
            fut.complete(());
        }
        self.then_terminate
    }
}

pub(crate) struct ActorTask {
    priority: u8,
    /// Bumped on every successful claim; queue nodes carry the snapshot
    /// taken at append time.
    state_count: AtomicU64,
    scheduling_state: AtomicU8,
    /// Mirror of `inner.phase` readable without the lock.
    phase_hint: AtomicU8,
    done_requested: AtomicBool,
    yield_requested: AtomicBool,
    actor: Mutex<Box<dyn Actor>>,
    submitted: Mutex<SubmittedQueue>,
    inner: Mutex<TaskInner>,
    handles: OnceCell<TaskHandles>,
}

impl ActorTask {
    pub(crate) fn new(actor: Box<dyn Actor>, priority: u8) -> Arc<Self> {
        Arc::new(Self {
            priority,
            state_count: AtomicU64::new(0),
            scheduling_state: AtomicU8::new(SchedulingState::NotScheduled as u8),
            phase_hint: AtomicU8::new(LifecyclePhase::Starting as u8),
            done_requested: AtomicBool::new(false),
            yield_requested: AtomicBool::new(false),
            actor: Mutex::new(actor),
            submitted: Mutex::new(SubmittedQueue::Open(VecDeque::new())),
            inner: Mutex::new(TaskInner {
                phase: LifecyclePhase::Starting,
                fast_lane: VecDeque::new(),
                subscriptions: Vec::new(),
                started_future: None,
                close_future: None,
                close_requested: false,
                phase_blockers: 0,
            }),
            handles: OnceCell::new(),
        })
    }

    pub(crate) fn priority(&self) -> u8 {
        self.priority
    }

    pub(crate) fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.phase_hint.load(Ordering::Acquire))
    }

    pub(crate) fn state_count(&self) -> u64 {
        self.state_count.load(Ordering::Acquire)
    }

    /// Arbitrates exclusive execution: exactly one consumer holding the
    /// matching snapshot wins.
    pub(crate) fn claim(&self, snapshot: u64) -> bool {
        self.state_count
            .compare_exchange(snapshot, snapshot + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn scheduling_state(&self) -> SchedulingState {
        match self.scheduling_state.load(Ordering::Acquire) {
            0 => SchedulingState::NotScheduled,
            1 => SchedulingState::Queued,
            2 => SchedulingState::Running,
            _ => SchedulingState::Terminated,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.scheduling_state() == SchedulingState::Terminated
    }

    pub(crate) fn bind(&self, handles: TaskHandles) {
        if self.handles.set(handles).is_err() {
            warn!("task bound to a scheduler twice");
        }
    }

    pub(crate) fn handles(&self) -> Option<&TaskHandles> {
        self.handles.get()
    }

    /// Seeds the starting hook and marks the task queued. The caller must
    /// append it to its group afterwards.
    pub(crate) fn activate(self: &Arc<Self>) -> CompletableActorFuture<()> {
        let fut = CompletableActorFuture::new();
        {
            let mut inner = self.inner.lock();
            inner.started_future = Some(fut.clone());
            inner
                .fast_lane
                .push_back(Job::hook(LifecyclePhase::Starting));
        }
        self.scheduling_state
            .store(SchedulingState::Queued as u8, Ordering::Release);
        fut
    }

    /// Queues the task if it is idle. Every wakeup source funnels through
    /// here; the compare-and-swap guarantees at most one enqueue.
    pub(crate) fn try_wakeup(self: &Arc<Self>) -> bool {
        let Some(handles) = self.handles.get() else {
            return false;
        };
        loop {
            match self.scheduling_state() {
                SchedulingState::NotScheduled => {
                    if self
                        .scheduling_state
                        .compare_exchange(
                            SchedulingState::NotScheduled as u8,
                            SchedulingState::Queued as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        handles.group.submit_task(Arc::clone(self));
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// External job submission. Accepted while the actor is starting or
    /// started; rejected once closing has begun.
    pub(crate) fn submit(self: &Arc<Self>, job: Job) {
        {
            let mut submitted = self.submitted.lock();
            match &mut *submitted {
                SubmittedQueue::Open(queue) => queue.push_back(job),
                SubmittedQueue::Closed => {
                    drop(submitted);
                    job.reject(SchedulerError::ActorClosed);
                    return;
                }
            }
        }
        self.try_wakeup();
    }

    /// Internal job submission from within the actor's own execution.
    /// Rejected once the task terminated; a job queued on a dead task
    /// would otherwise vanish silently.
    pub(crate) fn enqueue_fast(&self, job: Job) {
        let mut inner = self.inner.lock();
        if self.is_terminated() {
            drop(inner);
            job.reject(SchedulerError::ActorClosed);
            return;
        }
        inner.fast_lane.push_back(job);
    }

    /// Registers a continuation-carrying job from a future callback, which
    /// may fire on any thread.
    pub(crate) fn submit_continuation(self: &Arc<Self>, job: Job, phase_blocking: bool) {
        {
            let mut inner = self.inner.lock();
            if phase_blocking {
                inner.phase_blockers = inner.phase_blockers.saturating_sub(1);
            }
            if self.is_terminated() {
                drop(inner);
                job.reject(SchedulerError::ActorClosed);
                return;
            }
            inner.fast_lane.push_back(job);
        }
        self.try_wakeup();
    }

    /// Marks a continuation registered during a non-started phase; the
    /// current phase cannot complete until it is queued.
    pub(crate) fn begin_phase_blocker(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase == LifecyclePhase::Started {
            false
        } else {
            inner.phase_blockers += 1;
            true
        }
    }

    pub(crate) fn register_subscription(&self, entry: Arc<SubscriptionEntry>) {
        self.inner.lock().subscriptions.push(entry);
    }

    /// Requests a graceful close. Idempotent; every caller observes the
    /// same close future.
    pub(crate) fn request_close(self: &Arc<Self>) -> CompletableActorFuture<()> {
        let fut = {
            let mut inner = self.inner.lock();
            inner.close_requested = true;
            inner
                .close_future
                .get_or_insert_with(CompletableActorFuture::new)
                .clone()
        };
        self.try_wakeup();
        fut
    }

    pub(crate) fn request_done(&self) {
        self.done_requested.store(true, Ordering::Release);
    }

    pub(crate) fn done_requested(&self) -> bool {
        self.done_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_yield(&self) {
        self.yield_requested.store(true, Ordering::Release);
    }

    pub(crate) fn invoke_hook(&self, phase: LifecyclePhase, ctl: &ActorControl) {
        let mut actor = self.actor.lock();
        match phase {
            LifecyclePhase::Starting => actor.on_actor_starting(ctl),
            LifecyclePhase::Started => actor.on_actor_started(ctl),
            LifecyclePhase::CloseRequested => actor.on_actor_close_requested(ctl),
            LifecyclePhase::Closing => actor.on_actor_closing(ctl),
            LifecyclePhase::Closed => actor.on_actor_closed(ctl),
        }
    }

    /// One dispatch cycle: runs jobs until the task idles, yields or
    /// terminates. Called by the worker that claimed the task.
    pub(crate) fn execute(self: &Arc<Self>) {
        self.scheduling_state
            .store(SchedulingState::Running as u8, Ordering::Release);
        let ctl = ActorControl::new(Arc::clone(self));
        loop {
            let mut job = match self.next_job() {
                NextJob::Ready(job) => job,
                NextJob::Idle => break,
                NextJob::Terminate => {
                    trace!("task terminated");
                    self.scheduling_state
                        .store(SchedulingState::Terminated as u8, Ordering::Release);
                    return;
                }
            };
            self.done_requested.store(false, Ordering::Release);

            let result = catch_unwind(AssertUnwindSafe(|| job.execute(&ctl, self)));
            match result {
                Ok(Ok(JobOutcome::Done)) => {
                    if let Some(entry) = job.entry() {
                        entry.job_completed();
                    }
                }
                Ok(Ok(JobOutcome::Requeue)) => {
                    self.inner.lock().fast_lane.push_back(job);
                    // Long-running work shares the worker between rounds.
                    self.yield_requested.store(true, Ordering::Release);
                }
                Ok(Err(err)) => {
                    if let Some(entry) = job.entry() {
                        entry.job_completed();
                    }
                    job.notify_failure(&err);
                    self.on_job_failure(err);
                }
                Err(payload) => {
                    let err = self.failure_for_phase(panic_message(payload));
                    if let Some(entry) = job.entry() {
                        entry.job_completed();
                    }
                    job.notify_failure(&err);
                    self.on_job_failure(err);
                }
            }
            if self.yield_requested.swap(false, Ordering::AcqRel) {
                break;
            }
        }
        self.on_cycle_completed();
    }

    /// Pulls the next runnable job, advancing lifecycle phases when their
    /// job chains have drained.
    fn next_job(self: &Arc<Self>) -> NextJob {
        loop {
            let mut deferred = DeferredWork::default();
            let step = {
                let mut inner = self.inner.lock();
                self.step(&mut inner, &mut deferred)
            };
            let terminate = deferred.run();
            if terminate {
                return NextJob::Terminate;
            }
            match step {
                Some(next) => return next,
                None => continue,
            }
        }
    }

    /// One step under the inner lock. Returns `None` to loop again after
    /// deferred work ran.
    fn step(self: &Arc<Self>, inner: &mut TaskInner, deferred: &mut DeferredWork) -> Option<NextJob> {
        loop {
            self.enqueue_triggered_subscriptions(inner);
            if inner.phase == LifecyclePhase::Started && !inner.close_requested {
                self.drain_submitted(inner);
            }
            if let Some(job) = inner.fast_lane.pop_front() {
                return Some(NextJob::Ready(job));
            }
            match inner.phase {
                LifecyclePhase::Starting => {
                    if inner.phase_blockers > 0 {
                        return Some(NextJob::Idle);
                    }
                    self.set_phase(inner, LifecyclePhase::Started);
                    inner
                        .fast_lane
                        .push_back(Job::hook(LifecyclePhase::Started));
                    deferred.complete_started = inner.started_future.take();
                    if !deferred.is_empty() {
                        return None;
                    }
                }
                LifecyclePhase::Started => {
                    if !inner.close_requested {
                        return Some(NextJob::Idle);
                    }
                    self.set_phase(inner, LifecyclePhase::CloseRequested);
                    inner
                        .fast_lane
                        .push_back(Job::hook(LifecyclePhase::CloseRequested));
                    deferred.rejected.append(&mut self.close_submitted_queue());
                    if !deferred.is_empty() {
                        return None;
                    }
                }
                LifecyclePhase::CloseRequested => {
                    if inner.phase_blockers > 0 {
                        return Some(NextJob::Idle);
                    }
                    self.set_phase(inner, LifecyclePhase::Closing);
                    inner.fast_lane.push_back(Job::hook(LifecyclePhase::Closing));
                }
                LifecyclePhase::Closing => {
                    if inner.phase_blockers > 0 {
                        return Some(NextJob::Idle);
                    }
                    self.set_phase(inner, LifecyclePhase::Closed);
                    inner.fast_lane.push_back(Job::hook(LifecyclePhase::Closed));
                }
                LifecyclePhase::Closed => {
                    deferred.complete_closed = inner.close_future.take();
                    deferred
                        .cancel_subscriptions
                        .append(&mut inner.subscriptions);
                    deferred.rejected.append(&mut self.close_submitted_queue());
                    deferred.then_terminate = true;
                    return None;
                }
            }
        }
    }

    fn set_phase(&self, inner: &mut TaskInner, phase: LifecyclePhase) {
        trace!(from = ?inner.phase, to = ?phase, "phase transition");
        inner.phase = phase;
        self.phase_hint.store(phase as u8, Ordering::Release);
    }

    fn enqueue_triggered_subscriptions(&self, inner: &mut TaskInner) {
        if inner.phase > LifecyclePhase::Started || inner.close_requested {
            return;
        }
        let TaskInner {
            ref mut subscriptions,
            ref mut fast_lane,
            ..
        } = *inner;
        subscriptions.retain(|entry| !entry.is_cancelled());
        for entry in subscriptions.iter() {
            if entry.pollable() {
                entry.mark_queued();
                fast_lane.push_back(Job::subscription(Arc::clone(entry)));
            }
        }
    }

    fn drain_submitted(&self, inner: &mut TaskInner) {
        let mut submitted = self.submitted.lock();
        if let SubmittedQueue::Open(queue) = &mut *submitted {
            inner.fast_lane.extend(queue.drain(..));
        }
    }

    /// Swaps the external queue to rejecting mode; pending jobs are
    /// returned for rejection outside the lock.
    fn close_submitted_queue(&self) -> Vec<Job> {
        let mut submitted = self.submitted.lock();
        match std::mem::replace(&mut *submitted, SubmittedQueue::Closed) {
            SubmittedQueue::Open(queue) => queue.into_iter().collect(),
            SubmittedQueue::Closed => Vec::new(),
        }
    }

    fn failure_for_phase(&self, message: String) -> SchedulerError {
        match self.phase() {
            LifecyclePhase::Starting => SchedulerError::StartupFailure(message),
            LifecyclePhase::Started => SchedulerError::JobFailure(message),
            _ => SchedulerError::ClosingFailure(message),
        }
    }

    /// Phase-sensitive failure handling: startup and closing failures
    /// short-circuit the lifecycle, steady-state failures are reported and
    /// the task keeps going.
    fn on_job_failure(self: &Arc<Self>, err: SchedulerError) {
        let mut deferred = DeferredWork::default();
        {
            let mut inner = self.inner.lock();
            match inner.phase {
                LifecyclePhase::Starting => {
                    error!(error = %err, "actor failed while starting");
                    inner.fast_lane.clear();
                    let fut = inner.started_future.take();
                    self.set_phase(&mut inner, LifecyclePhase::Closed);
                    if let Some(fut) = fut {
                        let failure = match err {
                            SchedulerError::StartupFailure(_) => err,
                            other => SchedulerError::StartupFailure(other.to_string()),
                        };
                        deferred.fail_futures.push((fut, failure));
                    }
                }
                LifecyclePhase::Started => {
                    error!(error = %err, "job failed, actor continues");
                }
                LifecyclePhase::CloseRequested | LifecyclePhase::Closing => {
                    error!(error = %err, "actor failed while closing");
                    inner.fast_lane.clear();
                    let fut = inner.close_future.take();
                    self.set_phase(&mut inner, LifecyclePhase::Closed);
                    if let Some(fut) = fut {
                        let failure = match err {
                            SchedulerError::ClosingFailure(_) => err,
                            other => SchedulerError::ClosingFailure(other.to_string()),
                        };
                        deferred.fail_futures.push((fut, failure));
                    }
                }
                LifecyclePhase::Closed => {
                    error!(error = %err, "job failed during teardown");
                }
            }
        }
        deferred.run();
    }

    /// Idle protocol: publish not-scheduled, then re-check for work that
    /// raced in, waking up again if so.
    fn on_cycle_completed(self: &Arc<Self>) {
        if !self.inner.lock().fast_lane.is_empty() {
            self.scheduling_state
                .store(SchedulingState::Queued as u8, Ordering::Release);
            if let Some(handles) = self.handles.get() {
                handles.group.submit_task(Arc::clone(self));
            }
            return;
        }
        self.scheduling_state
            .store(SchedulingState::NotScheduled as u8, Ordering::Release);
        if self.has_pending_work() {
            self.try_wakeup();
        }
    }

    fn has_pending_work(&self) -> bool {
        let (phase, close_requested) = {
            let inner = self.inner.lock();
            if !inner.fast_lane.is_empty() {
                return true;
            }
            if inner.phase <= LifecyclePhase::Started
                && !inner.close_requested
                && inner.subscriptions.iter().any(|entry| entry.pollable())
            {
                return true;
            }
            (inner.phase, inner.close_requested)
        };
        if phase == LifecyclePhase::Started {
            if close_requested {
                return true;
            }
            if let SubmittedQueue::Open(queue) = &*self.submitted.lock() {
                if !queue.is_empty() {
                    return true;
                }
            }
        }
        false
    }
}
