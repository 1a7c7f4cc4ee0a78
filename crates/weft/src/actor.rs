//! The actor abstraction and its control surface.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::SchedulerResult;
use crate::future::CompletableActorFuture;
use crate::job::Job;
use crate::subscription::{
    ActorCondition, BlockingPollSubscription, ChannelConsumerState, ConditionState,
    ConsumableChannel, SubscriptionEntry, SubscriptionState, TimerHandle, TimerSubscription,
};
use crate::task::{ActorTask, LifecyclePhase};

/// A unit of single-threaded mutable state multiplexed onto the scheduler.
///
/// All hooks and jobs of one actor run mutually exclusive, so implementors
/// never need internal locking for state touched only from actor context.
/// Hooks default to no-ops; override the ones the actor cares about.
pub trait Actor: Send + 'static {
    /// Diagnostic name used in log output.
    fn name(&self) -> &str {
        "actor"
    }

    /// First job of the actor; runs before any external work is accepted.
    fn on_actor_starting(&mut self, _ctl: &ActorControl) {}

    /// Runs once the starting chain completed and the start future resolved.
    fn on_actor_started(&mut self, _ctl: &ActorControl) {}

    /// Close was requested; external submissions are already rejected.
    fn on_actor_close_requested(&mut self, _ctl: &ActorControl) {}

    fn on_actor_closing(&mut self, _ctl: &ActorControl) {}

    /// Last job of the actor before the task terminates.
    fn on_actor_closed(&mut self, _ctl: &ActorControl) {}
}

/// Per-task control surface handed to every job and hook.
///
/// Cloneable and cheap; clones address the same task. Submission methods
/// are safe from any thread, but `done` and `yield_now` only make sense
/// from within a running job.
#[derive(Clone)]
pub struct ActorControl {
    task: Arc<ActorTask>,
}

/// Placeholder state for operations requested on an unbound task.
struct InertState;

impl SubscriptionState for InertState {
    fn poll(&self) -> bool {
        false
    }
    fn is_recurring(&self) -> bool {
        false
    }
    fn on_job_completed(&self) {}
}

impl ActorControl {
    pub(crate) fn new(task: Arc<ActorTask>) -> Self {
        Self { task }
    }

    pub(crate) fn task(&self) -> &Arc<ActorTask> {
        &self.task
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.task.phase()
    }

    /// True once closing has begun; long loops should check this and wind
    /// down voluntarily.
    pub fn is_closing(&self) -> bool {
        self.task.phase() >= LifecyclePhase::CloseRequested
    }

    /// Appends an internal one-shot job. Internal jobs run before external
    /// submissions; on a terminated task the job is rejected with
    /// `ActorClosed` instead of being dropped.
    pub fn run(&self, f: impl FnOnce(&ActorControl) + Send + 'static) {
        self.task.enqueue_fast(Job::run(f));
        self.task.try_wakeup();
    }

    /// Appends a job re-invoked once per dispatch cycle until the actor
    /// calls [`done`](ActorControl::done). The task yields its worker
    /// between invocations, so other actors are never starved.
    pub fn run_until_done(&self, f: impl FnMut(&ActorControl) + Send + 'static) {
        self.task.enqueue_fast(Job::run_until_done(f));
        self.task.try_wakeup();
    }

    /// Completes the current run-until-done job.
    pub fn done(&self) {
        self.task.request_done();
    }

    /// Ends the current dispatch cycle after this job; the task requeues
    /// itself if work remains.
    pub fn yield_now(&self) {
        self.task.request_yield();
    }

    /// Submits work from outside the actor and returns a future for its
    /// result. Rejected with `ActorClosed` once closing has begun.
    pub fn call<T, F>(&self, f: F) -> CompletableActorFuture<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&ActorControl) -> T + Send + 'static,
    {
        let fut = CompletableActorFuture::new();
        let completer = fut.clone();
        let failer = fut.clone();
        let job = Job::run(move |ctl| completer.complete(f(ctl)))
            .with_failure_hook(move |err| failer.fail(err));
        self.task.submit(job);
        fut
    }

    /// Fire-and-forget external submission.
    pub fn submit(&self, f: impl FnOnce(&ActorControl) + Send + 'static) {
        self.task.submit(Job::run(f));
    }

    /// Requests a graceful close and returns the future resolved once the
    /// actor reached the closed phase. Idempotent.
    pub fn close(&self) -> CompletableActorFuture<()> {
        self.task.request_close()
    }

    /// Schedules `f` to run once on this actor after `delay`.
    pub fn run_delayed(
        &self,
        delay: Duration,
        f: impl FnMut(&ActorControl) + Send + 'static,
    ) -> TimerHandle {
        self.schedule_timer(delay, false, Box::new(f))
    }

    /// Schedules `f` to run on this actor every `interval`. The next
    /// expiration is armed after each callback completes, so a slow actor
    /// sees fewer, not overlapping, invocations.
    pub fn run_at_interval(
        &self,
        interval: Duration,
        f: impl FnMut(&ActorControl) + Send + 'static,
    ) -> TimerHandle {
        self.schedule_timer(interval, true, Box::new(f))
    }

    fn schedule_timer(
        &self,
        delay: Duration,
        recurring: bool,
        runnable: Box<dyn FnMut(&ActorControl) + Send>,
    ) -> TimerHandle {
        let Some(handles) = self.task.handles() else {
            warn!("timer requested on a task not bound to a scheduler");
            let entry = SubscriptionEntry::new(Arc::new(InertState), runnable);
            entry.cancel();
            return TimerHandle::from_entry(entry);
        };
        let service = handles.group.timer_service();
        let clock = handles.group.clock();
        let subscription = TimerSubscription::new(
            delay.as_millis() as u64,
            recurring,
            &self.task,
            service,
            Arc::clone(clock),
        );
        let entry = SubscriptionEntry::new(
            Arc::clone(&subscription) as Arc<dyn SubscriptionState>,
            runnable,
        );
        self.task.register_subscription(Arc::clone(&entry));
        service.schedule(&subscription, &**clock);
        TimerHandle::from_entry(entry)
    }

    /// Registers a named condition; `f` runs on this actor after each
    /// coalesced batch of signals.
    pub fn on_condition(
        &self,
        name: impl Into<String>,
        f: impl FnMut(&ActorControl) + Send + 'static,
    ) -> ActorCondition {
        let state = ConditionState::new(name.into(), &self.task);
        let entry = SubscriptionEntry::new(
            Arc::clone(&state) as Arc<dyn SubscriptionState>,
            Box::new(f),
        );
        self.task.register_subscription(Arc::clone(&entry));
        ActorCondition::from_parts(state, entry)
    }

    /// Subscribes this actor to a channel: `f` runs whenever the channel
    /// signals or still has a backlog after a callback.
    pub fn consume(
        &self,
        channel: &Arc<dyn ConsumableChannel>,
        f: impl FnMut(&ActorControl) + Send + 'static,
    ) {
        let state = ChannelConsumerState::new(&self.task, channel);
        state.attach();
        let entry = SubscriptionEntry::new(
            Arc::clone(&state) as Arc<dyn SubscriptionState>,
            Box::new(f),
        );
        self.task.register_subscription(entry);
    }

    /// Runs `action` once on the blocking pool; `on_complete` then runs on
    /// this actor. A panicking action is reported through the task's
    /// failure handling and the callback is skipped.
    pub fn run_blocking(
        &self,
        action: impl FnOnce() + Send + 'static,
        on_complete: impl FnMut(&ActorControl) + Send + 'static,
    ) {
        let mut action = Some(action);
        self.schedule_blocking(
            Box::new(move || {
                if let Some(action) = action.take() {
                    action();
                }
            }),
            false,
            Box::new(on_complete),
        );
    }

    /// Repeatedly runs `action` on the blocking pool, invoking
    /// `on_complete` on this actor after each round. The next round is
    /// submitted only after the callback finished.
    pub fn poll_blocking(
        &self,
        action: impl FnMut() + Send + 'static,
        on_complete: impl FnMut(&ActorControl) + Send + 'static,
    ) {
        self.schedule_blocking(Box::new(action), true, Box::new(on_complete));
    }

    fn schedule_blocking(
        &self,
        action: Box<dyn FnMut() + Send>,
        recurring: bool,
        on_complete: Box<dyn FnMut(&ActorControl) + Send>,
    ) {
        let Some(handles) = self.task.handles() else {
            warn!("blocking work requested on a task not bound to a scheduler");
            return;
        };
        let subscription =
            BlockingPollSubscription::new(action, recurring, &self.task, handles.executor.blocking_pool());
        let entry = SubscriptionEntry::new(
            Arc::clone(&subscription) as Arc<dyn SubscriptionState>,
            on_complete,
        );
        self.task.register_subscription(entry);
        subscription.submit();
    }

    /// Runs `f` on this actor once `fut` settles. The continuation is
    /// always queued as a job, even when the future is already complete.
    /// Registered during a non-started phase, the pending future blocks
    /// that phase from completing until the continuation has been queued.
    pub fn run_on_completion<T: Clone + Send + 'static>(
        &self,
        fut: &CompletableActorFuture<T>,
        f: impl FnOnce(SchedulerResult<T>, &ActorControl) + Send + 'static,
    ) {
        let phase_blocking = self.task.begin_phase_blocker();
        let task = Arc::clone(&self.task);
        fut.on_completion(move |result| {
            let job = Job::run(move |ctl| f(result, ctl));
            task.submit_continuation(job, phase_blocking);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Noop;
    impl Actor for Noop {}

    fn started_task() -> Arc<ActorTask> {
        let task = ActorTask::new(Box::new(Noop), 0);
        task.activate();
        task.execute();
        task
    }

    #[test]
    fn test_call_completes_future_with_result() {
        let task = started_task();
        let ctl = ActorControl::new(Arc::clone(&task));
        let fut = ctl.call(|_| 21 * 2);
        task.execute();
        assert_eq!(fut.peek(), Some(Ok(42)));
    }

    #[test]
    fn test_call_panic_fails_future() {
        let task = started_task();
        let ctl = ActorControl::new(Arc::clone(&task));
        let fut: CompletableActorFuture<u32> = ctl.call(|_| panic!("oops"));
        task.execute();
        match fut.peek() {
            Some(Err(SchedulerError::JobFailure(message))) => assert!(message.contains("oops")),
            other => panic!("unexpected result: {other:?}"),
        }
        // Actor survives the failure.
        assert_eq!(task.phase(), LifecyclePhase::Started);
    }

    #[test]
    fn test_run_on_completion_queues_even_when_complete() {
        let task = started_task();
        let ctl = ActorControl::new(Arc::clone(&task));
        let fut = CompletableActorFuture::completed(5);

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        ctl.run_on_completion(&fut, move |result, _| {
            assert_eq!(result, Ok(5));
            ran2.store(true, Ordering::SeqCst);
        });
        // Queued, not inline.
        assert!(!ran.load(Ordering::SeqCst));
        task.execute();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_nested_run_jobs_preserve_order() {
        let task = started_task();
        let ctl = ActorControl::new(Arc::clone(&task));
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        ctl.run(move |inner_ctl| {
            o.lock().push(1);
            let o2 = Arc::clone(&o);
            inner_ctl.run(move |_| o2.lock().push(3));
            o.lock().push(2);
        });
        task.execute();
        assert_eq!(&*order.lock(), &[1, 2, 3]);
    }
}
