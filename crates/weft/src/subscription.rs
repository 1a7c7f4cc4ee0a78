//! Subscription plumbing: timers, conditions, channel consumers and
//! blocking polls.
//!
//! A subscription couples an external trigger source with a callback owned
//! by one task. Trigger sources only flip atomic flags and wake the task;
//! the callback itself always runs on the owning task, so actor state is
//! never touched from a foreign thread. Each subscription produces at most
//! one queued job at a time, however often its trigger fires in between.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::actor::ActorControl;
use crate::blocking::BlockingPool;
use crate::clock::ActorClock;
use crate::error::{panic_message, SchedulerError};
use crate::task::ActorTask;
use crate::wheel::TimerService;

/// Trigger-side state of a subscription.
pub(crate) trait SubscriptionState: Send + Sync {
    /// True when the trigger fired and a job should be queued.
    fn poll(&self) -> bool;

    /// Recurring subscriptions re-arm after each completed job.
    fn is_recurring(&self) -> bool;

    /// Invoked on the owning task after the subscription job ran.
    fn on_job_completed(&self);

    /// Invoked once when the subscription is cancelled.
    fn on_cancelled(&self) {}

    /// A failure captured off-thread, to be routed through the owning
    /// task's failure handling instead of the callback.
    fn take_failure(&self) -> Option<SchedulerError> {
        None
    }
}

/// A subscription as the owning task sees it: trigger state plus callback.
pub(crate) struct SubscriptionEntry {
    state: Arc<dyn SubscriptionState>,
    runnable: Mutex<Box<dyn FnMut(&ActorControl) + Send>>,
    queued: AtomicBool,
    cancelled: AtomicBool,
}

impl SubscriptionEntry {
    pub(crate) fn new(
        state: Arc<dyn SubscriptionState>,
        runnable: Box<dyn FnMut(&ActorControl) + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            runnable: Mutex::new(runnable),
            queued: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        })
    }

    /// True when a job should be queued now: triggered, not already queued,
    /// not cancelled.
    pub(crate) fn pollable(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
            && !self.queued.load(Ordering::Acquire)
            && self.state.poll()
    }

    pub(crate) fn mark_queued(&self) {
        self.queued.store(true, Ordering::Release);
    }

    pub(crate) fn invoke(&self, ctl: &ActorControl) {
        (self.runnable.lock())(ctl)
    }

    /// Called after the subscription job ran; re-arms recurring triggers.
    /// One-shot subscriptions are cancelled here so the owning task drops
    /// them from its subscription list instead of carrying spent entries.
    pub(crate) fn job_completed(&self) {
        self.queued.store(false, Ordering::Release);
        self.state.on_job_completed();
        if !self.state.is_recurring() {
            self.cancel();
        }
    }

    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.state.on_cancelled();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> &Arc<dyn SubscriptionState> {
        &self.state
    }
}

/// Delay or interval subscription backed by the group's timer service.
pub(crate) struct TimerSubscription {
    delay_ms: u64,
    recurring: bool,
    triggered: AtomicBool,
    cancelled: AtomicBool,
    timer_id: AtomicU64,
    task: Weak<ActorTask>,
    service: Weak<TimerService>,
    clock: Arc<dyn ActorClock>,
    me: Weak<TimerSubscription>,
}

impl TimerSubscription {
    pub(crate) fn new(
        delay_ms: u64,
        recurring: bool,
        task: &Arc<ActorTask>,
        service: &Arc<TimerService>,
        clock: Arc<dyn ActorClock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            delay_ms,
            recurring,
            triggered: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            timer_id: AtomicU64::new(0),
            task: Arc::downgrade(task),
            service: Arc::downgrade(service),
            clock,
            me: me.clone(),
        })
    }

    pub(crate) fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub(crate) fn timer_id(&self) -> u64 {
        self.timer_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_timer_id(&self, id: u64) {
        self.timer_id.store(id, Ordering::Release);
    }

    /// Called by the timer service when the deadline passes.
    pub(crate) fn on_timer_expired(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.triggered.store(true, Ordering::Release);
        if let Some(task) = self.task.upgrade() {
            task.try_wakeup();
        }
    }
}

impl SubscriptionState for TimerSubscription {
    fn poll(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    fn is_recurring(&self) -> bool {
        self.recurring
    }

    fn on_job_completed(&self) {
        self.triggered.store(false, Ordering::Release);
        if self.recurring && !self.cancelled.load(Ordering::Acquire) {
            if let (Some(service), Some(me)) = (self.service.upgrade(), self.me.upgrade()) {
                service.schedule(&me, &*self.clock);
            }
        }
    }

    fn on_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(service) = self.service.upgrade() {
            service.remove(self);
        }
    }
}

/// Counter-based trigger shared by conditions and channel consumers.
///
/// `signal` may race with job execution; the trigger counter ensures a
/// signal arriving mid-job queues exactly one follow-up job.
pub(crate) struct ConditionState {
    name: String,
    triggered: AtomicU64,
    processed: AtomicU64,
    task: Weak<ActorTask>,
}

impl ConditionState {
    pub(crate) fn new(name: String, task: &Arc<ActorTask>) -> Arc<Self> {
        Arc::new(Self {
            name,
            triggered: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            task: Arc::downgrade(task),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn signal(&self) {
        self.triggered.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = self.task.upgrade() {
            task.try_wakeup();
        }
    }
}

impl SubscriptionState for ConditionState {
    fn poll(&self) -> bool {
        self.triggered.load(Ordering::Acquire) > self.processed.load(Ordering::Acquire)
    }

    fn is_recurring(&self) -> bool {
        true
    }

    fn on_job_completed(&self) {
        // Collapse every signal observed so far into this one run.
        self.processed
            .store(self.triggered.load(Ordering::Acquire), Ordering::Release);
    }
}

/// Handle returned by `ActorControl::on_condition`. Cloneable and safe to
/// signal from any thread.
#[derive(Clone)]
pub struct ActorCondition {
    state: Arc<ConditionState>,
    entry: Arc<SubscriptionEntry>,
}

impl ActorCondition {
    pub(crate) fn from_parts(state: Arc<ConditionState>, entry: Arc<SubscriptionEntry>) -> Self {
        Self { state, entry }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Marks the condition met. Coalesced: many signals before the actor
    /// runs produce a single callback invocation.
    pub fn signal(&self) {
        if self.entry.is_cancelled() {
            return;
        }
        self.state.signal();
    }

    pub fn cancel(&self) {
        self.entry.cancel();
    }
}

/// Handle returned by `ActorControl::run_delayed` and `run_at_interval`.
pub struct TimerHandle {
    entry: Arc<SubscriptionEntry>,
}

impl TimerHandle {
    pub(crate) fn from_entry(entry: Arc<SubscriptionEntry>) -> Self {
        Self { entry }
    }

    /// Cancels the timer. A concurrently expiring timer may still deliver
    /// one callback; after cancel returns no new expirations are armed.
    pub fn cancel(&self) {
        self.entry.cancel();
    }
}

/// Anything that can be signalled when channel data becomes available.
pub trait ChannelConsumer: Send + Sync {
    fn signal(&self);
}

/// A data source an actor can subscribe to with `ActorControl::consume`.
///
/// Producers call `consumers().signal_consumers()` after publishing.
pub trait ConsumableChannel: Send + Sync {
    /// True while unconsumed data is available. Polled by the owning worker
    /// between jobs, so consumption survives missed signals.
    fn has_available(&self) -> bool;

    fn consumers(&self) -> &ActorConditions;
}

/// Registry of consumers attached to a channel.
pub struct ActorConditions {
    registered: RwLock<Vec<Arc<dyn ChannelConsumer>>>,
}

impl ActorConditions {
    pub fn new() -> Self {
        Self {
            registered: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, consumer: Arc<dyn ChannelConsumer>) {
        self.registered.write().push(consumer);
    }

    pub fn remove(&self, consumer: &Arc<dyn ChannelConsumer>) {
        self.registered
            .write()
            .retain(|c| !Arc::ptr_eq(c, consumer));
    }

    pub fn signal_consumers(&self) {
        for consumer in self.registered.read().iter() {
            consumer.signal();
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.registered.read().len()
    }
}

impl Default for ActorConditions {
    fn default() -> Self {
        Self::new()
    }
}

/// Condition wired to a channel: triggers on explicit signals and also
/// whenever the channel reports available data.
pub(crate) struct ChannelConsumerState {
    condition: Arc<ConditionState>,
    channel: Weak<dyn ConsumableChannel>,
    me: Mutex<Option<Arc<dyn ChannelConsumer>>>,
}

impl ChannelConsumerState {
    pub(crate) fn new(
        task: &Arc<ActorTask>,
        channel: &Arc<dyn ConsumableChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            condition: ConditionState::new("channel-consumer".to_string(), task),
            channel: Arc::downgrade(channel),
            me: Mutex::new(None),
        })
    }

    /// Registers this consumer with the channel. Must be called once after
    /// construction; keeps the registration handle for later removal.
    pub(crate) fn attach(self: &Arc<Self>) {
        if let Some(channel) = self.channel.upgrade() {
            let consumer: Arc<dyn ChannelConsumer> = Arc::clone(self) as Arc<dyn ChannelConsumer>;
            channel.consumers().register(Arc::clone(&consumer));
            *self.me.lock() = Some(consumer);
        }
    }
}

impl ChannelConsumer for ChannelConsumerState {
    fn signal(&self) {
        self.condition.signal();
    }
}

impl SubscriptionState for ChannelConsumerState {
    fn poll(&self) -> bool {
        if self.condition.poll() {
            return true;
        }
        self.channel
            .upgrade()
            .map(|c| c.has_available())
            .unwrap_or(false)
    }

    fn is_recurring(&self) -> bool {
        true
    }

    fn on_job_completed(&self) {
        self.condition.on_job_completed();
    }

    fn on_cancelled(&self) {
        let registration = self.me.lock().take();
        if let (Some(channel), Some(consumer)) = (self.channel.upgrade(), registration) {
            channel.consumers().remove(&consumer);
        }
    }
}

/// One in-flight blocking action polled from the blocking pool.
///
/// The action runs off the worker threads; completion (or panic) flips the
/// done flag and wakes the owning task, whose callback then runs in actor
/// context. Recurring subscriptions resubmit after each callback.
pub(crate) struct BlockingPollSubscription {
    action: Mutex<Box<dyn FnMut() + Send>>,
    done: AtomicBool,
    recurring: bool,
    cancelled: AtomicBool,
    failure: Mutex<Option<SchedulerError>>,
    task: Weak<ActorTask>,
    pool: Weak<BlockingPool>,
    me: Weak<BlockingPollSubscription>,
}

impl BlockingPollSubscription {
    pub(crate) fn new(
        action: Box<dyn FnMut() + Send>,
        recurring: bool,
        task: &Arc<ActorTask>,
        pool: &Arc<BlockingPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            action: Mutex::new(action),
            done: AtomicBool::new(false),
            recurring,
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
            task: Arc::downgrade(task),
            pool: Arc::downgrade(pool),
            me: me.clone(),
        })
    }

    /// Hands the action to the blocking pool. A panic inside the action is
    /// captured and routed through the owning task's failure handling; the
    /// task itself keeps running.
    pub(crate) fn submit(&self) {
        let (Some(pool), Some(me)) = (self.pool.upgrade(), self.me.upgrade()) else {
            return;
        };
        self.done.store(false, Ordering::Release);
        pool.submit(Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(|| (me.action.lock())()));
            if let Err(payload) = result {
                let message = panic_message(payload);
                debug!(error = %message, "blocking action panicked");
                *me.failure.lock() = Some(SchedulerError::JobFailure(message));
            }
            me.done.store(true, Ordering::Release);
            if let Some(task) = me.task.upgrade() {
                task.try_wakeup();
            }
        }));
    }
}

impl SubscriptionState for BlockingPollSubscription {
    fn poll(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn is_recurring(&self) -> bool {
        self.recurring
    }

    fn on_job_completed(&self) {
        self.done.store(false, Ordering::Release);
        if self.recurring && !self.cancelled.load(Ordering::Acquire) {
            self.submit();
        }
    }

    fn on_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn take_failure(&self) -> Option<SchedulerError> {
        self.failure.lock().take()
    }
}
