//! Retry strategies built on actor scheduling primitives.
//!
//! An operation is a closure returning `Ok(true)` on completion,
//! `Ok(false)` when it made no progress, or an error. Strategies differ in
//! how they space retries and which errors they treat as fatal. The
//! returned future resolves `true` when the operation completed and
//! `false` when a terminate condition ended the retry loop first.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::actor::ActorControl;
use crate::error::{SchedulerError, SchedulerResult};
use crate::future::CompletableActorFuture;

pub type RetryOperation = Box<dyn FnMut() -> SchedulerResult<bool> + Send>;
pub type TerminateCondition = Box<dyn FnMut() -> bool + Send>;

pub trait RetryStrategy: Send {
    /// Retries `op` on the calling actor until it completes.
    fn run_with_retry(&self, ctl: &ActorControl, op: RetryOperation) -> CompletableActorFuture<bool> {
        self.run_with_retry_until(ctl, op, Box::new(|| false))
    }

    /// Retries `op` until it completes or `terminate` returns true;
    /// termination resolves the future with `false`.
    fn run_with_retry_until(
        &self,
        ctl: &ActorControl,
        op: RetryOperation,
        terminate: TerminateCondition,
    ) -> CompletableActorFuture<bool>;
}

/// Spaces retries with a doubling delay, re-armed through `run_delayed`.
///
/// Every failure, including errors, schedules another attempt; use this
/// for operations that must eventually succeed (e.g. flushing to a
/// temporarily unavailable resource).
pub struct BackOffRetryStrategy {
    initial_delay: Duration,
    max_delay: Duration,
}

impl BackOffRetryStrategy {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay,
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }
}

struct BackOffState {
    op: RetryOperation,
    terminate: TerminateCondition,
    delay: Duration,
    max_delay: Duration,
    fut: CompletableActorFuture<bool>,
}

fn back_off_attempt(ctl: &ActorControl, state: &Arc<Mutex<BackOffState>>) {
    let (result, fut) = {
        let mut s = state.lock();
        ((s.op)(), s.fut.clone())
    };
    match result {
        Ok(true) => fut.complete(true),
        _ => {
            // The terminate condition is consulted only after a failed
            // attempt; the operation itself always gets its try.
            let delay = {
                let mut s = state.lock();
                if (s.terminate)() {
                    None
                } else {
                    let delay = s.delay;
                    s.delay = (delay * 2).min(s.max_delay);
                    Some(delay)
                }
            };
            match delay {
                Some(delay) => {
                    let state = Arc::clone(state);
                    ctl.run_delayed(delay, move |ctl| back_off_attempt(ctl, &state));
                }
                None => fut.complete(false),
            }
        }
    }
}

impl RetryStrategy for BackOffRetryStrategy {
    fn run_with_retry_until(
        &self,
        ctl: &ActorControl,
        op: RetryOperation,
        terminate: TerminateCondition,
    ) -> CompletableActorFuture<bool> {
        let fut = CompletableActorFuture::new();
        let state = Arc::new(Mutex::new(BackOffState {
            op,
            terminate,
            delay: self.initial_delay,
            max_delay: self.max_delay,
            fut: fut.clone(),
        }));
        ctl.run(move |ctl| back_off_attempt(ctl, &state));
        fut
    }
}

/// Retries immediately (yielding between attempts) while the operation
/// reports [`SchedulerError::Recoverable`] or no progress; any other error
/// fails the future and stops the loop.
pub struct RecoverableRetryStrategy;

impl RetryStrategy for RecoverableRetryStrategy {
    fn run_with_retry_until(
        &self,
        ctl: &ActorControl,
        mut op: RetryOperation,
        mut terminate: TerminateCondition,
    ) -> CompletableActorFuture<bool> {
        let fut = CompletableActorFuture::new();
        let result = fut.clone();
        ctl.run_until_done(move |ctl| {
            if terminate() {
                result.complete(false);
                ctl.done();
                return;
            }
            match op() {
                Ok(true) => {
                    result.complete(true);
                    ctl.done();
                }
                Ok(false) | Err(SchedulerError::Recoverable(_)) => {
                    // Requeued by the run-until-done contract; the task
                    // yields its worker in between.
                }
                Err(err) => {
                    result.fail(err);
                    ctl.done();
                }
            }
        });
        fut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Actor;
    use crate::task::ActorTask;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Noop;
    impl Actor for Noop {}

    fn started_task() -> Arc<ActorTask> {
        let task = ActorTask::new(Box::new(Noop), 0);
        task.activate();
        task.execute();
        task
    }

    fn drive(task: &Arc<ActorTask>, cycles: usize) {
        for _ in 0..cycles {
            task.execute();
        }
    }

    #[test]
    fn test_recoverable_retries_until_success() {
        let task = started_task();
        let ctl = ActorControl::new(Arc::clone(&task));
        let attempts = Arc::new(AtomicU32::new(0));

        let a = Arc::clone(&attempts);
        let fut = RecoverableRetryStrategy.run_with_retry(
            &ctl,
            Box::new(move || {
                let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(SchedulerError::Recoverable("not yet".to_string()))
                } else {
                    Ok(true)
                }
            }),
        );

        drive(&task, 5);
        assert_eq!(fut.peek(), Some(Ok(true)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_recoverable_fails_on_hard_error() {
        let task = started_task();
        let ctl = ActorControl::new(Arc::clone(&task));
        let attempts = Arc::new(AtomicU32::new(0));

        let a = Arc::clone(&attempts);
        let fut = RecoverableRetryStrategy.run_with_retry(
            &ctl,
            Box::new(move || {
                a.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::JobFailure("disk gone".to_string()))
            }),
        );

        drive(&task, 5);
        assert!(matches!(
            fut.peek(),
            Some(Err(SchedulerError::JobFailure(_)))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recoverable_terminate_resolves_false() {
        let task = started_task();
        let ctl = ActorControl::new(Arc::clone(&task));

        let fut = RecoverableRetryStrategy.run_with_retry_until(
            &ctl,
            Box::new(|| Ok(false)),
            Box::new(|| true),
        );
        drive(&task, 3);
        assert_eq!(fut.peek(), Some(Ok(false)));
    }
}
