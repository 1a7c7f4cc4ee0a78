//! Units of work executed by a task.
//!
//! Jobs are tagged by kind instead of sharing one ambiguous callback slot:
//! one-shot closures auto-complete, run-until-done closures are re-invoked
//! across dispatch cycles until the actor calls `done`, subscription jobs
//! deliver exactly one trigger, and hook jobs drive lifecycle transitions.

use std::sync::Arc;

use crate::actor::ActorControl;
use crate::error::{SchedulerError, SchedulerResult};
use crate::subscription::SubscriptionEntry;
use crate::task::{ActorTask, LifecyclePhase};

pub(crate) enum JobKind {
    /// Runs once, then completes.
    Run(Option<Box<dyn FnOnce(&ActorControl) + Send>>),
    /// Re-invoked once per dispatch until the actor calls `done`.
    RunUntilDone(Box<dyn FnMut(&ActorControl) + Send>),
    /// Delivers one subscription trigger.
    Subscription(Arc<SubscriptionEntry>),
    /// Invokes the lifecycle hook for a phase.
    Hook(LifecyclePhase),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Done,
    Requeue,
}

pub(crate) struct Job {
    kind: JobKind,
    /// Fails the associated future (if any) when the job cannot run or its
    /// execution failed.
    failure_hook: Option<Box<dyn FnOnce(SchedulerError) + Send>>,
}

impl Job {
    pub(crate) fn run(f: impl FnOnce(&ActorControl) + Send + 'static) -> Self {
        Self {
            kind: JobKind::Run(Some(Box::new(f))),
            failure_hook: None,
        }
    }

    pub(crate) fn run_until_done(f: impl FnMut(&ActorControl) + Send + 'static) -> Self {
        Self {
            kind: JobKind::RunUntilDone(Box::new(f)),
            failure_hook: None,
        }
    }

    pub(crate) fn subscription(entry: Arc<SubscriptionEntry>) -> Self {
        Self {
            kind: JobKind::Subscription(entry),
            failure_hook: None,
        }
    }

    pub(crate) fn hook(phase: LifecyclePhase) -> Self {
        Self {
            kind: JobKind::Hook(phase),
            failure_hook: None,
        }
    }

    pub(crate) fn with_failure_hook(
        mut self,
        hook: impl FnOnce(SchedulerError) + Send + 'static,
    ) -> Self {
        self.failure_hook = Some(Box::new(hook));
        self
    }

    pub(crate) fn entry(&self) -> Option<&Arc<SubscriptionEntry>> {
        match &self.kind {
            JobKind::Subscription(entry) => Some(entry),
            _ => None,
        }
    }

    /// Notifies the failure hook, if any. Consumes the hook so a job can
    /// fail at most once.
    pub(crate) fn notify_failure(&mut self, err: &SchedulerError) {
        if let Some(hook) = self.failure_hook.take() {
            hook(err.clone());
        }
    }

    /// Rejects a job that will never run (closed actor, terminated task).
    pub(crate) fn reject(mut self, err: SchedulerError) {
        self.notify_failure(&err);
    }

    /// Runs the job body. Panics are caught by the caller.
    pub(crate) fn execute(
        &mut self,
        ctl: &ActorControl,
        task: &ActorTask,
    ) -> SchedulerResult<JobOutcome> {
        match &mut self.kind {
            JobKind::Run(f) => {
                if let Some(f) = f.take() {
                    f(ctl);
                }
                Ok(JobOutcome::Done)
            }
            JobKind::RunUntilDone(f) => {
                f(ctl);
                if task.done_requested() {
                    Ok(JobOutcome::Done)
                } else {
                    Ok(JobOutcome::Requeue)
                }
            }
            JobKind::Subscription(entry) => {
                if entry.is_cancelled() {
                    return Ok(JobOutcome::Done);
                }
                if let Some(err) = entry.state().take_failure() {
                    return Err(err);
                }
                entry.invoke(ctl);
                Ok(JobOutcome::Done)
            }
            JobKind::Hook(phase) => {
                task.invoke_hook(*phase, ctl);
                Ok(JobOutcome::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_failure_hook_fires_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let mut job =
            Job::run(|_| {}).with_failure_hook(move |err| seen2.lock().push(err.to_string()));

        job.notify_failure(&SchedulerError::ActorClosed);
        job.notify_failure(&SchedulerError::Timeout);
        assert_eq!(&*seen.lock(), &["actor is closed".to_string()]);
    }

    #[test]
    fn test_reject_consumes_job() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let job = Job::run(|_| {}).with_failure_hook(move |err| seen2.lock().push(err));
        job.reject(SchedulerError::ActorClosed);
        assert_eq!(&*seen.lock(), &[SchedulerError::ActorClosed]);
    }
}
