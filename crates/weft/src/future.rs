//! Completable futures shared between actors and external callers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{SchedulerError, SchedulerResult};

type Continuation<T> = Box<dyn FnOnce(SchedulerResult<T>) + Send>;

enum FutureState<T> {
    Pending(Vec<Continuation<T>>),
    Completed(T),
    Failed(SchedulerError),
}

struct Inner<T> {
    state: Mutex<FutureState<T>>,
    cond: Condvar,
}

/// A one-shot value that can be completed (or failed) exactly once.
///
/// Completion is idempotent: later calls are ignored with a warning rather
/// than panicking, since racing completers are legal (e.g. a retry strategy
/// and a close path). Blocking waits are for threads outside the scheduler;
/// actors react to completion via continuations instead.
pub struct CompletableActorFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CompletableActorFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> CompletableActorFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FutureState::Pending(Vec::new())),
                cond: Condvar::new(),
            }),
        }
    }

    /// An already-completed future.
    pub fn completed(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FutureState::Completed(value)),
                cond: Condvar::new(),
            }),
        }
    }

    /// An already-failed future.
    pub fn failed(err: SchedulerError) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(FutureState::Failed(err)),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn complete(&self, value: T) {
        self.settle(Ok(value));
    }

    pub fn fail(&self, err: SchedulerError) {
        self.settle(Err(err));
    }

    fn settle(&self, result: SchedulerResult<T>) {
        let continuations = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                FutureState::Pending(pending) => {
                    let pending = std::mem::take(pending);
                    *state = match &result {
                        Ok(v) => FutureState::Completed(v.clone()),
                        Err(e) => FutureState::Failed(e.clone()),
                    };
                    self.inner.cond.notify_all();
                    pending
                }
                _ => {
                    warn!("future settled more than once, ignoring later result");
                    return;
                }
            }
        };
        for continuation in continuations {
            continuation(result.clone());
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(&*self.inner.state.lock(), FutureState::Pending(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(&*self.inner.state.lock(), FutureState::Failed(_))
    }

    /// The settled result, if any, without blocking.
    pub fn peek(&self) -> Option<SchedulerResult<T>> {
        match &*self.inner.state.lock() {
            FutureState::Pending(_) => None,
            FutureState::Completed(v) => Some(Ok(v.clone())),
            FutureState::Failed(e) => Some(Err(e.clone())),
        }
    }

    /// Registers a continuation invoked with the settled result.
    ///
    /// If the future is already settled, the continuation runs immediately on
    /// the calling thread; otherwise it runs on whichever thread settles the
    /// future. Actor-side continuations are re-queued onto the owning task by
    /// `ActorControl::run_on_completion`, never run inline.
    pub fn on_completion(&self, f: impl FnOnce(SchedulerResult<T>) + Send + 'static) {
        let result = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                FutureState::Pending(pending) => {
                    pending.push(Box::new(f));
                    return;
                }
                FutureState::Completed(v) => Ok(v.clone()),
                FutureState::Failed(e) => Err(e.clone()),
            }
        };
        f(result);
    }

    /// Blocks the calling thread until the future settles.
    ///
    /// Must not be called from a worker thread; that would stall every actor
    /// multiplexed on it.
    pub fn block_on(&self) -> SchedulerResult<T> {
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                FutureState::Completed(v) => return Ok(v.clone()),
                FutureState::Failed(e) => return Err(e.clone()),
                FutureState::Pending(_) => self.inner.cond.wait(&mut state),
            }
        }
    }

    /// Blocks until the future settles or the timeout elapses.
    pub fn block_on_timeout(&self, timeout: Duration) -> SchedulerResult<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            match &*state {
                FutureState::Completed(v) => return Ok(v.clone()),
                FutureState::Failed(e) => return Err(e.clone()),
                FutureState::Pending(_) => {
                    if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                        return match &*state {
                            FutureState::Completed(v) => Ok(v.clone()),
                            FutureState::Failed(e) => Err(e.clone()),
                            FutureState::Pending(_) => Err(SchedulerError::Timeout),
                        };
                    }
                }
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for CompletableActorFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_complete_and_block_on() {
        let fut = CompletableActorFuture::new();
        let fut2 = fut.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            fut2.complete(42);
        });
        assert_eq!(fut.block_on(), Ok(42));
        assert!(fut.is_done());
        assert!(!fut.is_failed());
        handle.join().ok();
    }

    #[test]
    fn test_fail_propagates_error() {
        let fut: CompletableActorFuture<()> = CompletableActorFuture::new();
        fut.fail(SchedulerError::ActorClosed);
        assert_eq!(fut.block_on(), Err(SchedulerError::ActorClosed));
        assert!(fut.is_failed());
    }

    #[test]
    fn test_second_completion_ignored() {
        let fut = CompletableActorFuture::new();
        fut.complete(1);
        fut.complete(2);
        fut.fail(SchedulerError::ActorClosed);
        assert_eq!(fut.block_on(), Ok(1));
    }

    #[test]
    fn test_block_on_timeout_elapses() {
        let fut: CompletableActorFuture<u32> = CompletableActorFuture::new();
        let result = fut.block_on_timeout(Duration::from_millis(20));
        assert_eq!(result, Err(SchedulerError::Timeout));
    }

    #[test]
    fn test_continuation_runs_on_completion() {
        let fut = CompletableActorFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        fut.on_completion(move |res| {
            assert_eq!(res, Ok(7));
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        fut.complete(7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Already settled: runs immediately.
        let c = Arc::clone(&calls);
        fut.on_completion(move |res| {
            assert_eq!(res, Ok(7));
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pre_settled_constructors() {
        let done = CompletableActorFuture::completed("ok".to_string());
        assert_eq!(done.peek(), Some(Ok("ok".to_string())));

        let failed: CompletableActorFuture<String> =
            CompletableActorFuture::failed(SchedulerError::Timeout);
        assert_eq!(failed.peek(), Some(Err(SchedulerError::Timeout)));
    }
}
