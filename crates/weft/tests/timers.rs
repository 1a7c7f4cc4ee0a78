//! Timer behavior under a manually advanced clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use weft::testing::{wait_until, TestScheduler};
use weft::{Actor, ActorControl, TimerHandle};

mod common;

const WAIT: Duration = Duration::from_secs(5);

fn test_scheduler() -> TestScheduler {
    common::init_test_logging();
    TestScheduler::new().expect("scheduler")
}

struct TimedActor {
    interval: Duration,
    recurring: bool,
    fired: Arc<AtomicU32>,
    handle: Arc<Mutex<Option<TimerHandle>>>,
}

impl Actor for TimedActor {
    fn on_actor_started(&mut self, ctl: &ActorControl) {
        let fired = Arc::clone(&self.fired);
        let callback = move |_ctl: &ActorControl| {
            fired.fetch_add(1, Ordering::SeqCst);
        };
        let handle = if self.recurring {
            ctl.run_at_interval(self.interval, callback)
        } else {
            ctl.run_delayed(self.interval, callback)
        };
        *self.handle.lock() = Some(handle);
    }
}

fn timed(
    test: &TestScheduler,
    interval: Duration,
    recurring: bool,
) -> (Arc<AtomicU32>, Arc<Mutex<Option<TimerHandle>>>) {
    let fired = Arc::new(AtomicU32::new(0));
    let handle = Arc::new(Mutex::new(None));
    let actor = test
        .submit(TimedActor {
            interval,
            recurring,
            fired: Arc::clone(&fired),
            handle: Arc::clone(&handle),
        })
        .expect("submits");
    actor.started().block_on_timeout(WAIT).expect("starts");
    (fired, handle)
}

#[test]
fn test_delayed_job_fires_only_after_clock_advance() {
    let test = test_scheduler();
    let (fired, _handle) = timed(&test, Duration::from_millis(100), false);

    // Wall time passes but the controlled clock does not move.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    test.advance_time(Duration::from_millis(99));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    test.advance_time(Duration::from_millis(1));
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) == 1));

    // One-shot: never fires again.
    test.advance_time(Duration::from_secs(10));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    test.stop().expect("stops");
}

#[test]
fn test_interval_rearms_after_each_callback() {
    let test = test_scheduler();
    let (fired, _handle) = timed(&test, Duration::from_millis(10), true);

    test.advance_time(Duration::from_millis(10));
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) == 1));

    test.advance_time(Duration::from_millis(10));
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) == 2));
    test.stop().expect("stops");
}

#[test]
fn test_interval_does_not_accumulate_missed_expirations() {
    let test = test_scheduler();
    let (fired, _handle) = timed(&test, Duration::from_millis(10), true);

    // A jump of several intervals produces one callback; the next
    // expiration is armed relative to now, not to the missed schedule.
    test.advance_time(Duration::from_millis(50));
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) >= 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    test.advance_time(Duration::from_millis(10));
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) == 2));
    test.stop().expect("stops");
}

#[test]
fn test_cancelled_timer_never_fires() {
    let test = test_scheduler();
    let (fired, handle) = timed(&test, Duration::from_millis(100), false);

    handle.lock().take().expect("timer handle").cancel();
    test.advance_time(Duration::from_secs(1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    test.stop().expect("stops");
}

#[test]
fn test_timers_stop_when_actor_closes() {
    let test = test_scheduler();
    let fired = Arc::new(AtomicU32::new(0));
    let handle = Arc::new(Mutex::new(None));
    let actor = test
        .submit(TimedActor {
            interval: Duration::from_millis(10),
            recurring: true,
            fired: Arc::clone(&fired),
            handle: Arc::clone(&handle),
        })
        .expect("submits");
    actor.started().block_on_timeout(WAIT).expect("starts");

    test.advance_time(Duration::from_millis(10));
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) == 1));

    actor.close().block_on_timeout(WAIT).expect("closes");
    let settled = fired.load(Ordering::SeqCst);
    test.advance_time(Duration::from_secs(1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), settled);
    test.stop().expect("stops");
}
