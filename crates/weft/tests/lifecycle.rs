//! Actor lifecycle behavior against a running scheduler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use weft::testing::wait_until;
use weft::{
    Actor, ActorControl, ActorScheduler, CompletableActorFuture, LifecyclePhase, SchedulerError,
};

mod common;

const WAIT: Duration = Duration::from_secs(5);

fn scheduler() -> ActorScheduler {
    common::init_test_logging();
    let scheduler = ActorScheduler::builder()
        .name("lifecycle-test")
        .cpu_threads(2)
        .io_threads(1)
        .build()
        .expect("valid config");
    scheduler.start().expect("starts");
    scheduler
}

#[derive(Clone, Default)]
struct PhaseLog(Arc<Mutex<Vec<&'static str>>>);

impl PhaseLog {
    fn push(&self, phase: &'static str) {
        self.0.lock().push(phase);
    }
    fn snapshot(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }
}

struct Recording {
    log: PhaseLog,
}

impl Actor for Recording {
    fn on_actor_starting(&mut self, _ctl: &ActorControl) {
        self.log.push("starting");
    }
    fn on_actor_started(&mut self, _ctl: &ActorControl) {
        self.log.push("started");
    }
    fn on_actor_close_requested(&mut self, _ctl: &ActorControl) {
        self.log.push("close_requested");
    }
    fn on_actor_closing(&mut self, _ctl: &ActorControl) {
        self.log.push("closing");
    }
    fn on_actor_closed(&mut self, _ctl: &ActorControl) {
        self.log.push("closed");
    }
}

#[test]
fn test_hooks_run_in_order() {
    let scheduler = scheduler();
    let log = PhaseLog::default();
    let handle = scheduler
        .submit(Recording { log: log.clone() })
        .expect("submits");

    handle.started().block_on_timeout(WAIT).expect("starts");
    assert_eq!(log.snapshot(), vec!["starting", "started"]);
    assert_eq!(handle.phase(), LifecyclePhase::Started);

    handle.close().block_on_timeout(WAIT).expect("closes");
    assert_eq!(
        log.snapshot(),
        vec!["starting", "started", "close_requested", "closing", "closed"]
    );
    scheduler.stop().block_on().expect("stops");
}

#[test]
fn test_submit_then_immediately_close_runs_full_lifecycle() {
    let scheduler = scheduler();
    let log = PhaseLog::default();
    let handle = scheduler
        .submit(Recording { log: log.clone() })
        .expect("submits");

    // Close before the actor ever ran: the close defers until started.
    let closed = handle.close();
    closed.block_on_timeout(WAIT).expect("closes");
    assert_eq!(
        log.snapshot(),
        vec!["starting", "started", "close_requested", "closing", "closed"]
    );
    scheduler.stop().block_on().expect("stops");
}

#[test]
fn test_external_call_rejected_after_close() {
    let scheduler = scheduler();
    let log = PhaseLog::default();
    let handle = scheduler
        .submit(Recording { log: log.clone() })
        .expect("submits");
    handle.close().block_on_timeout(WAIT).expect("closes");

    let fut: CompletableActorFuture<u32> = handle.control().call(|_| 1);
    assert_eq!(
        fut.block_on_timeout(WAIT),
        Err(SchedulerError::ActorClosed)
    );
    scheduler.stop().block_on().expect("stops");
}

#[test]
fn test_startup_panic_fails_start_future() {
    struct Exploding;
    impl Actor for Exploding {
        fn on_actor_starting(&mut self, _ctl: &ActorControl) {
            panic!("missing dependency");
        }
    }

    let scheduler = scheduler();
    let handle = scheduler.submit(Exploding).expect("submits");
    match handle.started().block_on_timeout(WAIT) {
        Err(SchedulerError::StartupFailure(message)) => {
            assert!(message.contains("missing dependency"));
        }
        other => panic!("unexpected start result: {other:?}"),
    }
    scheduler.stop().block_on().expect("stops");
}

#[test]
fn test_jobs_submitted_while_starting_run_after_started_hook() {
    struct SlowStarter {
        order: Arc<Mutex<Vec<String>>>,
    }
    impl Actor for SlowStarter {
        fn on_actor_starting(&mut self, _ctl: &ActorControl) {
            std::thread::sleep(Duration::from_millis(20));
            self.order.lock().push("starting".to_string());
        }
        fn on_actor_started(&mut self, _ctl: &ActorControl) {
            self.order.lock().push("started".to_string());
        }
    }

    let scheduler = scheduler();
    let order = Arc::new(Mutex::new(Vec::new()));
    let handle = scheduler
        .submit(SlowStarter {
            order: Arc::clone(&order),
        })
        .expect("submits");

    let o = Arc::clone(&order);
    let fut = handle.control().call(move |_| {
        o.lock().push("external".to_string());
    });
    fut.block_on_timeout(WAIT).expect("external job runs");
    assert_eq!(&*order.lock(), &["starting", "started", "external"]);
    scheduler.stop().block_on().expect("stops");
}

#[test]
fn test_pending_continuation_blocks_started_phase() {
    struct Waiting {
        gate: CompletableActorFuture<u32>,
        observed: Arc<AtomicU32>,
    }
    impl Actor for Waiting {
        fn on_actor_starting(&mut self, ctl: &ActorControl) {
            let observed = Arc::clone(&self.observed);
            ctl.run_on_completion(&self.gate, move |result, _| {
                observed.store(result.unwrap_or(0), Ordering::SeqCst);
            });
        }
    }

    let scheduler = scheduler();
    let gate = CompletableActorFuture::new();
    let observed = Arc::new(AtomicU32::new(0));
    let handle = scheduler
        .submit(Waiting {
            gate: gate.clone(),
            observed: Arc::clone(&observed),
        })
        .expect("submits");

    // The start future must not resolve while the continuation is pending.
    assert_eq!(
        handle.started().block_on_timeout(Duration::from_millis(100)),
        Err(SchedulerError::Timeout)
    );

    gate.complete(7);
    handle.started().block_on_timeout(WAIT).expect("starts");
    assert!(wait_until(WAIT, || observed.load(Ordering::SeqCst) == 7));
    scheduler.stop().block_on().expect("stops");
}

#[test]
fn test_steady_state_panic_keeps_actor_alive() {
    let scheduler = scheduler();
    let log = PhaseLog::default();
    let handle = scheduler
        .submit(Recording { log: log.clone() })
        .expect("submits");
    handle.started().block_on_timeout(WAIT).expect("starts");

    let boom: CompletableActorFuture<()> = handle.control().call(|_| panic!("transient"));
    assert!(matches!(
        boom.block_on_timeout(WAIT),
        Err(SchedulerError::JobFailure(_))
    ));

    let after = handle.control().call(|_| 42u32);
    assert_eq!(after.block_on_timeout(WAIT), Ok(42));
    assert_eq!(handle.phase(), LifecyclePhase::Started);
    scheduler.stop().block_on().expect("stops");
}
