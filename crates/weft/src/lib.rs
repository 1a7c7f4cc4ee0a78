//! weft — a cooperative actor scheduler.
//!
//! Lightweight actors with single-writer semantics are multiplexed onto a
//! small, fixed set of worker threads: a CPU-bound group with
//! priority-quota arbitration, an IO-bound FIFO group and an elastic
//! blocking pool for work that may stall. Tasks move between workers
//! through lock-free queues with stealing; timers, conditions and channel
//! consumers wake actors without ever running user code off the owning
//! task.
//!
//! ```no_run
//! use weft::{Actor, ActorControl, ActorScheduler};
//!
//! struct Greeter;
//! impl Actor for Greeter {
//!     fn on_actor_started(&mut self, ctl: &ActorControl) {
//!         ctl.run(|_| println!("hello from the scheduler"));
//!     }
//! }
//!
//! let scheduler = ActorScheduler::builder().build().unwrap();
//! scheduler.start().unwrap();
//! let handle = scheduler.submit(Greeter).unwrap();
//! handle.started().block_on().unwrap();
//! scheduler.stop().block_on().unwrap();
//! ```

mod actor;
mod blocking;
mod clock;
mod contract;
mod error;
mod executor;
mod future;
mod group;
mod job;
mod policy;
mod queue;
mod retry;
mod scheduler;
mod subscription;
mod task;
pub mod testing;
mod wheel;
mod worker;

pub use actor::{Actor, ActorControl};
pub use clock::{ActorClock, ControlledClock, SystemClock};
pub use contract::{BinaryValue, BlockingAction};
pub use error::{SchedulerError, SchedulerResult};
pub use executor::SchedulingHints;
pub use future::CompletableActorFuture;
pub use retry::{
    BackOffRetryStrategy, RecoverableRetryStrategy, RetryOperation, RetryStrategy,
    TerminateCondition,
};
pub use scheduler::{ActorHandle, ActorScheduler, ActorSchedulerBuilder};
pub use subscription::{
    ActorCondition, ActorConditions, ChannelConsumer, ConsumableChannel, TimerHandle,
};
pub use task::LifecyclePhase;
pub use worker::{DefaultThreadFactory, ThreadFactory};
