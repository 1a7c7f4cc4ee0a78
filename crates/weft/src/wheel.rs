//! Bucketed deadline wheel and the per-group timer service.
//!
//! The wheel hashes absolute deadlines into `ticks_per_wheel` buckets (a
//! power of two, 1ms resolution by default). Polling advances a tick cursor
//! up to the current time and collects due entries; far-future entries stay
//! in their bucket across wheel revolutions. Scheduling, cancelling and
//! polling are all O(1) amortized.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::clock::ActorClock;
use crate::subscription::TimerSubscription;

pub(crate) type TimerId = u64;

pub(crate) const DEFAULT_TICKS_PER_WHEEL: usize = 32;
const DEFAULT_RESOLUTION_MS: u64 = 1;

struct WheelEntry {
    id: TimerId,
    deadline_ms: u64,
}

pub(crate) struct DeadlineWheel {
    resolution_ms: u64,
    mask: u64,
    ticks_per_wheel: usize,
    current_tick: u64,
    buckets: Vec<Vec<WheelEntry>>,
    next_id: TimerId,
    len: usize,
}

impl DeadlineWheel {
    /// `ticks_per_wheel` must be a power of two.
    pub(crate) fn new(start_ms: u64, resolution_ms: u64, ticks_per_wheel: usize) -> Self {
        debug_assert!(ticks_per_wheel.is_power_of_two());
        Self {
            resolution_ms: resolution_ms.max(1),
            mask: ticks_per_wheel as u64 - 1,
            ticks_per_wheel,
            current_tick: start_ms / resolution_ms.max(1),
            buckets: (0..ticks_per_wheel).map(|_| Vec::new()).collect(),
            next_id: 1,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Registers an absolute deadline and returns its id.
    ///
    /// Deadlines already in the past land in the current bucket and fire on
    /// the next poll.
    pub(crate) fn schedule(&mut self, deadline_ms: u64) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let tick = (deadline_ms / self.resolution_ms).max(self.current_tick);
        let bucket = (tick & self.mask) as usize;
        self.buckets[bucket].push(WheelEntry { id, deadline_ms });
        self.len += 1;
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.iter().position(|e| e.id == id) {
                bucket.swap_remove(pos);
                self.len -= 1;
                return true;
            }
        }
        false
    }

    /// Collects every entry due at `now_ms` into `expired`, advancing the
    /// tick cursor. Returns the number of entries collected.
    pub(crate) fn poll(&mut self, now_ms: u64, expired: &mut Vec<TimerId>) -> usize {
        let target_tick = now_ms / self.resolution_ms;
        let before = expired.len();
        let mut ticks_scanned = 0;
        loop {
            let bucket = (self.current_tick & self.mask) as usize;
            let entries = &mut self.buckets[bucket];
            let mut i = 0;
            while i < entries.len() {
                if entries[i].deadline_ms <= now_ms {
                    expired.push(entries.swap_remove(i).id);
                    self.len -= 1;
                } else {
                    i += 1;
                }
            }
            if self.current_tick >= target_tick {
                break;
            }
            self.current_tick += 1;
            ticks_scanned += 1;
            // One full revolution has visited every bucket; nothing else can
            // be due, so jump the cursor to the present.
            if ticks_scanned >= self.ticks_per_wheel {
                self.current_tick = target_tick;
            }
        }
        expired.len() - before
    }
}

/// Timer registry shared by all workers of a thread group.
///
/// Workers poll it before pulling tasks; expirations are delivered outside
/// the lock so that a firing timer may re-arm itself without deadlocking.
pub(crate) struct TimerService {
    inner: Mutex<TimerServiceInner>,
}

struct TimerServiceInner {
    wheel: DeadlineWheel,
    subscriptions: FxHashMap<TimerId, Arc<TimerSubscription>>,
}

impl TimerService {
    pub(crate) fn new(start_ms: u64, ticks_per_wheel: usize) -> Self {
        Self {
            inner: Mutex::new(TimerServiceInner {
                wheel: DeadlineWheel::new(start_ms, DEFAULT_RESOLUTION_MS, ticks_per_wheel),
                subscriptions: FxHashMap::default(),
            }),
        }
    }

    pub(crate) fn schedule(&self, subscription: &Arc<TimerSubscription>, clock: &dyn ActorClock) {
        let deadline_ms = clock.millis() + subscription.delay_ms();
        let mut inner = self.inner.lock();
        let id = inner.wheel.schedule(deadline_ms);
        subscription.set_timer_id(id);
        inner
            .subscriptions
            .insert(id, Arc::clone(subscription));
        trace!(timer = id, deadline_ms, "timer armed");
    }

    pub(crate) fn remove(&self, subscription: &TimerSubscription) {
        let id = subscription.timer_id();
        if id == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.wheel.cancel(id);
        inner.subscriptions.remove(&id);
    }

    /// Fires every timer due at the clock's current time, repeating until a
    /// poll yields nothing. Callbacks run without the service lock held.
    pub(crate) fn process_expired(&self, clock: &dyn ActorClock) {
        let mut expired = Vec::new();
        loop {
            let due: Vec<Arc<TimerSubscription>> = {
                let mut inner = self.inner.lock();
                expired.clear();
                inner.wheel.poll(clock.millis(), &mut expired);
                expired
                    .iter()
                    .filter_map(|id| inner.subscriptions.remove(id))
                    .collect()
            };
            if due.is_empty() {
                return;
            }
            for subscription in due {
                subscription.on_timer_expired();
            }
        }
    }

}
