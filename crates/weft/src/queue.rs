//! Lock-free multi-producer task queue with stealing.
//!
//! Each worker owns one queue. Producers append at the tail with a single
//! swap; the owning worker pops from the head; other workers steal by
//! scanning backwards from the tail over `prev` links. A task is never
//! removed from the middle: consumers arbitrate through
//! [`ActorTask::claim`], and nodes that lost their claim are dropped lazily
//! by the owner when it reaches them. Retired nodes are reclaimed through
//! epoch-based garbage collection, so a stealer holding a pin can always
//! finish its scan safely.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::epoch::{self, Atomic, Owned};
use crossbeam::utils::CachePadded;

use crate::task::ActorTask;

struct Node {
    /// `None` only for the sentinel.
    task: Option<Arc<ActorTask>>,
    /// Task state snapshot taken at append time; consumers claim against it.
    state_count: u64,
    prev: Atomic<Node>,
    next: Atomic<Node>,
}

impl Node {
    fn sentinel() -> Self {
        Self {
            task: None,
            state_count: 0,
            prev: Atomic::null(),
            next: Atomic::null(),
        }
    }
}

pub(crate) struct TaskQueue {
    head: CachePadded<Atomic<Node>>,
    tail: CachePadded<Atomic<Node>>,
}

unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        let sentinel = Owned::new(Node::sentinel());
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = sentinel.into_shared(guard);
            Self {
                head: CachePadded::new(Atomic::from(sentinel)),
                tail: CachePadded::new(Atomic::from(sentinel)),
            }
        }
    }

    /// Appends a task. Safe to call from any thread.
    ///
    /// The node records the task's current state count; a consumer that
    /// fails to claim against it treats the node as stale.
    pub(crate) fn append(&self, task: Arc<ActorTask>) {
        let guard = &epoch::pin();
        let state_count = task.state_count();
        let node = Owned::new(Node {
            task: Some(task),
            state_count,
            prev: Atomic::null(),
            next: Atomic::null(),
        })
        .into_shared(guard);

        let prev = self.tail.swap(node, Ordering::AcqRel, guard);
        unsafe {
            node.deref().prev.store(prev, Ordering::Release);
            prev.deref().next.store(node, Ordering::Release);
        }
    }

    /// Pops the next claimable task. Only the owning worker may call this.
    ///
    /// Nodes whose claim fails (the task was stolen or re-enqueued under a
    /// newer state) are unlinked and retired on the way.
    pub(crate) fn pop(&self) -> Option<Arc<ActorTask>> {
        let guard = &epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                return None;
            }
            let node = unsafe { next.deref() };
            let task = node.task.clone();
            let state_count = node.state_count;

            // The consumed node becomes the new sentinel; the old head is
            // unreachable for new consumers and can be retired.
            self.head.store(next, Ordering::Release);
            unsafe {
                guard.defer_destroy(head);
            }

            if let Some(task) = task {
                if task.claim(state_count) {
                    return Some(task);
                }
            }
        }
    }

    /// Attempts to steal a task, scanning from the tail towards the head.
    ///
    /// Never unlinks nodes; a successful claim leaves the node in place for
    /// the owner to discard lazily.
    pub(crate) fn try_steal(&self) -> Option<Arc<ActorTask>> {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        let mut cursor = self.tail.load(Ordering::Acquire, guard);
        while !cursor.is_null() && cursor != head {
            let node = unsafe { cursor.deref() };
            if let Some(task) = &node.task {
                if task.claim(node.state_count) {
                    return Some(Arc::clone(task));
                }
            }
            cursor = node.prev.load(Ordering::Acquire, guard);
        }
        None
    }

    /// True when no node is linked behind the sentinel. Racy by nature; used
    /// only for idle heuristics.
    pub(crate) fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, guard)
            .is_null()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Sole owner at this point; free the chain without deferral.
        unsafe {
            let guard = epoch::unprotected();
            let mut cursor = self.head.load(Ordering::Relaxed, guard);
            while !cursor.is_null() {
                let next = cursor.deref().next.load(Ordering::Relaxed, guard);
                drop(cursor.into_owned());
                cursor = next;
            }
        }
    }
}
