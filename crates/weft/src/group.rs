//! Per-level task routing across worker-owned queues.

use std::sync::Arc;

use rand::Rng;

use crate::queue::TaskQueue;
use crate::task::ActorTask;

/// One queue per worker plus steal fallback.
///
/// `next_task(worker)` prefers the worker's own queue, then probes the other
/// queues starting from a random offset so that no victim is favored.
pub(crate) struct WorkStealingGroup {
    queues: Vec<TaskQueue>,
}

impl WorkStealingGroup {
    pub(crate) fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        Self {
            queues: (0..worker_count).map(|_| TaskQueue::new()).collect(),
        }
    }

    pub(crate) fn submit(&self, task: Arc<ActorTask>, worker: usize) {
        self.queues[worker % self.queues.len()].append(task);
    }

    pub(crate) fn next_task(&self, worker: usize) -> Option<Arc<ActorTask>> {
        let worker = worker % self.queues.len();
        if let Some(task) = self.queues[worker].pop() {
            return Some(task);
        }
        let n = self.queues.len();
        if n == 1 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..n);
        for i in 0..n {
            let victim = (start + i) % n;
            if victim == worker {
                continue;
            }
            if let Some(task) = self.queues[victim].try_steal() {
                return Some(task);
            }
        }
        None
    }

    /// True while any queue still has linked nodes. Stale nodes count until
    /// the owner discards them, so this may overestimate; never returns
    /// false while unclaimed work exists.
    pub(crate) fn has_linked_nodes(&self) -> bool {
        self.queues.iter().any(|q| !q.is_empty())
    }
}

/// A [`WorkStealingGroup`] per priority level.
///
/// Stealing happens within a level only; cross-level arbitration is the
/// scheduling policy's job.
pub(crate) struct MultiLevelGroup {
    levels: Vec<WorkStealingGroup>,
}

impl MultiLevelGroup {
    pub(crate) fn new(levels: usize, worker_count: usize) -> Self {
        let levels = levels.max(1);
        Self {
            levels: (0..levels)
                .map(|_| WorkStealingGroup::new(worker_count))
                .collect(),
        }
    }

    pub(crate) fn submit(&self, task: Arc<ActorTask>, level: usize, worker: usize) {
        self.levels[level.min(self.levels.len() - 1)].submit(task, worker);
    }

    pub(crate) fn next_task(&self, level: usize, worker: usize) -> Option<Arc<ActorTask>> {
        self.levels.get(level)?.next_task(worker)
    }

    pub(crate) fn has_linked_nodes(&self) -> bool {
        self.levels.iter().any(|l| l.has_linked_nodes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Actor;

    struct Noop;
    impl Actor for Noop {}

    fn task() -> Arc<ActorTask> {
        ActorTask::new(Box::new(Noop), 0)
    }

    #[test]
    fn test_own_queue_preferred() {
        let group = WorkStealingGroup::new(2);
        let mine = task();
        let other = task();
        group.submit(Arc::clone(&other), 1);
        group.submit(Arc::clone(&mine), 0);

        let next = group.next_task(0).unwrap();
        assert!(Arc::ptr_eq(&next, &mine));
    }

    #[test]
    fn test_steals_when_own_queue_empty() {
        let group = WorkStealingGroup::new(3);
        let victim_task = task();
        group.submit(Arc::clone(&victim_task), 2);

        let stolen = group.next_task(0).unwrap();
        assert!(Arc::ptr_eq(&stolen, &victim_task));
        assert!(group.next_task(0).is_none());
    }

    #[test]
    fn test_levels_are_isolated() {
        let group = MultiLevelGroup::new(2, 1);
        let high = task();
        group.submit(Arc::clone(&high), 1, 0);

        assert!(group.next_task(0, 0).is_none());
        let found = group.next_task(1, 0).unwrap();
        assert!(Arc::ptr_eq(&found, &high));
    }

    #[test]
    fn test_level_clamped_to_range() {
        let group = MultiLevelGroup::new(2, 1);
        group.submit(task(), 9, 0);
        assert!(group.next_task(1, 0).is_some());
    }
}
