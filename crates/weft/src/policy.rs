//! Worker-local scheduling policies.
//!
//! A policy decides which priority level a worker serves next; the group
//! then supplies a task from that level. CPU workers use deficit-based
//! priority arbitration, IO workers a single FIFO level.

use std::sync::Arc;

use crate::task::ActorTask;

/// Pulls the next claimable task from a given priority level.
pub(crate) type TaskSource = Box<dyn FnMut(usize) -> Option<Arc<ActorTask>> + Send>;

pub(crate) trait SchedulingPolicy: Send {
    fn next_task(&mut self) -> Option<Arc<ActorTask>>;
}

/// Deficit-based priority arbitration.
///
/// Each level carries a fractional quota (summing to 1.0). Every round the
/// policy serves the level with the largest deficit `round * quota - served`,
/// which converges to the configured shares over time: a level with quota
/// 0.3 is selected 30 times out of every 100 rounds. If the selected level
/// has no runnable task the policy falls back through the remaining levels
/// in descending quota order.
pub(crate) struct PriorityPolicy {
    source: TaskSource,
    quotas: Vec<f64>,
    served: Vec<u64>,
    round: u64,
    /// Level indices sorted by quota, highest first. Fallback order.
    by_quota: Vec<usize>,
}

impl PriorityPolicy {
    pub(crate) fn new(quotas: Vec<f64>, source: TaskSource) -> Self {
        let served = vec![0; quotas.len()];
        let mut by_quota: Vec<usize> = (0..quotas.len()).collect();
        by_quota.sort_by(|&a, &b| {
            quotas[b]
                .partial_cmp(&quotas[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        Self {
            source,
            quotas,
            served,
            round: 0,
            by_quota,
        }
    }

    fn select_level(&self) -> usize {
        let mut best = 0;
        let mut best_deficit = f64::MIN;
        for (level, quota) in self.quotas.iter().enumerate() {
            let deficit = quota * self.round as f64 - self.served[level] as f64;
            if deficit > best_deficit {
                best_deficit = deficit;
                best = level;
            }
        }
        best
    }
}

impl SchedulingPolicy for PriorityPolicy {
    fn next_task(&mut self) -> Option<Arc<ActorTask>> {
        self.round += 1;
        let selected = self.select_level();
        self.served[selected] += 1;

        if let Some(task) = (self.source)(selected) {
            return Some(task);
        }
        // The selected level is idle; try the others, highest quota first.
        for i in 0..self.by_quota.len() {
            let level = self.by_quota[i];
            if level == selected {
                continue;
            }
            if let Some(task) = (self.source)(level) {
                return Some(task);
            }
        }
        None
    }
}

/// Single-level FIFO policy for IO-bound workers.
pub(crate) struct FifoPolicy {
    source: TaskSource,
}

impl FifoPolicy {
    pub(crate) fn new(source: TaskSource) -> Self {
        Self { source }
    }
}

impl SchedulingPolicy for FifoPolicy {
    fn next_task(&mut self) -> Option<Arc<ActorTask>> {
        (self.source)(0)
    }
}
