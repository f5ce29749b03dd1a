//! Priority scheduling over ready and delayed tasks.
//!
//! The scheduler only holds task ids (the task records live in the broker's
//! arena). Ready tasks sit in one FIFO per priority band; tasks waiting for
//! their next-visible-at time sit in a min-heap and are promoted to the back
//! of their band once due.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};

use chrono::{DateTime, Utc};

use jobforge_core::{Priority, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Ready(Priority),
    Delayed(Priority, DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Delayed {
    visible_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.visible_at
            .cmp(&other.visible_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Strict-priority, FIFO-within-band scheduler.
#[derive(Debug, Default)]
pub struct PriorityScheduler {
    bands: [VecDeque<TaskId>; Priority::BANDS],
    delayed: BinaryHeap<Reverse<Delayed>>,
    placements: HashMap<TaskId, Placement>,
    seq: u64,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a ready task to the back of its band.
    pub fn push_back(&mut self, task_id: TaskId, priority: Priority) {
        self.remove(task_id);
        self.bands[priority.band()].push_back(task_id);
        self.placements.insert(task_id, Placement::Ready(priority));
    }

    /// Put a ready task at the head of its band (redelivery).
    pub fn push_front(&mut self, task_id: TaskId, priority: Priority) {
        self.remove(task_id);
        self.bands[priority.band()].push_front(task_id);
        self.placements.insert(task_id, Placement::Ready(priority));
    }

    /// Hide a task until `visible_at`.
    pub fn schedule(&mut self, task_id: TaskId, priority: Priority, visible_at: DateTime<Utc>) {
        self.remove(task_id);
        self.seq += 1;
        self.delayed.push(Reverse(Delayed {
            visible_at,
            seq: self.seq,
            task_id,
        }));
        self.placements
            .insert(task_id, Placement::Delayed(priority, visible_at));
    }

    /// Move every delayed task whose time has come into its band.
    pub fn promote_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.visible_at > now {
                break;
            }
            let Some(Reverse(due)) = self.delayed.pop() else {
                break;
            };
            // Heap entries are not removed eagerly; skip stale ones.
            match self.placements.get(&due.task_id) {
                Some(Placement::Delayed(priority, at)) if *at == due.visible_at => {
                    let priority = *priority;
                    self.bands[priority.band()].push_back(due.task_id);
                    self.placements
                        .insert(due.task_id, Placement::Ready(priority));
                    promoted += 1;
                }
                _ => {}
            }
        }
        promoted
    }

    /// Take the next task to lease: highest ready band first, FIFO inside it.
    pub fn pop_next(&mut self, now: DateTime<Utc>) -> Option<(TaskId, Priority)> {
        self.promote_due(now);
        for band in (0..Priority::BANDS).rev() {
            if let Some(task_id) = self.bands[band].pop_front() {
                let priority = match self.placements.remove(&task_id) {
                    Some(Placement::Ready(p)) => p,
                    _ => Priority::new(band as i64).unwrap_or_default(),
                };
                return Some((task_id, priority));
            }
        }
        None
    }

    /// Forget a task wherever it is. Returns whether it was scheduled.
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        match self.placements.remove(&task_id) {
            Some(Placement::Ready(priority)) => {
                self.bands[priority.band()].retain(|id| *id != task_id);
                true
            }
            // The heap entry goes stale and is skipped on promotion.
            Some(Placement::Delayed(..)) => true,
            None => false,
        }
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.placements.contains_key(&task_id)
    }

    pub fn ready_len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn delayed_len(&self) -> usize {
        self.placements
            .values()
            .filter(|p| matches!(p, Placement::Delayed(..)))
            .count()
    }

    /// Ready tasks per band, index = priority.
    pub fn band_lengths(&self) -> [usize; Priority::BANDS] {
        let mut out = [0; Priority::BANDS];
        for (i, band) in self.bands.iter().enumerate() {
            out[i] = band.len();
        }
        out
    }

    /// When the earliest delayed task becomes visible.
    pub fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        self.placements
            .values()
            .filter_map(|p| match p {
                Placement::Delayed(_, at) => Some(*at),
                Placement::Ready(_) => None,
            })
            .min()
    }
}
