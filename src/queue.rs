//! In-memory priority queue of upcoming occurrences.
//!
//! A min-heap keyed by `(scheduled_for, job_id)` with a side map from
//! `job_id` to the live entry. The queue holds at most one entry per job:
//! pushing for a job that is already queued replaces its entry. Removal
//! and replacement are lazy; superseded heap items are discarded when
//! they surface at the root, with the side map as the authority for which
//! items are live.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::core::JobId;

/// A queued occurrence or retry, waiting to come due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    /// When this entry becomes due. For retries this is the backoff target,
    /// not the occurrence time.
    pub scheduled_for: DateTime<Utc>,
    /// 1-based attempt number this entry will dispatch as.
    pub attempt: u32,
    /// The instant the first attempt of this occurrence was due. Stays
    /// fixed across retries so cadence planning is drift-free.
    pub origin_scheduled_for: DateTime<Utc>,
}

impl QueueEntry {
    /// A first-attempt entry for an occurrence at `at`.
    pub fn occurrence(job_id: JobId, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            scheduled_for: at,
            attempt: 1,
            origin_scheduled_for: at,
        }
    }

    /// A retry of this occurrence, due at `at`.
    pub fn retry(&self, at: DateTime<Utc>) -> Self {
        Self {
            job_id: self.job_id,
            scheduled_for: at,
            attempt: self.attempt + 1,
            origin_scheduled_for: self.origin_scheduled_for,
        }
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // job_id is the deterministic tiebreak for equal fire times.
        self.scheduled_for
            .cmp(&other.scheduled_for)
            .then_with(|| self.job_id.cmp(&other.job_id))
            .then_with(|| self.attempt.cmp(&other.attempt))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of queue entries with at most one live entry per job.
#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    live: HashMap<JobId, QueueEntry>,
}

impl DueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any existing entry for the same job.
    pub fn push(&mut self, entry: QueueEntry) {
        self.live.insert(entry.job_id, entry);
        self.heap.push(Reverse(entry));
    }

    /// The earliest live entry, if any.
    pub fn peek(&mut self) -> Option<QueueEntry> {
        self.discard_dead();
        self.heap.peek().map(|Reverse(entry)| *entry)
    }

    /// Pop the earliest entry iff it is due at `now`.
    pub fn pop_if_due(&mut self, now: DateTime<Utc>) -> Option<QueueEntry> {
        let root = self.peek()?;
        if root.scheduled_for > now {
            return None;
        }
        self.heap.pop();
        self.live.remove(&root.job_id);
        Some(root)
    }

    /// Remove the entry for a job. Returns whether one was queued.
    pub fn remove(&mut self, job_id: &JobId) -> bool {
        self.live.remove(job_id).is_some()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.live.contains_key(job_id)
    }

    /// Fire time of the earliest live entry.
    pub fn next_due_at(&mut self) -> Option<DateTime<Utc>> {
        self.peek().map(|entry| entry.scheduled_for)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Drop heap items that were superseded by a later push or removed.
    fn discard_dead(&mut self) {
        while let Some(root) = self.heap.peek().map(|Reverse(entry)| *entry) {
            match self.live.get(&root.job_id) {
                Some(live) if *live == root => return,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}
