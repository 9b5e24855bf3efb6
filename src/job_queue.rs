//! Priority job queue with per-tile exclusivity, coalescing, deferral and
//! rate limiting.
//!
//! Grounded on the teacher's `scheduler.rs`: a `Mutex<HashSet<TileCoord>>`
//! claim/release discipline dedups concurrent requests for the same tile
//! (spec invariant I1, "at most one in-flight build per tile"), generalized
//! here from a flat dedup set into a priority-ordered queue with distinct
//! job reasons, plus the condition-variable wait/notify pair the teacher
//! does not need (its consumers poll synchronously) but spec §4.6 requires
//! (`requiredTilesPresent`, `allJobsDone`).

use crate::tile_db::RowKey;
use parking_lot::{Condvar, Mutex};
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Why a tile needs (re)building. Higher-priority reasons jump the queue
/// ahead of lower-priority ones regardless of arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reason {
    /// Geometry under the tile changed; must be rebuilt to stay correct.
    Invalidated,
    /// An agent needs this tile and it isn't built yet.
    OnDemand,
    /// Speculative build for the active window around an agent.
    Prefetch,
}

impl Reason {
    fn priority_rank(self) -> u8 {
        match self {
            Reason::Invalidated => 2,
            Reason::OnDemand => 1,
            Reason::Prefetch => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Job {
    pub key: RowKey,
    pub reason: Reason,
    /// Sequence number at time of enqueue, used as a FIFO tiebreak between
    /// jobs that share a reason.
    sequence: u64,
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.reason
            .priority_rank()
            .cmp(&other.reason.priority_rank())
            // BinaryHeap is a max-heap; older (lower sequence) should win on
            // a priority tie, so reverse the sequence comparison.
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Inner {
    heap: BinaryHeap<Job>,
    in_flight: HashSet<RowKey>,
    /// Jobs whose key collided with an in-flight build; re-queued once that
    /// build releases its claim (spec's "coalesce concurrent requests for
    /// the same tile into one build" behavior).
    deferred: Vec<Job>,
    next_sequence: u64,
    /// Rolling window of completion timestamps, used to enforce
    /// `max_per_second`.
    recent_completions: Vec<Instant>,
    shutting_down: bool,
}

/// Bounded-rate, priority, coalescing job queue.
pub struct JobQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    all_done: Condvar,
    max_per_second: Option<u32>,
}

impl JobQueue {
    pub fn new(max_per_second: Option<u32>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                in_flight: HashSet::new(),
                deferred: Vec::new(),
                next_sequence: 0,
                recent_completions: Vec::new(),
                shutting_down: false,
            }),
            not_empty: Condvar::new(),
            all_done: Condvar::new(),
            max_per_second,
        }
    }

    /// Enqueue a build for `key`. If `key` is already in flight or already
    /// queued, this coalesces into the existing entry instead of creating a
    /// second one, promoting its reason to `max(existing, new)` (spec
    /// §4.5: "adding a job for a tile already queued replaces its priority
    /// with max(existing, new)").
    pub fn enqueue(&self, key: RowKey, reason: Reason) {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }

        if inner.in_flight.contains(&key) {
            // A build for this tile is running; defer so a fresh job is
            // queued once it releases, picking up anything that changed
            // during the in-flight build.
            if let Some(slot) = inner.deferred.iter_mut().find(|j| j.key == key) {
                if reason.priority_rank() > slot.reason.priority_rank() {
                    slot.reason = reason;
                }
            } else {
                let sequence = inner.next_sequence;
                inner.next_sequence += 1;
                inner.deferred.push(Job { key, reason, sequence });
            }
            return;
        }

        let existing_rank = inner
            .heap
            .iter()
            .find(|j| j.key == key)
            .map(|j| j.reason.priority_rank());
        if let Some(existing_rank) = existing_rank {
            if reason.priority_rank() > existing_rank {
                let mut items: Vec<Job> = std::mem::take(&mut inner.heap).into_vec();
                if let Some(slot) = items.iter_mut().find(|j| j.key == key) {
                    slot.reason = reason;
                }
                inner.heap = BinaryHeap::from(items);
                drop(inner);
                self.not_empty.notify_one();
            }
            return;
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(Job { key, reason, sequence });
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Claim the next job to run, honoring the configured rate limit.
    /// Blocks until a job is available, the rate-limit window opens up, or
    /// the queue is shut down (in which case `None` is returned).
    pub fn claim_next(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        loop {
            if inner.shutting_down && inner.heap.is_empty() {
                return None;
            }

            if let Some(wait) = self.rate_limit_wait(&inner) {
                self.not_empty.wait_for(&mut inner, wait);
                continue;
            }

            match inner.heap.pop() {
                Some(job) => {
                    inner.in_flight.insert(job.key);
                    return Some(job);
                }
                None => {
                    self.not_empty.wait(&mut inner);
                }
            }
        }
    }

    fn rate_limit_wait(&self, inner: &Inner) -> Option<Duration> {
        let max = self.max_per_second?;
        let now = Instant::now();
        let window_start = now - Duration::from_secs(1);
        let count = inner
            .recent_completions
            .iter()
            .filter(|t| **t >= window_start)
            .count();
        if count < max as usize {
            return None;
        }
        let oldest_in_window = inner
            .recent_completions
            .iter()
            .filter(|t| **t >= window_start)
            .min()
            .copied()?;
        let wait_until = oldest_in_window + Duration::from_secs(1);
        Some(wait_until.saturating_duration_since(now).max(Duration::from_millis(1)))
    }

    /// Release the in-flight claim on `key` after a build finishes
    /// (successfully or not). Any jobs deferred while the claim was held
    /// are re-queued.
    pub fn release(&self, key: RowKey) {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(&key);

        if self.max_per_second.is_some() {
            inner.recent_completions.push(Instant::now());
            let cutoff = Instant::now() - Duration::from_secs(2);
            inner.recent_completions.retain(|t| *t >= cutoff);
        }

        let mut requeued = false;
        let deferred_for_key: Vec<Job> = {
            let mut remaining = Vec::new();
            let mut matched = Vec::new();
            for job in inner.deferred.drain(..) {
                if job.key == key {
                    matched.push(job);
                } else {
                    remaining.push(job);
                }
            }
            inner.deferred = remaining;
            matched
        };
        if let Some(job) = deferred_for_key.into_iter().next() {
            inner.heap.push(job);
            requeued = true;
        }

        let idle = inner.heap.is_empty() && inner.in_flight.is_empty() && inner.deferred.is_empty();
        drop(inner);

        if requeued {
            self.not_empty.notify_one();
        }
        if idle {
            self.all_done.notify_all();
        }
    }

    pub fn is_in_flight(&self, key: &RowKey) -> bool {
        self.inner.lock().in_flight.contains(key)
    }

    pub fn pending_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.heap.len() + inner.in_flight.len() + inner.deferred.len()
    }

    /// Block the caller until the queue has no pending, deferred or
    /// in-flight jobs at all (spec's `allJobsDone`).
    pub fn wait_all_done(&self) {
        let mut inner = self.inner.lock();
        while !(inner.heap.is_empty() && inner.in_flight.is_empty() && inner.deferred.is_empty()) {
            self.all_done.wait(&mut inner);
        }
    }

    /// Block the caller until every tile in `keys` is neither queued,
    /// deferred nor in-flight (spec's `requiredTilesPresent`: the caller is
    /// expected to check the tile store itself once this returns).
    pub fn wait_tiles_settled(&self, keys: &[RowKey]) {
        let mut inner = self.inner.lock();
        loop {
            let pending = keys.iter().any(|k| {
                inner.in_flight.contains(k)
                    || inner.heap.iter().any(|j| j.key == *k)
                    || inner.deferred.iter().any(|j| j.key == *k)
            });
            if !pending {
                return;
            }
            self.all_done.wait(&mut inner);
        }
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutting_down = true;
        drop(inner);
        self.not_empty.notify_all();
        self.all_done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{AgentBounds, CollisionShapeKind};
    use crate::tiles::{TilePosition, WorldspaceId};

    fn key(x: i32, y: i32) -> RowKey {
        let bounds = AgentBounds::new(CollisionShapeKind::Cylinder, [0.3, 0.3, 0.9]);
        RowKey::new(WorldspaceId(1), TilePosition::new(x, y), &bounds)
    }

    #[test]
    fn higher_priority_reason_served_first() {
        let q = JobQueue::new(None);
        q.enqueue(key(0, 0), Reason::Prefetch);
        q.enqueue(key(1, 0), Reason::Invalidated);

        let job = q.claim_next().unwrap();
        assert_eq!(job.reason, Reason::Invalidated);
    }

    #[test]
    fn duplicate_enqueue_for_in_flight_tile_is_deferred_then_requeued() {
        let q = JobQueue::new(None);
        q.enqueue(key(0, 0), Reason::OnDemand);
        let job = q.claim_next().unwrap();
        assert!(q.is_in_flight(&job.key));

        // Another request for the same tile arrives while it's building.
        q.enqueue(key(0, 0), Reason::OnDemand);
        assert_eq!(q.pending_len(), 1, "should be tracked as deferred, not duplicated in the heap");

        q.release(job.key);
        assert!(!q.is_in_flight(&job.key));
        // The deferred request should have been requeued.
        let job2 = q.claim_next().unwrap();
        assert_eq!(job2.key, job.key);
    }

    #[test]
    fn coalesced_enqueue_upgrades_to_higher_priority_reason() {
        let q = JobQueue::new(None);
        q.enqueue(key(0, 0), Reason::Prefetch);
        q.enqueue(key(1, 0), Reason::OnDemand);
        // A second request for the already-queued (0,0) tile arrives with a
        // higher-priority reason; it must promote the existing entry rather
        // than leaving it stuck at Prefetch.
        q.enqueue(key(0, 0), Reason::Invalidated);

        assert_eq!(q.pending_len(), 2, "coalescing must not create a second entry");
        let job = q.claim_next().unwrap();
        assert_eq!(job.key, key(0, 0));
        assert_eq!(job.reason, Reason::Invalidated);
    }

    #[test]
    fn coalesced_enqueue_does_not_downgrade_priority() {
        let q = JobQueue::new(None);
        q.enqueue(key(0, 0), Reason::Invalidated);
        q.enqueue(key(0, 0), Reason::Prefetch);

        let job = q.claim_next().unwrap();
        assert_eq!(job.reason, Reason::Invalidated);
    }

    #[test]
    fn wait_all_done_unblocks_after_release() {
        let q = std::sync::Arc::new(JobQueue::new(None));
        q.enqueue(key(2, 2), Reason::OnDemand);
        let job = q.claim_next().unwrap();

        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            q2.wait_all_done();
        });

        std::thread::sleep(Duration::from_millis(20));
        q.release(job.key);
        handle.join().unwrap();
    }
}
