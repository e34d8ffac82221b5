//! Execution job queue. Jobs can be scheduled for immediate delivery or with
//! a countdown, which is how the monitoring task re-arms itself without a
//! dedicated timer service: each monitoring pass enqueues its own successor
//! at `next_check_at`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use uuid::Uuid;

use crate::domain::Mode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub execution_id: Uuid,
    pub pipeline_id: Uuid,
    pub symbol: String,
    pub mode: Mode,
    pub signal_context: Option<serde_json::Value>,
    pub deliver_at: DateTime<Utc>,
}

struct Scheduled(Job);

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.0.deliver_at == other.0.deliver_at
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    // Reversed so `BinaryHeap` (a max-heap) pops the earliest `deliver_at`.
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.deliver_at.cmp(&self.0.deliver_at)
    }
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job);
    fn enqueue_after(&self, job: Job, delay: chrono::Duration) {
        let mut job = job;
        job.deliver_at = Utc::now() + delay;
        self.enqueue(job);
    }

    /// Every job whose `deliver_at` is at or before `now`, removed from the
    /// queue in delivery order.
    fn drain_ready(&self, now: DateTime<Utc>) -> Vec<Job>;

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    heap: Mutex<BinaryHeap<Scheduled>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: Job) {
        self.heap.lock().push(Scheduled(job));
    }

    fn drain_ready(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut heap = self.heap.lock();
        let mut ready = Vec::new();
        while let Some(top) = heap.peek() {
            if top.0.deliver_at > now {
                break;
            }
            ready.push(heap.pop().unwrap().0);
        }
        ready
    }

    fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_at(deliver_at: DateTime<Utc>) -> Job {
        Job {
            execution_id: Uuid::new_v4(),
            pipeline_id: Uuid::new_v4(),
            symbol: "AAPL".to_string(),
            mode: Mode::Paper,
            signal_context: None,
            deliver_at,
        }
    }

    #[test]
    fn drains_only_due_jobs_in_order() {
        let queue = InMemoryJobQueue::new();
        let now = Utc::now();
        queue.enqueue(job_at(now + chrono::Duration::seconds(10)));
        queue.enqueue(job_at(now - chrono::Duration::seconds(5)));
        queue.enqueue(job_at(now - chrono::Duration::seconds(30)));

        let ready = queue.drain_ready(now);
        assert_eq!(ready.len(), 2);
        assert!(ready[0].deliver_at < ready[1].deliver_at);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn enqueue_after_applies_delay() {
        let queue = InMemoryJobQueue::new();
        let now = Utc::now();
        queue.enqueue_after(job_at(now), chrono::Duration::minutes(5));
        assert!(queue.drain_ready(now).is_empty());
        assert!(!queue.drain_ready(now + chrono::Duration::minutes(6)).is_empty());
    }
}
