//! Priority queue of pending jobs

use gpusched_core::Job;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Mutex;

struct QueueItem {
    weight: u32,
    seq: u64,
    job: Job,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.seq == other.seq
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    // Max-heap: higher weight first, then lower sequence number (FIFO within a tier)
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueueItem>,
    next_seq: u64,
}

/// Jobs ordered by tier weight (high=3, medium=2, anything else=1)
///
/// All operations go through one lock, so any number of producers may push
/// while the dispatch loop pops.
#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job; O(log n)
    pub async fn push(&self, job: Job) {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueueItem {
            weight: job.tier().weight(),
            seq,
            job,
        });
    }

    /// Remove and return the highest-weight job, `None` when empty
    pub async fn pop(&self) -> Option<Job> {
        self.inner.lock().await.heap.pop().map(|item| item.job)
    }

    /// Highest-weight job without removing it
    pub async fn peek(&self) -> Option<Job> {
        self.inner.lock().await.heap.peek().map(|item| item.job.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
