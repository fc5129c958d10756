//! Priority Queue (C3): an in-memory, priority-bucketed buffer the router
//! falls back to when no candidate is immediately available for a
//! high-priority frame. FIFO within a bucket, highest-priority bucket
//! served first, with starvation prevention for lower-priority buckets.

use crate::config::PriorityQueueConfig;
use crate::model::FrameRef;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

struct Entry {
    frame: FrameRef,
    enqueued_at: Instant,
}

struct Inner {
    /// Buckets indexed by priority 0..=10, each FIFO.
    buckets: Vec<VecDeque<Entry>>,
    consecutive_high_priority_dequeues: u32,
}

/// A starvation-prevention override fired; observable for metrics/tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarvationReason {
    ConsecutiveHighPriorityThreshold,
    MaxAgeExceeded,
}

pub struct DequeueOutcome {
    pub frame: FrameRef,
    pub starvation: Option<StarvationReason>,
}

pub struct PriorityQueue {
    config: PriorityQueueConfig,
    inner: Mutex<Inner>,
}

impl PriorityQueue {
    pub fn new(config: PriorityQueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                buckets: (0..=10).map(|_| VecDeque::new()).collect(),
                consecutive_high_priority_dequeues: 0,
            }),
        }
    }

    pub fn enqueue(&self, frame: FrameRef) {
        let mut inner = self.inner.lock().unwrap();
        let bucket = frame.priority.min(10) as usize;
        inner.buckets[bucket].push_back(Entry {
            frame,
            enqueued_at: Instant::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking dequeue: `None` if every bucket is empty. The router
    /// polls this on an interval rather than awaiting it, since this queue
    /// only ever holds overflow/retry frames, not the main flow.
    pub fn try_dequeue(&self) -> Option<DequeueOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let max_age = Duration::from_secs(self.config.max_age_seconds);

        // Rule 2: any bucket whose oldest item has aged out is served
        // immediately regardless of priority.
        for (priority, bucket) in inner.buckets.iter().enumerate() {
            if let Some(front) = bucket.front() {
                if front.enqueued_at.elapsed() >= max_age {
                    return Self::take_from(&mut inner, priority, Some(StarvationReason::MaxAgeExceeded));
                }
            }
        }

        // Rule 1: after `starvation_threshold` consecutive dequeues from
        // priority > 5, force the lowest non-empty bucket <= 5.
        if inner.consecutive_high_priority_dequeues >= self.config.starvation_threshold
            && let Some(priority) = (0..=5).find(|p| !inner.buckets[*p].is_empty())
        {
            return Self::take_from(
                &mut inner,
                priority,
                Some(StarvationReason::ConsecutiveHighPriorityThreshold),
            );
        }

        // Default: highest non-empty bucket.
        let priority = (0..=10).rev().find(|p| !inner.buckets[*p].is_empty())?;
        Self::take_from(&mut inner, priority, None)
    }

    fn take_from(inner: &mut Inner, priority: usize, starvation: Option<StarvationReason>) -> Option<DequeueOutcome> {
        let entry = inner.buckets[priority].pop_front()?;

        if starvation.is_some() {
            inner.consecutive_high_priority_dequeues = 0;
            info!(priority, reason = ?starvation, "starvation prevention fired");
        } else if priority > 5 {
            inner.consecutive_high_priority_dequeues += 1;
        } else {
            inner.consecutive_high_priority_dequeues = 0;
        }

        Some(DequeueOutcome {
            frame: entry.frame,
            starvation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn frame(priority: u8) -> FrameRef {
        FrameRef {
            frame_id: format!("f-{priority}-{}", uuid::Uuid::new_v4()),
            camera_id: "cam".to_string(),
            timestamp: Utc::now(),
            width: 1,
            height: 1,
            format: "jpeg".to_string(),
            size_bytes: 0,
            priority,
            trace_context: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn higher_priority_dequeued_first() {
        let q = PriorityQueue::new(PriorityQueueConfig {
            starvation_threshold: 1000,
            max_age_seconds: 3600,
        });
        q.enqueue(frame(1));
        q.enqueue(frame(9));
        let out = q.try_dequeue().unwrap();
        assert_eq!(out.frame.priority, 9);
        assert!(out.starvation.is_none());
    }

    #[test]
    fn fifo_within_same_bucket() {
        let q = PriorityQueue::new(PriorityQueueConfig {
            starvation_threshold: 1000,
            max_age_seconds: 3600,
        });
        let first = frame(5);
        let first_id = first.frame_id.clone();
        q.enqueue(first);
        q.enqueue(frame(5));
        let out = q.try_dequeue().unwrap();
        assert_eq!(out.frame.frame_id, first_id);
    }

    #[test]
    fn starvation_threshold_forces_low_priority_bucket() {
        let q = PriorityQueue::new(PriorityQueueConfig {
            starvation_threshold: 2,
            max_age_seconds: 3600,
        });
        q.enqueue(frame(1));
        for _ in 0..5 {
            q.enqueue(frame(9));
        }

        let first = q.try_dequeue().unwrap();
        assert_eq!(first.frame.priority, 9);
        let second = q.try_dequeue().unwrap();
        assert_eq!(second.frame.priority, 9);

        // Third dequeue should be forced to the low-priority bucket.
        let third = q.try_dequeue().unwrap();
        assert_eq!(third.frame.priority, 1);
        assert_eq!(
            third.starvation,
            Some(StarvationReason::ConsecutiveHighPriorityThreshold)
        );
    }

    #[test]
    fn empty_queue_returns_none() {
        let q = PriorityQueue::new(PriorityQueueConfig::default());
        assert!(q.try_dequeue().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn len_is_observable_across_buckets() {
        let q = PriorityQueue::new(PriorityQueueConfig::default());
        q.enqueue(frame(1));
        q.enqueue(frame(9));
        q.enqueue(frame(9));
        assert_eq!(q.len(), 3);
    }
}
