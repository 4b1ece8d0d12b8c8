//! Bounded action queue with configurable overflow handling
//!
//! Uses crossbeam_queue::ArrayQueue for lock-free storage and tokio::sync::Notify
//! to park producers (BLOCK strategy) and consumers until space or work appears.

use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// What happens when a producer meets a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Wait up to the put timeout for space
    Block,
    /// Evict the head and accept the incoming item
    DropOldest,
    /// Discard the incoming item
    DropNewest,
    /// Fail immediately
    Reject,
}

impl fmt::Display for OverflowStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OverflowStrategy::Block => "BLOCK",
            OverflowStrategy::DropOldest => "DROP_OLDEST",
            OverflowStrategy::DropNewest => "DROP_NEWEST",
            OverflowStrategy::Reject => "REJECT",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for OverflowStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "block" => Ok(OverflowStrategy::Block),
            "drop_oldest" => Ok(OverflowStrategy::DropOldest),
            "drop_newest" => Ok(OverflowStrategy::DropNewest),
            "reject" => Ok(OverflowStrategy::Reject),
            other => Err(format!("unknown overflow strategy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub strategy: OverflowStrategy,
    /// Utilization ratio that raises an alert
    pub alert_threshold: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            strategy: OverflowStrategy::Block,
            alert_threshold: 0.8,
        }
    }
}

/// An item plus the moment it entered the queue
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    pub item: T,
    pub enqueued_at: DateTime<Utc>,
}

/// Result of a put
#[derive(Debug)]
pub enum PutOutcome<T> {
    Accepted,
    /// Incoming item accepted; this head item was evicted to make room
    DroppedOldest(QueueItem<T>),
    /// Incoming item discarded
    DroppedNewest(T),
    /// Incoming item refused (REJECT, or BLOCK timed out)
    Rejected(T),
}

impl<T> PutOutcome<T> {
    /// Whether the incoming item made it into the queue
    pub fn is_accepted(&self) -> bool {
        matches!(self, PutOutcome::Accepted | PutOutcome::DroppedOldest(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            PutOutcome::Accepted => "accepted",
            PutOutcome::DroppedOldest(_) => "dropped_oldest",
            PutOutcome::DroppedNewest(_) => "dropped_newest",
            PutOutcome::Rejected(_) => "rejected",
        }
    }
}

/// Counter and gauge snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub capacity: usize,
    pub depth: usize,
    pub utilization: f64,
    pub strategy: OverflowStrategy,
    pub accepted: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub alerts_raised: u64,
}

/// Fixed-capacity hand-off between producers and execution workers.
///
/// FIFO under BLOCK and REJECT; the drop strategies give no global ordering.
pub struct BoundedActionQueue<T> {
    queue: ArrayQueue<QueueItem<T>>,
    strategy: OverflowStrategy,
    alert_threshold: f64,
    not_empty: Notify,
    not_full: Notify,
    alert_active: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    alerts_raised: AtomicU64,
}

impl<T> BoundedActionQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            queue: ArrayQueue::new(config.capacity.max(1)),
            strategy: config.strategy,
            alert_threshold: config.alert_threshold,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            alert_active: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> OverflowStrategy {
        self.strategy
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn utilization(&self) -> f64 {
        self.queue.len() as f64 / self.queue.capacity() as f64
    }

    /// Offer an item. `timeout` only matters under BLOCK.
    pub async fn put(&self, item: T, timeout: Duration) -> PutOutcome<T> {
        let queued = QueueItem {
            item,
            enqueued_at: Utc::now(),
        };

        let outcome = match self.strategy {
            OverflowStrategy::Block => self.put_blocking(queued, timeout).await,
            OverflowStrategy::DropOldest => self.put_evicting(queued),
            OverflowStrategy::DropNewest => match self.queue.push(queued) {
                Ok(()) => PutOutcome::Accepted,
                Err(back) => PutOutcome::DroppedNewest(back.item),
            },
            OverflowStrategy::Reject => match self.queue.push(queued) {
                Ok(()) => PutOutcome::Accepted,
                Err(back) => PutOutcome::Rejected(back.item),
            },
        };

        match &outcome {
            PutOutcome::Accepted => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
            }
            PutOutcome::DroppedOldest(_) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PutOutcome::DroppedNewest(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PutOutcome::Rejected(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }

        if outcome.is_accepted() {
            self.not_empty.notify_one();
        } else {
            debug!(strategy = %self.strategy, outcome = outcome.label(), "Queue refused item");
        }

        self.observe_utilization();
        outcome
    }

    async fn put_blocking(&self, queued: QueueItem<T>, timeout: Duration) -> PutOutcome<T> {
        let deadline = Instant::now() + timeout;
        let mut pending = queued;

        loop {
            let space = self.not_full.notified();
            match self.queue.push(pending) {
                Ok(()) => return PutOutcome::Accepted,
                Err(back) => pending = back,
            }

            if timeout.is_zero() || Instant::now() >= deadline {
                return PutOutcome::Rejected(pending.item);
            }

            if timeout_at(deadline, space).await.is_err() {
                // One last chance: a consumer may have freed a slot right at the deadline
                return match self.queue.push(pending) {
                    Ok(()) => PutOutcome::Accepted,
                    Err(back) => PutOutcome::Rejected(back.item),
                };
            }
        }
    }

    fn put_evicting(&self, queued: QueueItem<T>) -> PutOutcome<T> {
        let mut pending = queued;
        let mut evicted = None;

        loop {
            match self.queue.push(pending) {
                Ok(()) => {
                    return match evicted {
                        Some(head) => PutOutcome::DroppedOldest(head),
                        None => PutOutcome::Accepted,
                    }
                }
                Err(back) => {
                    pending = back;
                    // Under contention a second eviction may be needed; only the first is reported
                    if let Some(head) = self.queue.pop() {
                        if evicted.is_some() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        } else {
                            evicted = Some(head);
                        }
                    }
                }
            }
        }
    }

    /// Take the oldest item, waiting up to `timeout` for one to arrive
    pub async fn get(&self, timeout: Duration) -> Option<QueueItem<T>> {
        let deadline = Instant::now() + timeout;

        loop {
            let work = self.not_empty.notified();
            if let Some(item) = self.queue.pop() {
                self.not_full.notify_one();
                self.observe_utilization();
                return Some(item);
            }

            if timeout.is_zero() || Instant::now() >= deadline {
                return None;
            }

            if timeout_at(deadline, work).await.is_err() {
                let item = self.queue.pop()?;
                self.not_full.notify_one();
                self.observe_utilization();
                return Some(item);
            }
        }
    }

    /// Take the oldest item without waiting
    pub fn try_get(&self) -> Option<QueueItem<T>> {
        let item = self.queue.pop()?;
        self.not_full.notify_one();
        self.observe_utilization();
        Some(item)
    }

    /// Emit the utilization gauge and raise the alert on an upward crossing.
    /// The alert re-arms once utilization drops below the threshold.
    fn observe_utilization(&self) {
        let utilization = self.utilization();
        debug!(
            depth = self.queue.len(),
            capacity = self.queue.capacity(),
            utilization,
            "Queue utilization"
        );

        if utilization >= self.alert_threshold {
            if !self.alert_active.swap(true, Ordering::AcqRel) {
                self.alerts_raised.fetch_add(1, Ordering::Relaxed);
                warn!(
                    depth = self.queue.len(),
                    capacity = self.queue.capacity(),
                    utilization,
                    threshold = self.alert_threshold,
                    "Action queue utilization above threshold"
                );
            }
        } else {
            self.alert_active.store(false, Ordering::Release);
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            capacity: self.queue.capacity(),
            depth: self.queue.len(),
            utilization: self.utilization(),
            strategy: self.strategy,
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize, strategy: OverflowStrategy) -> BoundedActionQueue<&'static str> {
        BoundedActionQueue::new(QueueConfig {
            capacity,
            strategy,
            alert_threshold: 0.8,
        })
    }

    async fn drain(queue: &BoundedActionQueue<&'static str>) -> Vec<&'static str> {
        let mut items = Vec::new();
        while let Some(queued) = queue.get(Duration::ZERO).await {
            items.push(queued.item);
        }
        items
    }

    #[tokio::test]
    async fn test_block_with_zero_timeout_rejects_and_leaves_queue_unchanged() {
        let queue = queue(2, OverflowStrategy::Block);

        assert!(queue.put("A", Duration::ZERO).await.is_accepted());
        assert!(queue.put("B", Duration::ZERO).await.is_accepted());

        match queue.put("C", Duration::ZERO).await {
            PutOutcome::Rejected(item) => assert_eq!(item, "C"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(drain(&queue).await, vec!["A", "B"]);
        assert_eq!(queue.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_head() {
        let queue = queue(2, OverflowStrategy::DropOldest);
        queue.put("A", Duration::ZERO).await;
        queue.put("B", Duration::ZERO).await;

        match queue.put("C", Duration::ZERO).await {
            PutOutcome::DroppedOldest(evicted) => assert_eq!(evicted.item, "A"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(drain(&queue).await, vec!["B", "C"]);
        let metrics = queue.metrics();
        assert_eq!(metrics.accepted, 3);
        assert_eq!(metrics.dropped, 1);
    }

    #[tokio::test]
    async fn test_drop_newest_discards_incoming() {
        let queue = queue(1, OverflowStrategy::DropNewest);
        queue.put("A", Duration::ZERO).await;

        assert!(matches!(
            queue.put("B", Duration::from_secs(5)).await,
            PutOutcome::DroppedNewest("B")
        ));
        assert_eq!(drain(&queue).await, vec!["A"]);
    }

    #[tokio::test]
    async fn test_reject_does_not_wait() {
        let queue = queue(1, OverflowStrategy::Reject);
        queue.put("A", Duration::ZERO).await;

        let started = std::time::Instant::now();
        assert!(matches!(
            queue.put("B", Duration::from_secs(5)).await,
            PutOutcome::Rejected("B")
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_get_times_out_on_empty_queue() {
        let queue = queue(1, OverflowStrategy::Block);
        assert!(queue.get(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_alert_latches_and_rearms() {
        let queue = queue(5, OverflowStrategy::Reject);

        for item in ["A", "B", "C", "D"] {
            queue.put(item, Duration::ZERO).await;
        }
        assert_eq!(queue.metrics().alerts_raised, 1);

        // Still above threshold: no second alert
        queue.put("E", Duration::ZERO).await;
        queue.put("F", Duration::ZERO).await;
        assert_eq!(queue.metrics().alerts_raised, 1);

        queue.try_get();
        queue.try_get();
        queue.put("G", Duration::ZERO).await;
        assert_eq!(queue.metrics().alerts_raised, 2);
    }
}
