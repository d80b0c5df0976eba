//! Work queue of observed object IDs.
//!
//! Single logical producer side (the watchers) and a worker-pool consumer
//! side. Duplicates collapse by ID; the queue is bounded so a watch storm
//! cannot grow memory without limit. Overflow sheds the oldest pending ID
//! and flags that a full resync is needed.

use std::sync::Mutex;

use indexmap::IndexSet;
use rudder_core::ObjectId;
use tokio::sync::Notify;

/// Bounded, deduplicating FIFO of object IDs awaiting remediation.
#[derive(Debug)]
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug)]
struct QueueInner {
    pending: IndexSet<ObjectId>,
    shed: bool,
}

impl WorkQueue {
    /// Creates a queue holding at most `capacity` pending IDs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: IndexSet::new(),
                shed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues an ID. A duplicate of a pending ID is a no-op; at capacity
    /// the oldest pending ID is shed and the resync flag raised.
    pub fn add(&self, id: ObjectId) {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        if inner.pending.contains(&id) {
            return;
        }
        if inner.pending.len() >= self.capacity {
            inner.pending.shift_remove_index(0);
            inner.shed = true;
        }
        inner.pending.insert(id);
        drop(inner);
        self.notify.notify_one();
    }

    /// Dequeues the oldest pending ID, waiting for one to arrive.
    pub async fn take(&self) -> ObjectId {
        loop {
            {
                let mut inner = self.inner.lock().expect("work queue lock poisoned");
                if let Some(id) = inner.pending.shift_remove_index(0) {
                    return id;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Number of pending IDs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("work queue lock poisoned").pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads and clears the overflow flag.
    pub fn take_shed(&self) -> bool {
        let mut inner = self.inner.lock().expect("work queue lock poisoned");
        std::mem::take(&mut inner.shed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ObjectId {
        ObjectId::new("", "ConfigMap", "ns", name)
    }

    #[tokio::test]
    async fn test_fifo_order_and_dedup() {
        let queue = WorkQueue::new(16);
        queue.add(id("a"));
        queue.add(id("b"));
        queue.add(id("a"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.take().await, id("a"));
        assert_eq!(queue.take().await, id("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_waits_for_work() {
        let queue = std::sync::Arc::new(WorkQueue::new(16));
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.take().await })
        };
        tokio::task::yield_now().await;
        queue.add(id("late"));
        assert_eq!(waiter.await.unwrap(), id("late"));
    }

    #[tokio::test]
    async fn test_overflow_sheds_oldest() {
        let queue = WorkQueue::new(2);
        queue.add(id("a"));
        queue.add(id("b"));
        queue.add(id("c"));

        assert_eq!(queue.len(), 2);
        assert!(queue.take_shed());
        assert!(!queue.take_shed());
        assert_eq!(queue.take().await, id("b"));
        assert_eq!(queue.take().await, id("c"));
    }
}
