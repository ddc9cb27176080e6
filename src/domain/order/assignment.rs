use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::errors::CommandError;
use super::value_objects::OrderId;

// ============================================================================
// Assignment Coordinator
// ============================================================================
//
// Per-order critical section around "read status, check agent, write".
// Callers hold the returned guard for the whole transaction; the status is
// re-validated inside it. Lock entries are removed once nobody holds or
// waits on them, so the map only grows with in-flight assignments.
//
// ============================================================================

pub struct AssignmentCoordinator {
    locks: DashMap<OrderId, Arc<Mutex<()>>>,
    wait: Duration,
}

/// Held while an assignment runs. Dropping it releases the order.
pub struct AssignmentGuard<'a> {
    coordinator: &'a AssignmentCoordinator,
    order_id: OrderId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl AssignmentCoordinator {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            wait,
        }
    }

    /// Wait up to the configured bound for exclusive access to `order_id`.
    pub async fn acquire(&self, order_id: OrderId) -> Result<AssignmentGuard<'_>, CommandError> {
        let lock = self.locks.entry(order_id).or_default().clone();

        match tokio::time::timeout(self.wait, lock.lock_owned()).await {
            Ok(guard) => Ok(AssignmentGuard {
                coordinator: self,
                order_id,
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(order_id);
                tracing::warn!(
                    order_id = %order_id,
                    wait_ms = self.wait.as_millis() as u64,
                    "Assignment lock wait timed out"
                );
                Err(CommandError::ConcurrentModification {
                    order_id,
                    reason: format!(
                        "another assignment held the order for more than {}ms",
                        self.wait.as_millis()
                    ),
                })
            }
        }
    }

    /// Number of orders with a live lock entry.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }

    fn release(&self, order_id: OrderId) {
        // Only the map still references the lock: no holder, no waiter.
        self.locks
            .remove_if(&order_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl Drop for AssignmentGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.coordinator.release(self.order_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_guard_is_exclusive_per_order() {
        let coordinator = Arc::new(AssignmentCoordinator::new(Duration::from_secs(1)));
        let inside = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = coordinator.acquire(OrderId(1)).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_different_orders_do_not_block() {
        let coordinator = AssignmentCoordinator::new(Duration::from_millis(20));
        let _first = coordinator.acquire(OrderId(1)).await.unwrap();
        let second = coordinator.acquire(OrderId(2)).await;
        assert!(second.is_ok());
        assert_eq!(coordinator.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_wait_timeout_is_concurrent_modification() {
        let coordinator = AssignmentCoordinator::new(Duration::from_millis(20));
        let held = coordinator.acquire(OrderId(5)).await.unwrap();

        let err = coordinator.acquire(OrderId(5)).await.err().unwrap();
        assert!(matches!(
            err,
            CommandError::ConcurrentModification { order_id: OrderId(5), .. }
        ));

        drop(held);
        assert_eq!(coordinator.in_flight(), 0);
        assert!(coordinator.acquire(OrderId(5)).await.is_ok());
    }
}
