use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::domain::errors::CommandError;
use crate::domain::order::{Order, OrderId, StoreId};
use crate::ledger::LedgerStore;
use crate::metrics::Metrics;
use super::broker::{EventBroker, SubscriptionError};
use super::event::{Channel, LifecycleEvent};

// ============================================================================
// Order View - subscriber-side materialization
// ============================================================================
//
// What a store screen or the admin dashboard holds. Snapshots are applied
// last-write-wins on (updated_at, version), so duplicates and out-of-order
// delivery converge. A full resync from the ledger is the backstop for lost
// events and for deletions, which are never broadcast.
//
// Deletions are only visible as absence from a resync, so an event still
// queued behind one must not bring a deleted order back. An event for an
// order the view does not hold is dropped when it was committed before the
// last resync started (that resync would have loaded the order if it still
// existed) or when a resync already saw the order disappear. Order ids are
// never reused.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewScope {
    Store(StoreId),
    Admin,
}

impl ViewScope {
    pub fn channel(self) -> Channel {
        match self {
            ViewScope::Store(id) => Channel::Store(id),
            ViewScope::Admin => Channel::Admin,
        }
    }

    fn admits(self, order: &Order) -> bool {
        match self {
            ViewScope::Store(id) => order.store_id == id,
            ViewScope::Admin => true,
        }
    }

    fn store_filter(self) -> Option<StoreId> {
        match self {
            ViewScope::Store(id) => Some(id),
            ViewScope::Admin => None,
        }
    }
}

#[derive(Debug)]
pub struct OrderView {
    scope: ViewScope,
    orders: BTreeMap<OrderId, Order>,
    /// When the last resync started reading the ledger.
    synced_at: Option<DateTime<Utc>>,
    /// Orders a resync found gone.
    retired: HashSet<OrderId>,
}

impl OrderView {
    pub fn new(scope: ViewScope) -> Self {
        Self {
            scope,
            orders: BTreeMap::new(),
            synced_at: None,
            retired: HashSet::new(),
        }
    }

    pub fn scope(&self) -> ViewScope {
        self.scope
    }

    /// Apply one event; returns whether the view changed.
    pub fn apply(&mut self, event: &LifecycleEvent) -> bool {
        let snapshot = &event.snapshot;
        if !self.scope.admits(snapshot) {
            return false;
        }

        match self.orders.get(&snapshot.id) {
            Some(current) if !snapshot.supersedes(current) => false,
            Some(_) => {
                self.orders.insert(snapshot.id, snapshot.clone());
                true
            }
            None if self.is_stale(event) => {
                tracing::debug!(
                    order_id = %snapshot.id,
                    event_type = %event.event_type,
                    "Dropping stale event for absent order"
                );
                false
            }
            None => {
                self.orders.insert(snapshot.id, snapshot.clone());
                true
            }
        }
    }

    fn is_stale(&self, event: &LifecycleEvent) -> bool {
        self.retired.contains(&event.order_id)
            || self.synced_at.map_or(false, |synced_at| event.committed_at <= synced_at)
    }

    /// Replace the whole view with the ledger contents read at `as_of`.
    /// Orders absent from `orders` are dropped and retired.
    pub fn replace_all(&mut self, orders: Vec<Order>, as_of: DateTime<Utc>) {
        let scope = self.scope;
        let fresh: BTreeMap<OrderId, Order> = orders
            .into_iter()
            .filter(|order| scope.admits(order))
            .map(|order| (order.id, order))
            .collect();

        self.retired
            .extend(self.orders.keys().filter(|id| !fresh.contains_key(id)).copied());
        self.orders = fresh;
        self.synced_at = Some(as_of);
    }

    pub async fn resync(&mut self, ledger: &dyn LedgerStore) -> Result<usize, CommandError> {
        let as_of = Utc::now();
        let orders = ledger.list_orders(self.scope.store_filter()).await?;
        self.replace_all(orders, as_of);
        Ok(self.orders.len())
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

// ============================================================================
// View Follower - keeps an OrderView live
// ============================================================================

/// Background task feeding a shared view from a broker subscription.
/// Aborted when dropped.
pub struct ViewFollower {
    view: Arc<RwLock<OrderView>>,
    task: JoinHandle<()>,
}

impl ViewFollower {
    /// Subscribe first, then load, so nothing committed in between is missed.
    pub async fn start(
        scope: ViewScope,
        broker: &EventBroker,
        ledger: Arc<dyn LedgerStore>,
        metrics: Arc<Metrics>,
        resync_every: Duration,
    ) -> Result<Self, CommandError> {
        let mut subscription = broker.subscribe(scope.channel());

        let mut initial = OrderView::new(scope);
        initial.resync(ledger.as_ref()).await?;
        metrics.view_resyncs_total.with_label_values(&["initial"]).inc();

        let view = Arc::new(RwLock::new(initial));
        let shared = view.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(resync_every);
            ticker.tick().await;

            loop {
                let trigger = tokio::select! {
                    received = subscription.recv() => match received {
                        Ok(event) => {
                            shared.write().await.apply(&event);
                            continue;
                        }
                        Err(SubscriptionError::Lagged(missed)) => {
                            tracing::warn!(channel = %subscription.channel(), missed, "View lagged, resyncing");
                            "lag"
                        }
                        Err(SubscriptionError::Closed) => break,
                    },
                    _ = ticker.tick() => "periodic",
                };

                let mut view = shared.write().await;
                match view.resync(ledger.as_ref()).await {
                    Ok(count) => {
                        metrics.view_resyncs_total.with_label_values(&[trigger]).inc();
                        tracing::debug!(channel = %subscription.channel(), trigger, orders = count, "View resynced");
                    }
                    Err(err) => {
                        tracing::error!(channel = %subscription.channel(), error = %err, "View resync failed");
                    }
                }
            }
        });

        Ok(Self { view, task })
    }

    pub fn view(&self) -> Arc<RwLock<OrderView>> {
        self.view.clone()
    }
}

impl Drop for ViewFollower {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{CreateOrder, CustomerId, OrderEventType, OrderItem, OrderStatus};
    use crate::ledger::{InMemoryLedger, LedgerTransaction, NewCustomer};
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal::Decimal;

    fn order(id: i64, store: i64) -> Order {
        let draft = CreateOrder {
            store_id: StoreId(store),
            customer_id: CustomerId(1),
            items: vec![OrderItem::new("Flour", 1)],
            invoice_amount: Decimal::new(2000, 2),
            invoice_number: None,
            notes: None,
        };
        Order::open(OrderId(id), &draft, Utc::now()).unwrap()
    }

    fn event_for(snapshot: Order) -> LifecycleEvent {
        LifecycleEvent::new(OrderEventType::OrderUpdated, snapshot, Utc::now())
    }

    #[test]
    fn test_last_write_wins_regardless_of_arrival_order() {
        let created = order(1, 1);
        let mut assigned = created.clone();
        assigned.status = OrderStatus::Assigned;
        assigned.version = 2;
        assigned.updated_at = created.updated_at + ChronoDuration::seconds(1);

        let mut view = OrderView::new(ViewScope::Admin);
        assert!(view.apply(&event_for(assigned.clone())));
        assert!(!view.apply(&event_for(created)));
        // Duplicate delivery is a no-op.
        assert!(!view.apply(&event_for(assigned.clone())));

        assert_eq!(view.get(OrderId(1)), Some(&assigned));
    }

    #[test]
    fn test_store_view_ignores_other_stores() {
        let mut view = OrderView::new(ViewScope::Store(StoreId(1)));
        assert!(!view.apply(&event_for(order(7, 2))));
        assert!(view.is_empty());

        view.replace_all(vec![order(1, 1), order(2, 2)], Utc::now());
        assert_eq!(view.len(), 1);
        assert!(view.get(OrderId(2)).is_none());
    }

    #[test]
    fn test_replace_all_drops_missing_orders() {
        let mut view = OrderView::new(ViewScope::Admin);
        let first = order(1, 1);
        view.replace_all(vec![first.clone(), order(2, 1)], Utc::now());
        view.replace_all(vec![order(2, 1)], Utc::now());
        assert_eq!(view.orders().map(|o| o.id).collect::<Vec<_>>(), vec![OrderId(2)]);

        // A late event for the dropped order does not resurrect it.
        let mut later = first;
        later.version += 1;
        later.updated_at = Utc::now() + ChronoDuration::seconds(1);
        let late = LifecycleEvent::new(OrderEventType::OrderCancelled, later.clone(), later.updated_at);
        assert!(!view.apply(&late));
        assert!(view.get(OrderId(1)).is_none());
    }

    #[tokio::test]
    async fn test_queued_events_do_not_resurrect_deleted_order() {
        let ledger = InMemoryLedger::new();
        let customer = ledger
            .register_customer(NewCustomer {
                store_id: StoreId(1),
                name: "Anil".into(),
            })
            .await
            .unwrap();
        let draft = CreateOrder {
            store_id: StoreId(1),
            customer_id: customer.id,
            items: vec![OrderItem::new("Tea 250g", 1)],
            invoice_amount: Decimal::new(350, 2),
            invoice_number: None,
            notes: None,
        };

        // Created, cancelled and deleted while the events sit in a queue.
        let mut tx = ledger.begin().await.unwrap();
        let id = tx.allocate_order_id().await.unwrap();
        let created = Order::open(id, &draft, Utc::now()).unwrap();
        tx.insert_order(&created).await.unwrap();
        tx.commit().await.unwrap();
        let created_event = LifecycleEvent::new(OrderEventType::OrderCreated, created.clone(), Utc::now());

        let mut cancelled = created.clone();
        cancelled.status = OrderStatus::Cancelled;
        cancelled.version += 1;
        cancelled.updated_at = Utc::now();
        let cancelled_event = LifecycleEvent::new(OrderEventType::OrderCancelled, cancelled, Utc::now());

        let mut tx = ledger.begin().await.unwrap();
        tx.delete_order(id).await.unwrap();
        tx.commit().await.unwrap();

        let mut view = OrderView::new(ViewScope::Store(StoreId(1)));
        view.resync(&ledger).await.unwrap();
        assert!(!view.apply(&created_event));
        assert!(!view.apply(&cancelled_event));
        assert!(view.get(id).is_none());

        // Orders committed after the resync still flow in.
        let fresh = LifecycleEvent::new(
            OrderEventType::OrderCreated,
            order(900, 1),
            Utc::now() + ChronoDuration::seconds(1),
        );
        assert!(view.apply(&fresh));
    }

    #[tokio::test]
    async fn test_follower_applies_events_and_resyncs() {
        let ledger = Arc::new(InMemoryLedger::new());
        let customer = ledger
            .register_customer(NewCustomer {
                store_id: StoreId(1),
                name: "Ravi".into(),
            })
            .await
            .unwrap();
        let draft = CreateOrder {
            store_id: StoreId(1),
            customer_id: customer.id,
            items: vec![OrderItem::new("Oil", 1)],
            invoice_amount: Decimal::new(900, 2),
            invoice_number: None,
            notes: None,
        };

        // Committed before the follower starts: picked up by the initial load.
        let mut tx = ledger.begin().await.unwrap();
        let id = tx.allocate_order_id().await.unwrap();
        let existing = Order::open(id, &draft, Utc::now()).unwrap();
        tx.insert_order(&existing).await.unwrap();
        tx.commit().await.unwrap();

        let broker = EventBroker::new(16);
        let metrics = Arc::new(Metrics::new().unwrap());
        let follower = ViewFollower::start(
            ViewScope::Store(StoreId(1)),
            &broker,
            ledger.clone(),
            metrics.clone(),
            Duration::from_millis(30),
        )
        .await
        .unwrap();
        assert_eq!(follower.view().read().await.len(), 1);

        broker.broadcast(Channel::Store(StoreId(1)), Arc::new(event_for(order(500, 1))));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(follower.view().read().await.get(OrderId(500)).is_some());

        // Order 500 never existed in the ledger, so the periodic resync drops it.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let view = follower.view();
        let view = view.read().await;
        assert!(view.get(OrderId(500)).is_none());
        assert!(view.get(existing.id).is_some());
        assert!(metrics.view_resyncs_total.with_label_values(&["periodic"]).get() >= 1);
    }
}
