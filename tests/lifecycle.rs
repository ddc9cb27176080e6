use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use delivery_ledger::domain::dues::ClearDues;
use delivery_ledger::domain::order::{
    AgentId, CreateOrder, Customer, DeliveryAgent, Order, OrderEventType, OrderItem, OrderStatus,
    PaymentMethod, ReturnType, StoreId,
};
use delivery_ledger::domain::{CommandError, Entity, Operation};
use delivery_ledger::fanout::{Channel, EventSink, LifecycleEvent, Subscription, ViewScope};
use delivery_ledger::ledger::{InMemoryLedger, LedgerStore, NewAgent, NewCustomer};
use delivery_ledger::metrics::Metrics;
use delivery_ledger::{Config, DeliveryCore};

// ============================================================================
// Harness
// ============================================================================

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

struct Harness {
    core: DeliveryCore,
    ledger: Arc<InMemoryLedger>,
    customer: Customer,
    agents: Vec<DeliveryAgent>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_sinks(Config::default(), Vec::new()).await
    }

    async fn with_sinks(config: Config, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let core = DeliveryCore::assemble(config, ledger.clone(), metrics, sinks);

        let customer = ledger
            .register_customer(NewCustomer {
                store_id: StoreId(1),
                name: "Priya".into(),
            })
            .await
            .unwrap();
        let mut agents = Vec::new();
        for name in ["Vikram", "Sunil"] {
            agents.push(
                ledger
                    .register_agent(NewAgent {
                        store_id: StoreId(1),
                        name: name.into(),
                    })
                    .await
                    .unwrap(),
            );
        }

        Self {
            core,
            ledger,
            customer,
            agents,
        }
    }

    fn draft(&self, amount: &str) -> CreateOrder {
        CreateOrder {
            store_id: self.customer.store_id,
            customer_id: self.customer.id,
            items: vec![OrderItem::new("Atta 10kg", 1), OrderItem::new("Dal 1kg", 3)],
            invoice_amount: dec(amount),
            invoice_number: None,
            notes: None,
        }
    }

    async fn out_for_delivery(&self, amount: &str) -> Order {
        let handler = &self.core.handler;
        let order = handler.create_order(self.draft(amount)).await.unwrap();
        handler.assign_order(order.id, self.agents[0].id).await.unwrap();
        handler.advance_to_out_for_delivery(order.id).await.unwrap()
    }

    async fn delivered(&self, amount: &str, method: PaymentMethod) -> Order {
        let order = self.out_for_delivery(amount).await;
        self.core.handler.deliver_order(order.id, method).await.unwrap()
    }

    async fn dues(&self) -> Decimal {
        self.core.handler.dues_balance(self.customer.id).await.unwrap()
    }

    async fn assert_dues_consistent(&self) {
        let report = self.core.handler.verify_dues(self.customer.id).await.unwrap();
        assert!(
            report.is_consistent(),
            "cached {} != recomputed {}",
            report.cached,
            report.recomputed
        );
    }

    fn clearance(&self, amount: &str) -> ClearDues {
        ClearDues {
            customer_id: self.customer.id,
            amount: dec(amount),
            payment_method: PaymentMethod::Cash,
            cleared_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            notes: None,
        }
    }
}

fn drain(subscription: &mut Subscription) -> Vec<Arc<LifecycleEvent>> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv().unwrap() {
        events.push(event);
    }
    events
}

struct UnreachableSink;

#[async_trait]
impl EventSink for UnreachableSink {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn publish(&self, channel: &Channel, _event: &LifecycleEvent) -> Result<(), CommandError> {
        Err(CommandError::PublishFailure {
            channel: channel.to_string(),
            reason: "connection refused".into(),
        })
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_credit_delivery_clearance_and_credit_return() {
    let h = Harness::new().await;
    let mut admin = h.core.subscribe(Channel::Admin);

    let order = h.delivered("100.00", PaymentMethod::CustomerCredit).await;
    assert_eq!(order.status, OrderStatus::Delivered);
    assert_eq!(h.dues().await, dec("100.00"));
    h.assert_dues_consistent().await;

    let clearance = h.core.handler.clear_dues(h.clearance("40.00")).await.unwrap();
    assert_eq!(clearance.amount, dec("40.00"));
    assert_eq!(h.dues().await, dec("60.00"));
    h.assert_dues_consistent().await;

    let refund = h
        .core
        .handler
        .return_order(
            order.id,
            ReturnType::Partial,
            dec("30.00"),
            PaymentMethod::CustomerCredit,
            Some("one bag torn".into()),
        )
        .await
        .unwrap();
    assert_eq!(refund.refund_amount, dec("30.00"));
    assert_eq!(h.dues().await, dec("90.00"));
    h.assert_dues_consistent().await;

    let current = h.core.handler.get_order(order.id).await.unwrap();
    assert_eq!(current.status, OrderStatus::PartialReturned);
    assert_eq!(current.refunded_amount, dec("30.00"));

    let events = drain(&mut admin);
    let delivered = events
        .iter()
        .find(|e| e.event_type == OrderEventType::OrderDelivered)
        .unwrap();
    assert_eq!(delivered.dues_balance, Some(dec("100.00")));
    let returned = events.last().unwrap();
    assert_eq!(returned.event_type, OrderEventType::OrderReturned);
    assert_eq!(returned.return_record.as_ref(), Some(&refund));
    assert_eq!(returned.dues_balance, Some(dec("90.00")));
    assert_eq!(returned.snapshot, current);
}

#[tokio::test]
async fn test_cancel_then_delete() {
    let h = Harness::new().await;
    let mut store = h.core.subscribe(Channel::Store(StoreId(1)));
    let order = h.core.handler.create_order(h.draft("45.00")).await.unwrap();

    let cancelled = h.core.handler.cancel_order(order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(h.dues().await, Decimal::ZERO);

    h.core.handler.delete_order(order.id).await.unwrap();
    let err = h.core.handler.get_order(order.id).await.unwrap_err();
    assert!(matches!(err, CommandError::NotFound { entity: Entity::Order, .. }));

    let types: Vec<_> = drain(&mut store).iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![OrderEventType::OrderCreated, OrderEventType::OrderCancelled]);
    h.assert_dues_consistent().await;
}

#[tokio::test]
async fn test_delete_requires_cancelled() {
    let h = Harness::new().await;
    let order = h.core.handler.create_order(h.draft("10.00")).await.unwrap();

    let err = h.core.handler.delete_order(order.id).await.unwrap_err();
    assert_eq!(
        err,
        CommandError::InvalidTransition {
            order_id: order.id,
            status: OrderStatus::Created,
            operation: Operation::Delete,
        }
    );
    assert!(h.core.handler.get_order(order.id).await.is_ok());
}

#[tokio::test]
async fn test_deliver_from_created_is_rejected() {
    let h = Harness::new().await;
    let order = h.core.handler.create_order(h.draft("55.00")).await.unwrap();

    let err = h
        .core
        .handler
        .deliver_order(order.id, PaymentMethod::Cash)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::InvalidTransition { status: OrderStatus::Created, operation: Operation::Deliver, .. }
    ));
    assert_eq!(h.core.handler.get_order(order.id).await.unwrap(), order);
    h.assert_dues_consistent().await;
}

#[tokio::test]
async fn test_over_refund_creates_no_record() {
    let h = Harness::new().await;
    let order = h.delivered("50.00", PaymentMethod::Card).await;

    let err = h
        .core
        .handler
        .return_order(order.id, ReturnType::Partial, dec("50.01"), PaymentMethod::Cash, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::InvalidAmount { field: "refund_amount", .. }));
    assert!(h.core.handler.list_returns(order.id).await.unwrap().is_empty());
    assert_eq!(h.core.handler.get_order(order.id).await.unwrap().status, OrderStatus::Delivered);
    h.assert_dues_consistent().await;
}

#[tokio::test]
async fn test_refunds_never_exceed_invoice() {
    let h = Harness::new().await;
    let order = h.delivered("60.00", PaymentMethod::Cash).await;
    let handler = &h.core.handler;

    handler
        .return_order(order.id, ReturnType::Partial, dec("20.00"), PaymentMethod::Cash, None)
        .await
        .unwrap();
    handler
        .return_order(order.id, ReturnType::Partial, dec("15.00"), PaymentMethod::Cash, None)
        .await
        .unwrap();
    let err = handler
        .return_order(order.id, ReturnType::Full, dec("20.00"), PaymentMethod::Cash, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::InvalidAmount { .. }));

    handler
        .return_order(order.id, ReturnType::Full, dec("25.00"), PaymentMethod::Cash, None)
        .await
        .unwrap();
    let returned = handler.get_order(order.id).await.unwrap();
    assert_eq!(returned.status, OrderStatus::Returned);

    let refunded: Decimal = handler
        .list_returns(order.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.refund_amount)
        .sum();
    assert_eq!(refunded, returned.invoice_amount);

    let err = handler
        .return_order(order.id, ReturnType::Partial, dec("0.01"), PaymentMethod::Cash, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::InvalidTransition { status: OrderStatus::Returned, .. }));
    // Cash refunds leave dues alone.
    assert_eq!(h.dues().await, Decimal::ZERO);
    h.assert_dues_consistent().await;
}

#[tokio::test]
async fn test_concurrent_assign_has_one_winner() {
    let h = Harness::new().await;
    let order = h.core.handler.create_order(h.draft("30.00")).await.unwrap();

    let mut tasks = Vec::new();
    for agent in &h.agents {
        let handler = h.core.handler.clone();
        let agent_id = agent.id;
        tasks.push(tokio::spawn(async move {
            (agent_id, handler.assign_order(order.id, agent_id).await)
        }));
    }

    let mut winners: Vec<AgentId> = Vec::new();
    for task in tasks {
        let (agent_id, result) = task.await.unwrap();
        match result {
            Ok(_) => winners.push(agent_id),
            Err(CommandError::InvalidTransition { .. }) | Err(CommandError::ConcurrentModification { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(winners.len(), 1);
    let assigned = h.core.handler.get_order(order.id).await.unwrap();
    assert_eq!(assigned.status, OrderStatus::Assigned);
    assert_eq!(assigned.assigned_agent_id, Some(winners[0]));
}

#[tokio::test]
async fn test_each_transition_publishes_once_per_audience() {
    let h = Harness::new().await;
    let mut store = h.core.subscribe(Channel::Store(StoreId(1)));
    let mut admin = h.core.subscribe(Channel::Admin);
    let mut other_store = h.core.subscribe(Channel::Store(StoreId(2)));

    let order = h.delivered("75.00", PaymentMethod::Upi).await;

    let expected = vec![
        (OrderEventType::OrderCreated, OrderStatus::Created),
        (OrderEventType::OrderAssigned, OrderStatus::Assigned),
        (OrderEventType::OrderOutForDelivery, OrderStatus::OutForDelivery),
        (OrderEventType::OrderDelivered, OrderStatus::Delivered),
    ];
    for feed in [&mut store, &mut admin] {
        let events = drain(feed);
        let seen: Vec<_> = events
            .iter()
            .map(|e| (e.event_type, e.snapshot.status))
            .collect();
        assert_eq!(seen, expected);
        assert!(events.iter().all(|e| e.order_id == order.id && e.store_id == StoreId(1)));
        assert_eq!(events.last().unwrap().snapshot, order);
    }
    assert!(drain(&mut other_store).is_empty());
}

#[tokio::test]
async fn test_storage_failure_leaves_order_and_publishes_nothing() {
    let h = Harness::new().await;
    let order = h.out_for_delivery("120.00").await;
    let mut admin = h.core.subscribe(Channel::Admin);

    h.ledger.fail_next_commit();
    let err = h
        .core
        .handler
        .deliver_order(order.id, PaymentMethod::CustomerCredit)
        .await
        .unwrap_err();

    assert!(matches!(err, CommandError::StorageFailure(_)));
    assert_eq!(h.core.handler.get_order(order.id).await.unwrap(), order);
    assert_eq!(h.dues().await, Decimal::ZERO);
    assert!(drain(&mut admin).is_empty());
    h.assert_dues_consistent().await;

    // The caller re-fetched, saw OUT_FOR_DELIVERY, and retries.
    let delivered = h
        .core
        .handler
        .deliver_order(order.id, PaymentMethod::CustomerCredit)
        .await
        .unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
    assert_eq!(h.dues().await, dec("120.00"));
    h.assert_dues_consistent().await;
}

#[tokio::test]
async fn test_failing_sink_does_not_fail_command() {
    let h = Harness::with_sinks(Config::default(), vec![Arc::new(UnreachableSink)]).await;
    let mut store = h.core.subscribe(Channel::Store(StoreId(1)));

    let order = h.core.handler.create_order(h.draft("15.00")).await.unwrap();

    assert_eq!(order.status, OrderStatus::Created);
    assert_eq!(drain(&mut store).len(), 1);
    assert_eq!(
        h.core
            .metrics
            .publish_failures_total
            .with_label_values(&["unreachable"])
            .get(),
        2
    );
}

#[tokio::test]
async fn test_edit_allowed_until_delivery() {
    let h = Harness::new().await;
    let mut admin = h.core.subscribe(Channel::Admin);
    let order = h.out_for_delivery("40.00").await;

    let edited = h
        .core
        .handler
        .edit_order(order.id, vec![OrderItem::new("Atta 10kg", 2)], dec("70.00"), Some("two bags".into()))
        .await
        .unwrap();
    assert_eq!(edited.invoice_amount, dec("70.00"));
    assert_eq!(edited.total_items, 2);
    assert_eq!(edited.status, OrderStatus::OutForDelivery);
    assert_eq!(drain(&mut admin).last().unwrap().event_type, OrderEventType::OrderUpdated);

    let delivered = h
        .core
        .handler
        .deliver_order(order.id, PaymentMethod::CustomerCredit)
        .await
        .unwrap();
    assert_eq!(h.dues().await, dec("70.00"));

    let err = h
        .core
        .handler
        .edit_order(delivered.id, vec![OrderItem::new("Atta 10kg", 1)], dec("1.00"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::InvalidTransition { operation: Operation::Edit, .. }));

    let err = h
        .core
        .handler
        .create_order(CreateOrder {
            items: Vec::new(),
            ..h.draft("1.00")
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::InvalidInput { field: "items", .. }));
    h.assert_dues_consistent().await;
}

#[tokio::test]
async fn test_clear_dues_bounds() {
    let h = Harness::new().await;
    h.delivered("25.00", PaymentMethod::CustomerCredit).await;

    let err = h.core.handler.clear_dues(h.clearance("25.01")).await.unwrap_err();
    assert!(matches!(err, CommandError::InvalidAmount { field: "amount", .. }));
    let err = h.core.handler.clear_dues(h.clearance("0.00")).await.unwrap_err();
    assert!(matches!(err, CommandError::InvalidAmount { field: "amount", .. }));

    h.core.handler.clear_dues(h.clearance("25.00")).await.unwrap();
    assert_eq!(h.dues().await, Decimal::ZERO);
    assert_eq!(h.core.handler.list_clearances(h.customer.id).await.unwrap().len(), 1);
    h.assert_dues_consistent().await;
}

#[tokio::test]
async fn test_delivery_duration_and_repeat_deliver() {
    let h = Harness::new().await;
    let order = h.delivered("12.00", PaymentMethod::Cash).await;

    assert!(order.delivery_duration().is_some());
    assert_eq!(order.payment_method, Some(PaymentMethod::Cash));

    let err = h
        .core
        .handler
        .deliver_order(order.id, PaymentMethod::Cash)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::InvalidTransition { status: OrderStatus::Delivered, .. }));
}

#[tokio::test]
async fn test_store_view_converges_and_drops_deleted_orders() {
    let config = Config {
        view_resync_interval: Duration::from_millis(40),
        ..Config::default()
    };
    let h = Harness::with_sinks(config, Vec::new()).await;
    let follower = h.core.follow(ViewScope::Store(StoreId(1))).await.unwrap();

    let kept = h.delivered("33.00", PaymentMethod::Card).await;
    let doomed = h.core.handler.create_order(h.draft("9.00")).await.unwrap();
    h.core.handler.cancel_order(doomed.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    {
        let view = follower.view();
        let view = view.read().await;
        assert_eq!(view.get(kept.id), Some(&kept));
        assert_eq!(view.get(doomed.id).unwrap().status, OrderStatus::Cancelled);
    }

    h.core.handler.delete_order(doomed.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let view = follower.view();
    let view = view.read().await;
    assert!(view.get(doomed.id).is_none());
    assert_eq!(view.len(), 1);
}
