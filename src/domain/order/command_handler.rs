use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::oneshot;

use crate::domain::dues::{ClearDues, DueClearance, DuesReconciler, DuesReport};
use crate::domain::errors::{CommandError, Entity, Operation};
use crate::fanout::{FanOut, LifecycleEvent};
use crate::ledger::LedgerStore;
use crate::metrics::Metrics;
use crate::utils::IsTransient;
use super::aggregate::Decision;
use super::assignment::AssignmentCoordinator;
use super::commands::{CreateOrder, OrderCommand};
use super::events::{OrderChange, OrderEventType};
use super::value_objects::{
    AgentId, CustomerId, Order, OrderId, OrderItem, OrderReturn, PaymentMethod, ReturnType, StoreId,
};

// ============================================================================
// Order Command Handler
// ============================================================================
//
// Orchestrates: Command → lock row → Aggregate → Ledger writes + dues delta
//               → commit → Fan-out
//
// Every command runs on its own task and only its ledger work is bounded by
// `command_timeout`. A caller that times out gets a retryable StorageFailure
// while the task runs to completion or failure; callers must re-fetch before
// retrying a financial transition. Events are published only after the
// commit succeeded, outside the timeout, and a fan-out failure never fails
// the command. When the caller has already given up, the task publishes.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub command_timeout: Duration,
    pub assign_lock_timeout: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            assign_lock_timeout: Duration::from_secs(2),
        }
    }
}

/// Result of one committed (or already-applied) transition.
struct Transition {
    order: Order,
    return_record: Option<OrderReturn>,
    event: Option<LifecycleEvent>,
}

/// Value a command hands back once its transaction has committed, with the
/// event still to be fanned out.
struct Committed<T> {
    value: T,
    event: Option<LifecycleEvent>,
}

impl<T> Committed<T> {
    fn quiet(value: T) -> Self {
        Self { value, event: None }
    }
}

impl Committed<Order> {
    fn from_transition(transition: Transition) -> Self {
        Self {
            value: transition.order,
            event: transition.event,
        }
    }
}

struct HandlerInner {
    ledger: Arc<dyn LedgerStore>,
    dues: DuesReconciler,
    assignments: AssignmentCoordinator,
    fanout: Arc<FanOut>,
    metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct OrderCommandHandler {
    inner: Arc<HandlerInner>,
    command_timeout: Duration,
}

impl OrderCommandHandler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        fanout: Arc<FanOut>,
        metrics: Arc<Metrics>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                dues: DuesReconciler::new(ledger.clone(), metrics.clone()),
                assignments: AssignmentCoordinator::new(settings.assign_lock_timeout),
                ledger,
                fanout,
                metrics,
            }),
            command_timeout: settings.command_timeout,
        }
    }

    pub fn dues(&self) -> &DuesReconciler {
        &self.inner.dues
    }

    /// Run `work` on its own task. Only the wait for the commit is bounded by
    /// the command timeout; fan-out happens afterwards.
    async fn run<T, F, Fut>(&self, operation: Operation, work: F) -> Result<T, CommandError>
    where
        F: FnOnce(Arc<HandlerInner>) -> Fut,
        Fut: Future<Output = Result<Committed<T>, CommandError>> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let (committed_tx, mut committed_rx) = oneshot::channel();
        let fut = work(self.inner.clone());
        let fanout = self.inner.fanout.clone();

        tokio::spawn(async move {
            let result = fut.await;
            if let Err(Ok(orphaned)) = committed_tx.send(result) {
                if let Some(event) = orphaned.event {
                    tracing::debug!(operation = %operation, "Caller gone, publishing from command task");
                    fanout.publish(&event).await;
                }
            }
        });

        let result = match tokio::time::timeout(self.command_timeout, &mut committed_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::storage(format!("{} aborted before committing", operation))),
            Err(_) => {
                // Close first so a result sent in the meantime is still taken here.
                committed_rx.close();
                match committed_rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(CommandError::StorageFailure(format!(
                        "{} did not finish within {}ms; re-fetch the order before retrying",
                        operation,
                        self.command_timeout.as_millis()
                    ))),
                }
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        self.inner
            .metrics
            .record_command(operation.as_str(), outcome, started.elapsed().as_secs_f64());

        match result {
            Ok(committed) => {
                if let Some(event) = &committed.event {
                    self.inner.fanout.publish(event).await;
                }
                Ok(committed.value)
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::warn!(operation = %operation, error = %err, "Command failed");
                } else {
                    tracing::debug!(operation = %operation, error = %err, "Command rejected");
                }
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub async fn create_order(&self, draft: CreateOrder) -> Result<Order, CommandError> {
        self.run(Operation::Create, |inner| async move { inner.create(draft).await })
            .await
    }

    pub async fn assign_order(&self, order_id: OrderId, agent_id: AgentId) -> Result<Order, CommandError> {
        self.run(Operation::Assign, move |inner| async move {
            let _guard = match inner.assignments.acquire(order_id).await {
                Ok(guard) => guard,
                Err(err) => {
                    inner.metrics.assignment_lock_timeouts_total.inc();
                    return Err(err);
                }
            };
            let transition = inner
                .transition(order_id, OrderCommand::Assign { agent_id })
                .await?;
            Ok(Committed::from_transition(transition))
        })
        .await
    }

    pub async fn advance_to_out_for_delivery(&self, order_id: OrderId) -> Result<Order, CommandError> {
        self.order_command(order_id, OrderCommand::MarkOutForDelivery).await
    }

    pub async fn deliver_order(
        &self,
        order_id: OrderId,
        payment_method: PaymentMethod,
    ) -> Result<Order, CommandError> {
        self.order_command(order_id, OrderCommand::Deliver { payment_method })
            .await
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> Result<Order, CommandError> {
        self.order_command(order_id, OrderCommand::Cancel).await
    }

    pub async fn return_order(
        &self,
        order_id: OrderId,
        return_type: ReturnType,
        amount: Decimal,
        refund_method: PaymentMethod,
        reason: Option<String>,
    ) -> Result<OrderReturn, CommandError> {
        let command = OrderCommand::Return {
            return_type,
            amount,
            refund_method,
            reason,
        };
        self.run(Operation::Return, move |inner| async move {
            let transition = inner.transition(order_id, command).await?;
            let record = transition
                .return_record
                .ok_or_else(|| CommandError::storage("return committed without a record"))?;
            Ok(Committed {
                value: record,
                event: transition.event,
            })
        })
        .await
    }

    pub async fn edit_order(
        &self,
        order_id: OrderId,
        items: Vec<OrderItem>,
        invoice_amount: Decimal,
        notes: Option<String>,
    ) -> Result<Order, CommandError> {
        self.order_command(
            order_id,
            OrderCommand::Edit {
                items,
                invoice_amount,
                notes,
            },
        )
        .await
    }

    pub async fn delete_order(&self, order_id: OrderId) -> Result<(), CommandError> {
        self.order_command(order_id, OrderCommand::Delete).await?;
        Ok(())
    }

    pub async fn clear_dues(&self, command: ClearDues) -> Result<DueClearance, CommandError> {
        self.run(Operation::ClearDues, move |inner| async move {
            let (clearance, balance) = inner.dues.clear_dues(&command, Utc::now()).await?;
            tracing::info!(
                customer_id = %clearance.customer_id,
                clearance_id = %clearance.id,
                amount = %clearance.amount,
                balance = %balance,
                "Dues cleared"
            );
            Ok(Committed::quiet(clearance))
        })
        .await
    }

    async fn order_command(&self, order_id: OrderId, command: OrderCommand) -> Result<Order, CommandError> {
        self.run(command.operation(), move |inner| async move {
            Ok(Committed::from_transition(inner.transition(order_id, command).await?))
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    async fn bounded<T>(&self, read: impl Future<Output = Result<T, CommandError>>) -> Result<T, CommandError> {
        tokio::time::timeout(self.command_timeout, read)
            .await
            .unwrap_or_else(|_| Err(CommandError::StorageFailure("ledger read timed out".to_string())))
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Order, CommandError> {
        self.bounded(self.inner.ledger.get_order(order_id))
            .await?
            .ok_or_else(|| CommandError::not_found(Entity::Order, order_id.0))
    }

    pub async fn list_store_orders(&self, store_id: StoreId) -> Result<Vec<Order>, CommandError> {
        self.bounded(self.inner.ledger.list_orders(Some(store_id))).await
    }

    pub async fn list_all_orders(&self) -> Result<Vec<Order>, CommandError> {
        self.bounded(self.inner.ledger.list_orders(None)).await
    }

    pub async fn list_returns(&self, order_id: OrderId) -> Result<Vec<OrderReturn>, CommandError> {
        self.bounded(self.inner.ledger.list_returns(order_id)).await
    }

    pub async fn list_clearances(&self, customer_id: CustomerId) -> Result<Vec<DueClearance>, CommandError> {
        self.bounded(self.inner.ledger.list_clearances(customer_id)).await
    }

    pub async fn dues_balance(&self, customer_id: CustomerId) -> Result<Decimal, CommandError> {
        self.bounded(self.inner.ledger.get_customer(customer_id))
            .await?
            .map(|customer| customer.dues_balance)
            .ok_or_else(|| CommandError::not_found(Entity::Customer, customer_id.0))
    }

    pub async fn verify_dues(&self, customer_id: CustomerId) -> Result<DuesReport, CommandError> {
        self.bounded(self.inner.dues.verify(customer_id)).await
    }

    pub async fn repair_dues(&self, customer_id: CustomerId) -> Result<DuesReport, CommandError> {
        self.bounded(self.inner.dues.repair(customer_id)).await
    }
}

impl HandlerInner {
    async fn create(&self, draft: CreateOrder) -> Result<Committed<Order>, CommandError> {
        // Reject bad payloads before an order id is consumed.
        draft.validate()?;
        let now = Utc::now();

        let mut tx = self.ledger.begin().await?;
        let customer = tx
            .lock_customer(draft.customer_id)
            .await?
            .ok_or_else(|| CommandError::not_found(Entity::Customer, draft.customer_id.0))?;
        if customer.store_id != draft.store_id {
            return Err(CommandError::NotFound {
                entity: Entity::Customer,
                id: draft.customer_id.0,
                store: Some(draft.store_id),
            });
        }

        let id = tx.allocate_order_id().await?;
        let order = Order::open(id, &draft, now)?;
        tx.insert_order(&order).await?;
        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            store_id = %order.store_id,
            amount = %order.invoice_amount,
            "Order created"
        );

        let event = LifecycleEvent::new(OrderEventType::OrderCreated, order.clone(), Utc::now());
        Ok(Committed {
            value: order,
            event: Some(event),
        })
    }

    /// Lock the order, validate, write the change with its dependent rows and
    /// dues delta in one transaction. The event is returned for the caller to
    /// publish.
    async fn transition(&self, order_id: OrderId, command: OrderCommand) -> Result<Transition, CommandError> {
        let now = Utc::now();
        let mut tx = self.ledger.begin().await?;
        let mut order = tx
            .lock_order(order_id)
            .await?
            .ok_or_else(|| CommandError::not_found(Entity::Order, order_id.0))?;

        let change = match order.handle_command(&command, now)? {
            Decision::Apply(change) => change,
            Decision::AlreadyApplied => {
                tracing::debug!(order_id = %order_id, operation = %command.operation(), "Already applied");
                return Ok(Transition {
                    order,
                    return_record: None,
                    event: None,
                });
            }
        };

        if let OrderChange::Assigned { agent_id, .. } = &change {
            let agent = tx.find_agent(*agent_id).await?;
            if !agent.is_some_and(|agent| agent.store_id == order.store_id) {
                return Err(CommandError::NotFound {
                    entity: Entity::Agent,
                    id: agent_id.0,
                    store: Some(order.store_id),
                });
            }
        }

        let delta = DuesReconciler::delta_for(&order, &change);
        order.apply_change(&change);

        let return_record = match &change {
            OrderChange::Returned { record } => Some(tx.insert_return(record).await?),
            _ => None,
        };

        if matches!(change, OrderChange::Deleted) {
            tx.delete_order(order.id).await?;
        } else {
            tx.update_order(&order).await?;
        }

        let dues_balance = match &delta {
            Some(delta) => Some(self.dues.apply_delta(tx.as_mut(), delta).await?),
            None => None,
        };

        tx.commit().await?;

        tracing::info!(
            order_id = %order.id,
            operation = %command.operation(),
            status = %order.status,
            version = order.version,
            "Order transition committed"
        );

        let event = change.event_type().map(|event_type| {
            let mut event = LifecycleEvent::new(event_type, order.clone(), Utc::now());
            if let Some(record) = &return_record {
                event = event.with_return(record.clone());
            }
            if let Some(balance) = dues_balance {
                event = event.with_dues_balance(balance);
            }
            event
        });

        Ok(Transition {
            order,
            return_record,
            event,
        })
    }
}
