use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::dues::{CustomerHistory, DueClearance, NewDueClearance};
use crate::domain::errors::{CommandError, Entity};
use crate::domain::order::{
    AgentId, ClearanceId, Customer, CustomerId, DeliveryAgent, NewReturn, Order, OrderId,
    OrderReturn, ReturnId, StoreId,
};
use super::store::{LedgerStore, LedgerTransaction, NewAgent, NewCustomer};

// ============================================================================
// In-Memory Ledger
// ============================================================================
//
// One writer at a time: a transaction owns the state lock from `begin` until
// it is committed or dropped. Writes go straight to the locked state and
// record an undo entry; a dropped or failed transaction replays its undo log
// in reverse. Reads wait for in-flight writers, so they never see
// uncommitted data. The cost of a transaction is proportional to the rows it
// touches.
//
// ============================================================================

#[derive(Debug, Default)]
struct LedgerState {
    orders: BTreeMap<OrderId, Order>,
    invoice_numbers: HashMap<String, OrderId>,
    returns: Vec<OrderReturn>,
    clearances: Vec<DueClearance>,
    customers: BTreeMap<CustomerId, Customer>,
    agents: HashMap<AgentId, DeliveryAgent>,
}

impl LedgerState {
    /// Insert, replace or remove an order, keeping the invoice index in step.
    fn put_order(&mut self, id: OrderId, order: Option<Order>) -> Option<Order> {
        let previous = self.orders.remove(&id);
        if let Some(number) = previous.as_ref().and_then(|p| p.invoice_number.as_ref()) {
            self.invoice_numbers.remove(number);
        }
        if let Some(order) = order {
            if let Some(number) = &order.invoice_number {
                self.invoice_numbers.insert(number.clone(), id);
            }
            self.orders.insert(id, order);
        }
        previous
    }
}

/// Reverses one write of an uncommitted transaction.
#[derive(Debug)]
enum Undo {
    Order { id: OrderId, previous: Option<Order> },
    Return,
    Clearance,
    Dues { customer_id: CustomerId, previous: Decimal },
}

/// Id sequences live outside the transactional state so rolled-back
/// allocations are never handed out again.
#[derive(Debug, Default)]
struct Sequences {
    orders: AtomicI64,
    returns: AtomicI64,
    clearances: AtomicI64,
    customers: AtomicI64,
    agents: AtomicI64,
}

fn next(counter: &AtomicI64) -> i64 {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    sequences: Arc<Sequences>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with `StorageFailure` and leave the ledger
    /// untouched. Used to exercise rollback paths.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, CommandError> {
        let state = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            state,
            undo: Vec::new(),
            committed: false,
            sequences: self.sequences.clone(),
            fail_commit: self.fail_next_commit.clone(),
        }))
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, CommandError> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn list_orders(&self, store: Option<StoreId>) -> Result<Vec<Order>, CommandError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|order| store.map_or(true, |s| order.store_id == s))
            .cloned()
            .collect())
    }

    async fn list_returns(&self, order_id: OrderId) -> Result<Vec<OrderReturn>, CommandError> {
        let state = self.state.lock().await;
        Ok(state
            .returns
            .iter()
            .filter(|record| record.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn get_customer(&self, id: CustomerId) -> Result<Option<Customer>, CommandError> {
        Ok(self.state.lock().await.customers.get(&id).cloned())
    }

    async fn list_clearances(&self, customer_id: CustomerId) -> Result<Vec<DueClearance>, CommandError> {
        let state = self.state.lock().await;
        Ok(state
            .clearances
            .iter()
            .filter(|c| c.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn customer_history(&self, customer_id: CustomerId) -> Result<CustomerHistory, CommandError> {
        let state = self.state.lock().await;
        if !state.customers.contains_key(&customer_id) {
            return Err(CommandError::not_found(Entity::Customer, customer_id.0));
        }

        Ok(CustomerHistory {
            orders: state
                .orders
                .values()
                .filter(|order| order.customer_id == customer_id)
                .cloned()
                .collect(),
            returns: state
                .returns
                .iter()
                .filter(|record| record.customer_id == customer_id)
                .cloned()
                .collect(),
            clearances: state
                .clearances
                .iter()
                .filter(|c| c.customer_id == customer_id)
                .cloned()
                .collect(),
        })
    }

    async fn register_customer(&self, customer: NewCustomer) -> Result<Customer, CommandError> {
        let mut state = self.state.lock().await;
        let customer = Customer {
            id: CustomerId(next(&self.sequences.customers)),
            store_id: customer.store_id,
            name: customer.name,
            dues_balance: Decimal::ZERO,
        };
        state.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn register_agent(&self, agent: NewAgent) -> Result<DeliveryAgent, CommandError> {
        let mut state = self.state.lock().await;
        let agent = DeliveryAgent {
            id: AgentId(next(&self.sequences.agents)),
            store_id: agent.store_id,
            name: agent.name,
        };
        state.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }
}

struct MemoryTransaction {
    state: OwnedMutexGuard<LedgerState>,
    undo: Vec<Undo>,
    committed: bool,
    sequences: Arc<Sequences>,
    fail_commit: Arc<AtomicBool>,
}

impl MemoryTransaction {
    fn write_order(&mut self, id: OrderId, order: Option<Order>) {
        let previous = self.state.put_order(id, order);
        self.undo.push(Undo::Order { id, previous });
    }

    fn set_balance(&mut self, customer_id: CustomerId, balance: Decimal) -> Result<(), CommandError> {
        let customer = self
            .state
            .customers
            .get_mut(&customer_id)
            .ok_or_else(|| CommandError::not_found(Entity::Customer, customer_id.0))?;
        let previous = std::mem::replace(&mut customer.dues_balance, balance);
        self.undo.push(Undo::Dues { customer_id, previous });
        Ok(())
    }

    fn rollback(&mut self) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Order { id, previous } => {
                    self.state.put_order(id, previous);
                }
                Undo::Return => {
                    self.state.returns.pop();
                }
                Undo::Clearance => {
                    self.state.clearances.pop();
                }
                Undo::Dues { customer_id, previous } => {
                    if let Some(customer) = self.state.customers.get_mut(&customer_id) {
                        customer.dues_balance = previous;
                    }
                }
            }
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn allocate_order_id(&mut self) -> Result<OrderId, CommandError> {
        Ok(OrderId(next(&self.sequences.orders)))
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), CommandError> {
        if let Some(number) = &order.invoice_number {
            if self.state.invoice_numbers.contains_key(number) {
                return Err(CommandError::InvalidInput {
                    field: "invoice_number",
                    reason: format!("invoice number {} is already used", number),
                });
            }
        }
        self.write_order(order.id, Some(order.clone()));
        Ok(())
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, CommandError> {
        Ok(self.state.orders.get(&id).cloned())
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), CommandError> {
        if !self.state.orders.contains_key(&order.id) {
            return Err(CommandError::not_found(Entity::Order, order.id.0));
        }
        self.write_order(order.id, Some(order.clone()));
        Ok(())
    }

    async fn delete_order(&mut self, id: OrderId) -> Result<(), CommandError> {
        if !self.state.orders.contains_key(&id) {
            return Err(CommandError::not_found(Entity::Order, id.0));
        }
        self.write_order(id, None);
        Ok(())
    }

    async fn insert_return(&mut self, record: &NewReturn) -> Result<OrderReturn, CommandError> {
        let stored = record.clone().with_id(ReturnId(next(&self.sequences.returns)));
        self.state.returns.push(stored.clone());
        self.undo.push(Undo::Return);
        Ok(stored)
    }

    async fn find_agent(&mut self, id: AgentId) -> Result<Option<DeliveryAgent>, CommandError> {
        Ok(self.state.agents.get(&id).cloned())
    }

    async fn lock_customer(&mut self, id: CustomerId) -> Result<Option<Customer>, CommandError> {
        Ok(self.state.customers.get(&id).cloned())
    }

    async fn adjust_dues(&mut self, customer_id: CustomerId, delta: Decimal) -> Result<Decimal, CommandError> {
        let current = self
            .state
            .customers
            .get(&customer_id)
            .map(|customer| customer.dues_balance)
            .ok_or_else(|| CommandError::not_found(Entity::Customer, customer_id.0))?;
        let balance = current + delta;
        self.set_balance(customer_id, balance)?;
        Ok(balance)
    }

    async fn set_dues(&mut self, customer_id: CustomerId, balance: Decimal) -> Result<(), CommandError> {
        self.set_balance(customer_id, balance)
    }

    async fn insert_clearance(&mut self, record: &NewDueClearance) -> Result<DueClearance, CommandError> {
        let stored = record
            .clone()
            .with_id(ClearanceId(next(&self.sequences.clearances)));
        self.state.clearances.push(stored.clone());
        self.undo.push(Undo::Clearance);
        Ok(stored)
    }

    async fn commit(self: Box<Self>) -> Result<(), CommandError> {
        let mut tx = self;
        if tx.fail_commit.swap(false, Ordering::SeqCst) {
            // Dropping `tx` rolls the writes back.
            return Err(CommandError::StorageFailure("injected commit failure".to_string()));
        }

        tx.committed = true;
        tx.undo.clear();
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
