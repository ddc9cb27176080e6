use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::dues::{CustomerHistory, DueClearance, NewDueClearance};
use crate::domain::errors::CommandError;
use crate::domain::order::{
    AgentId, Customer, CustomerId, DeliveryAgent, NewReturn, Order, OrderId, OrderReturn, StoreId,
};

/// Reference data the excluded CRUD layer would normally own.
#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub store_id: StoreId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub store_id: StoreId,
    pub name: String,
}

/// Entry point to the ledger: consistent reads plus transactions for writes.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Start an atomic unit of work. Dropping the transaction without
    /// calling `commit` discards every write made through it.
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, CommandError>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, CommandError>;

    /// All orders of one store, or every order when `store` is `None`.
    async fn list_orders(&self, store: Option<StoreId>) -> Result<Vec<Order>, CommandError>;

    async fn list_returns(&self, order_id: OrderId) -> Result<Vec<OrderReturn>, CommandError>;

    async fn get_customer(&self, id: CustomerId) -> Result<Option<Customer>, CommandError>;

    async fn list_clearances(&self, customer_id: CustomerId) -> Result<Vec<DueClearance>, CommandError>;

    /// Every order, return and clearance that feeds the customer's dues.
    async fn customer_history(&self, customer_id: CustomerId) -> Result<CustomerHistory, CommandError>;

    async fn register_customer(&self, customer: NewCustomer) -> Result<Customer, CommandError>;

    async fn register_agent(&self, agent: NewAgent) -> Result<DeliveryAgent, CommandError>;
}

/// Writes against the ledger. Row reads inside a transaction take the lock
/// that serializes conflicting writers until commit or drop.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Reserve the next order id. Ids are never handed out twice, even when
    /// the reserving transaction rolls back.
    async fn allocate_order_id(&mut self) -> Result<OrderId, CommandError>;

    /// Fails with `InvalidInput` when the invoice number is already taken.
    async fn insert_order(&mut self, order: &Order) -> Result<(), CommandError>;

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, CommandError>;

    async fn update_order(&mut self, order: &Order) -> Result<(), CommandError>;

    /// Physically removes the order and its items.
    async fn delete_order(&mut self, id: OrderId) -> Result<(), CommandError>;

    async fn insert_return(&mut self, record: &NewReturn) -> Result<OrderReturn, CommandError>;

    async fn find_agent(&mut self, id: AgentId) -> Result<Option<DeliveryAgent>, CommandError>;

    async fn lock_customer(&mut self, id: CustomerId) -> Result<Option<Customer>, CommandError>;

    /// Add `delta` to the cached balance and return the new balance.
    async fn adjust_dues(&mut self, customer_id: CustomerId, delta: Decimal) -> Result<Decimal, CommandError>;

    /// Overwrite the cached balance (repair).
    async fn set_dues(&mut self, customer_id: CustomerId, balance: Decimal) -> Result<(), CommandError>;

    async fn insert_clearance(&mut self, record: &NewDueClearance) -> Result<DueClearance, CommandError>;

    async fn commit(self: Box<Self>) -> Result<(), CommandError>;
}
