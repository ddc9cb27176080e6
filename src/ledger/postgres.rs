use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};

use crate::domain::dues::{CustomerHistory, DueClearance, NewDueClearance};
use crate::domain::errors::{CommandError, Entity};
use crate::domain::order::{
    AgentId, ClearanceId, Customer, CustomerId, DeliveryAgent, NewReturn, Order, OrderId,
    OrderItem, OrderReturn, ReturnId, StoreId,
};
use super::store::{LedgerStore, LedgerTransaction, NewAgent, NewCustomer};

// ============================================================================
// Postgres Ledger
// ============================================================================
//
// Orders, items, returns and clearances are relational rows; the dues cache
// is a column on `customers`. Conflicting writers are serialized with
// `SELECT ... FOR UPDATE` on the order (or customer) row inside one
// transaction, so an order update and its dependent inserts land atomically.
//
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id            BIGSERIAL PRIMARY KEY,
    store_id      BIGINT NOT NULL,
    name          TEXT NOT NULL,
    dues_balance  NUMERIC(14, 2) NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS delivery_agents (
    id        BIGSERIAL PRIMARY KEY,
    store_id  BIGINT NOT NULL,
    name      TEXT NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS order_id_seq;

CREATE TABLE IF NOT EXISTS orders (
    id                   BIGINT PRIMARY KEY,
    order_number         TEXT NOT NULL UNIQUE,
    invoice_number       TEXT UNIQUE,
    store_id             BIGINT NOT NULL,
    customer_id          BIGINT NOT NULL REFERENCES customers (id),
    invoice_amount       NUMERIC(14, 2) NOT NULL CHECK (invoice_amount >= 0),
    refunded_amount      NUMERIC(14, 2) NOT NULL DEFAULT 0,
    total_items          BIGINT NOT NULL,
    notes                TEXT,
    status               TEXT NOT NULL,
    assigned_agent_id    BIGINT REFERENCES delivery_agents (id),
    payment_method       TEXT,
    payment_status       TEXT,
    version              BIGINT NOT NULL,
    created_at           TIMESTAMPTZ NOT NULL,
    updated_at           TIMESTAMPTZ NOT NULL,
    assigned_at          TIMESTAMPTZ,
    out_for_delivery_at  TIMESTAMPTZ,
    delivered_at         TIMESTAMPTZ,
    cancelled_at         TIMESTAMPTZ,
    CHECK (refunded_amount <= invoice_amount)
);

CREATE INDEX IF NOT EXISTS orders_store_idx ON orders (store_id);
CREATE INDEX IF NOT EXISTS orders_customer_idx ON orders (customer_id);

CREATE TABLE IF NOT EXISTS order_items (
    order_id     BIGINT NOT NULL REFERENCES orders (id) ON DELETE CASCADE,
    position     INT NOT NULL,
    description  TEXT NOT NULL,
    quantity     INT NOT NULL CHECK (quantity >= 1),
    PRIMARY KEY (order_id, position)
);

CREATE TABLE IF NOT EXISTS order_returns (
    id             BIGSERIAL PRIMARY KEY,
    order_id       BIGINT NOT NULL REFERENCES orders (id),
    customer_id    BIGINT NOT NULL REFERENCES customers (id),
    return_type    TEXT NOT NULL,
    refund_amount  NUMERIC(14, 2) NOT NULL CHECK (refund_amount > 0),
    refund_method  TEXT NOT NULL,
    reason         TEXT,
    processed_at   TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS due_clearances (
    id              BIGSERIAL PRIMARY KEY,
    customer_id     BIGINT NOT NULL REFERENCES customers (id),
    amount          NUMERIC(14, 2) NOT NULL CHECK (amount > 0),
    payment_method  TEXT NOT NULL,
    cleared_on      DATE NOT NULL,
    notes           TEXT,
    recorded_at     TIMESTAMPTZ NOT NULL
);
"#;

const ORDER_COLUMNS: &str = "id, order_number, invoice_number, store_id, customer_id, \
    invoice_amount, refunded_amount, total_items, notes, status, assigned_agent_id, \
    payment_method, payment_status, version, created_at, updated_at, assigned_at, \
    out_for_delivery_at, delivered_at, cancelled_at";

const RETURN_COLUMNS: &str = "id, order_id, customer_id, return_type, refund_amount, \
    refund_method, reason, processed_at";

const CLEARANCE_COLUMNS: &str = "id, customer_id, amount, payment_method, cleared_on, notes, recorded_at";

fn storage(err: sqlx::Error) -> CommandError {
    tracing::error!(error = %err, "Ledger database error");
    CommandError::storage(err)
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(FromRow)]
struct OrderRow {
    id: i64,
    order_number: String,
    invoice_number: Option<String>,
    store_id: i64,
    customer_id: i64,
    invoice_amount: Decimal,
    refunded_amount: Decimal,
    total_items: i64,
    notes: Option<String>,
    status: String,
    assigned_agent_id: Option<i64>,
    payment_method: Option<String>,
    payment_status: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    assigned_at: Option<DateTime<Utc>>,
    out_for_delivery_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderItem>) -> Result<Order, CommandError> {
        Ok(Order {
            id: OrderId(self.id),
            order_number: self.order_number,
            invoice_number: self.invoice_number,
            store_id: StoreId(self.store_id),
            customer_id: CustomerId(self.customer_id),
            items,
            invoice_amount: self.invoice_amount,
            total_items: self.total_items,
            notes: self.notes,
            status: self.status.parse()?,
            assigned_agent_id: self.assigned_agent_id.map(AgentId),
            payment_method: self.payment_method.as_deref().map(str::parse).transpose()?,
            payment_status: self.payment_status.as_deref().map(str::parse).transpose()?,
            refunded_amount: self.refunded_amount,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            assigned_at: self.assigned_at,
            out_for_delivery_at: self.out_for_delivery_at,
            delivered_at: self.delivered_at,
            cancelled_at: self.cancelled_at,
        })
    }
}

#[derive(FromRow)]
struct ItemRow {
    order_id: i64,
    description: String,
    quantity: i32,
}

#[derive(FromRow)]
struct ReturnRow {
    id: i64,
    order_id: i64,
    customer_id: i64,
    return_type: String,
    refund_amount: Decimal,
    refund_method: String,
    reason: Option<String>,
    processed_at: DateTime<Utc>,
}

impl TryFrom<ReturnRow> for OrderReturn {
    type Error = CommandError;

    fn try_from(row: ReturnRow) -> Result<Self, Self::Error> {
        Ok(OrderReturn {
            id: ReturnId(row.id),
            order_id: OrderId(row.order_id),
            customer_id: CustomerId(row.customer_id),
            return_type: row.return_type.parse()?,
            refund_amount: row.refund_amount,
            refund_method: row.refund_method.parse()?,
            reason: row.reason,
            processed_at: row.processed_at,
        })
    }
}

#[derive(FromRow)]
struct ClearanceRow {
    id: i64,
    customer_id: i64,
    amount: Decimal,
    payment_method: String,
    cleared_on: NaiveDate,
    notes: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<ClearanceRow> for DueClearance {
    type Error = CommandError;

    fn try_from(row: ClearanceRow) -> Result<Self, Self::Error> {
        Ok(DueClearance {
            id: ClearanceId(row.id),
            customer_id: CustomerId(row.customer_id),
            amount: row.amount,
            payment_method: row.payment_method.parse()?,
            cleared_on: row.cleared_on,
            notes: row.notes,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(FromRow)]
struct CustomerRow {
    id: i64,
    store_id: i64,
    name: String,
    dues_balance: Decimal,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            id: CustomerId(row.id),
            store_id: StoreId(row.store_id),
            name: row.name,
            dues_balance: row.dues_balance,
        }
    }
}

#[derive(FromRow)]
struct AgentRow {
    id: i64,
    store_id: i64,
    name: String,
}

impl From<AgentRow> for DeliveryAgent {
    fn from(row: AgentRow) -> Self {
        DeliveryAgent {
            id: AgentId(row.id),
            store_id: StoreId(row.store_id),
            name: row.name,
        }
    }
}

/// Attach item lists to a batch of order rows.
async fn hydrate_orders(conn: &mut PgConnection, rows: Vec<OrderRow>) -> Result<Vec<Order>, CommandError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    let item_rows: Vec<ItemRow> = sqlx::query_as(
        "SELECT order_id, description, quantity FROM order_items
         WHERE order_id = ANY($1)
         ORDER BY order_id, position",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(storage)?;

    let mut items: HashMap<i64, Vec<OrderItem>> = HashMap::new();
    for row in item_rows {
        items
            .entry(row.order_id)
            .or_default()
            .push(OrderItem::new(row.description, row.quantity));
    }

    rows.into_iter()
        .map(|row| {
            let order_items = items.remove(&row.id).unwrap_or_default();
            row.into_order(order_items)
        })
        .collect()
}

async fn fetch_order(conn: &mut PgConnection, id: OrderId, for_update: bool) -> Result<Option<Order>, CommandError> {
    let sql = format!(
        "SELECT {} FROM orders WHERE id = $1{}",
        ORDER_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<OrderRow> = sqlx::query_as(&sql)
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage)?;

    match row {
        Some(row) => Ok(hydrate_orders(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

async fn fetch_orders_where(
    conn: &mut PgConnection,
    filter: &str,
    param: Option<i64>,
) -> Result<Vec<Order>, CommandError> {
    let sql = format!("SELECT {} FROM orders WHERE {} ORDER BY id", ORDER_COLUMNS, filter);
    let rows: Vec<OrderRow> = sqlx::query_as(&sql)
        .bind(param)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage)?;
    hydrate_orders(conn, rows).await
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CommandError> {
        tracing::info!(max_connections, "Connecting ledger to Postgres");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(storage)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables, sequence and indexes when missing.
    pub async fn ensure_schema(&self) -> Result<(), CommandError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        tracing::info!("Ledger schema ready");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, CommandError> {
        let tx = self.pool.begin().await.map_err(storage)?;
        Ok(Box::new(PgLedgerTransaction {
            tx,
            locked_items: HashMap::new(),
        }))
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, CommandError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        fetch_order(&mut conn, id, false).await
    }

    async fn list_orders(&self, store: Option<StoreId>) -> Result<Vec<Order>, CommandError> {
        let mut conn = self.pool.acquire().await.map_err(storage)?;
        fetch_orders_where(
            &mut conn,
            "($1::BIGINT IS NULL OR store_id = $1)",
            store.map(StoreId::value),
        )
        .await
    }

    async fn list_returns(&self, order_id: OrderId) -> Result<Vec<OrderReturn>, CommandError> {
        let sql = format!("SELECT {} FROM order_returns WHERE order_id = $1 ORDER BY id", RETURN_COLUMNS);
        let rows: Vec<ReturnRow> = sqlx::query_as(&sql)
            .bind(order_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.into_iter().map(OrderReturn::try_from).collect()
    }

    async fn get_customer(&self, id: CustomerId) -> Result<Option<Customer>, CommandError> {
        let row: Option<CustomerRow> =
            sqlx::query_as("SELECT id, store_id, name, dues_balance FROM customers WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(row.map(Customer::from))
    }

    async fn list_clearances(&self, customer_id: CustomerId) -> Result<Vec<DueClearance>, CommandError> {
        let sql = format!(
            "SELECT {} FROM due_clearances WHERE customer_id = $1 ORDER BY id",
            CLEARANCE_COLUMNS
        );
        let rows: Vec<ClearanceRow> = sqlx::query_as(&sql)
            .bind(customer_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.into_iter().map(DueClearance::try_from).collect()
    }

    async fn customer_history(&self, customer_id: CustomerId) -> Result<CustomerHistory, CommandError> {
        // One snapshot for the three reads so the sum is consistent.
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM customers WHERE id = $1")
            .bind(customer_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        if exists.is_none() {
            return Err(CommandError::not_found(Entity::Customer, customer_id.0));
        }

        let orders = fetch_orders_where(&mut tx, "customer_id = $1", Some(customer_id.0)).await?;

        let sql = format!("SELECT {} FROM order_returns WHERE customer_id = $1 ORDER BY id", RETURN_COLUMNS);
        let returns: Vec<ReturnRow> = sqlx::query_as(&sql)
            .bind(customer_id.0)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;

        let sql = format!(
            "SELECT {} FROM due_clearances WHERE customer_id = $1 ORDER BY id",
            CLEARANCE_COLUMNS
        );
        let clearances: Vec<ClearanceRow> = sqlx::query_as(&sql)
            .bind(customer_id.0)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        Ok(CustomerHistory {
            orders,
            returns: returns
                .into_iter()
                .map(OrderReturn::try_from)
                .collect::<Result<_, _>>()?,
            clearances: clearances
                .into_iter()
                .map(DueClearance::try_from)
                .collect::<Result<_, _>>()?,
        })
    }

    async fn register_customer(&self, customer: NewCustomer) -> Result<Customer, CommandError> {
        let row: CustomerRow = sqlx::query_as(
            "INSERT INTO customers (store_id, name) VALUES ($1, $2)
             RETURNING id, store_id, name, dues_balance",
        )
        .bind(customer.store_id.0)
        .bind(&customer.name)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.into())
    }

    async fn register_agent(&self, agent: NewAgent) -> Result<DeliveryAgent, CommandError> {
        let row: AgentRow = sqlx::query_as(
            "INSERT INTO delivery_agents (store_id, name) VALUES ($1, $2)
             RETURNING id, store_id, name",
        )
        .bind(agent.store_id.0)
        .bind(&agent.name)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.into())
    }
}

// ============================================================================
// Transaction
// ============================================================================

struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
    /// Item lists as read under lock, to skip rewriting unchanged items.
    locked_items: HashMap<OrderId, Vec<OrderItem>>,
}

impl PgLedgerTransaction {
    async fn replace_items(&mut self, order: &Order) -> Result<(), CommandError> {
        sqlx::query("DELETE FROM order_items WHERE order_id = $1")
            .bind(order.id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(storage)?;

        for (position, item) in order.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (order_id, position, description, quantity)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(order.id.0)
            .bind(position as i32)
            .bind(&item.description)
            .bind(item.quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(storage)?;
        }

        self.locked_items.insert(order.id, order.items.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    async fn allocate_order_id(&mut self) -> Result<OrderId, CommandError> {
        let id: i64 = sqlx::query_scalar("SELECT nextval('order_id_seq')")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(storage)?;
        Ok(OrderId(id))
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), CommandError> {
        let sql = format!(
            "INSERT INTO orders ({}) VALUES
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
            ORDER_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(order.id.0)
            .bind(&order.order_number)
            .bind(&order.invoice_number)
            .bind(order.store_id.0)
            .bind(order.customer_id.0)
            .bind(order.invoice_amount)
            .bind(order.refunded_amount)
            .bind(order.total_items)
            .bind(&order.notes)
            .bind(order.status.as_str())
            .bind(order.assigned_agent_id.map(AgentId::value))
            .bind(order.payment_method.map(|m| m.as_str()))
            .bind(order.payment_status.map(|s| s.as_str()))
            .bind(order.version)
            .bind(order.created_at)
            .bind(order.updated_at)
            .bind(order.assigned_at)
            .bind(order.out_for_delivery_at)
            .bind(order.delivered_at)
            .bind(order.cancelled_at)
            .execute(&mut *self.tx)
            .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(CommandError::InvalidInput {
                    field: "invoice_number",
                    reason: format!(
                        "invoice number {} is already used",
                        order.invoice_number.as_deref().unwrap_or_default()
                    ),
                });
            }
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                return Err(CommandError::not_found(Entity::Customer, order.customer_id.0));
            }
            Err(err) => return Err(storage(err)),
        }

        self.replace_items(order).await
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, CommandError> {
        let order = fetch_order(&mut self.tx, id, true).await?;
        if let Some(order) = &order {
            self.locked_items.insert(order.id, order.items.clone());
        }
        Ok(order)
    }

    async fn update_order(&mut self, order: &Order) -> Result<(), CommandError> {
        let result = sqlx::query(
            "UPDATE orders SET
                invoice_amount = $2, refunded_amount = $3, total_items = $4, notes = $5,
                status = $6, assigned_agent_id = $7, payment_method = $8, payment_status = $9,
                version = $10, updated_at = $11, assigned_at = $12, out_for_delivery_at = $13,
                delivered_at = $14, cancelled_at = $15
             WHERE id = $1",
        )
        .bind(order.id.0)
        .bind(order.invoice_amount)
        .bind(order.refunded_amount)
        .bind(order.total_items)
        .bind(&order.notes)
        .bind(order.status.as_str())
        .bind(order.assigned_agent_id.map(AgentId::value))
        .bind(order.payment_method.map(|m| m.as_str()))
        .bind(order.payment_status.map(|s| s.as_str()))
        .bind(order.version)
        .bind(order.updated_at)
        .bind(order.assigned_at)
        .bind(order.out_for_delivery_at)
        .bind(order.delivered_at)
        .bind(order.cancelled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(CommandError::not_found(Entity::Order, order.id.0));
        }

        if self.locked_items.get(&order.id) != Some(&order.items) {
            self.replace_items(order).await?;
        }
        Ok(())
    }

    async fn delete_order(&mut self, id: OrderId) -> Result<(), CommandError> {
        let result = sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(CommandError::not_found(Entity::Order, id.0));
        }
        self.locked_items.remove(&id);
        Ok(())
    }

    async fn insert_return(&mut self, record: &NewReturn) -> Result<OrderReturn, CommandError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO order_returns
                (order_id, customer_id, return_type, refund_amount, refund_method, reason, processed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(record.order_id.0)
        .bind(record.customer_id.0)
        .bind(record.return_type.as_str())
        .bind(record.refund_amount)
        .bind(record.refund_method.as_str())
        .bind(&record.reason)
        .bind(record.processed_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage)?;

        Ok(record.clone().with_id(ReturnId(id)))
    }

    async fn find_agent(&mut self, id: AgentId) -> Result<Option<DeliveryAgent>, CommandError> {
        let row: Option<AgentRow> =
            sqlx::query_as("SELECT id, store_id, name FROM delivery_agents WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(storage)?;
        Ok(row.map(DeliveryAgent::from))
    }

    async fn lock_customer(&mut self, id: CustomerId) -> Result<Option<Customer>, CommandError> {
        let row: Option<CustomerRow> = sqlx::query_as(
            "SELECT id, store_id, name, dues_balance FROM customers WHERE id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage)?;
        Ok(row.map(Customer::from))
    }

    async fn adjust_dues(&mut self, customer_id: CustomerId, delta: Decimal) -> Result<Decimal, CommandError> {
        let balance: Option<Decimal> = sqlx::query_scalar(
            "UPDATE customers SET dues_balance = dues_balance + $2 WHERE id = $1 RETURNING dues_balance",
        )
        .bind(customer_id.0)
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage)?;

        balance.ok_or_else(|| CommandError::not_found(Entity::Customer, customer_id.0))
    }

    async fn set_dues(&mut self, customer_id: CustomerId, balance: Decimal) -> Result<(), CommandError> {
        let result = sqlx::query("UPDATE customers SET dues_balance = $2 WHERE id = $1")
            .bind(customer_id.0)
            .bind(balance)
            .execute(&mut *self.tx)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(CommandError::not_found(Entity::Customer, customer_id.0));
        }
        Ok(())
    }

    async fn insert_clearance(&mut self, record: &NewDueClearance) -> Result<DueClearance, CommandError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO due_clearances
                (customer_id, amount, payment_method, cleared_on, notes, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(record.customer_id.0)
        .bind(record.amount)
        .bind(record.payment_method.as_str())
        .bind(record.cleared_on)
        .bind(&record.notes)
        .bind(record.recorded_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage)?;

        Ok(record.clone().with_id(ClearanceId(id)))
    }

    async fn commit(self: Box<Self>) -> Result<(), CommandError> {
        self.tx.commit().await.map_err(storage)
    }
}
