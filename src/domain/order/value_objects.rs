use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::errors::CommandError;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn value(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Ledger id of an order. Allocated from a sequence that never repeats.
    OrderId
);
numeric_id!(StoreId);
numeric_id!(CustomerId);
numeric_id!(
    /// Delivery personnel id
    AgentId
);
numeric_id!(ReturnId);
numeric_id!(ClearanceId);

// ============================================================================
// Money
// ============================================================================

const MONEY_SCALE: u32 = 2;

/// Validate a currency amount: non-negative and at most two fractional digits.
pub fn validate_money(field: &'static str, amount: Decimal) -> Result<Decimal, CommandError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(CommandError::InvalidAmount {
            field,
            amount,
            reason: "must not be negative".to_string(),
        });
    }
    let normalized = amount.normalize();
    if normalized.scale() > MONEY_SCALE {
        return Err(CommandError::InvalidAmount {
            field,
            amount,
            reason: format!("must have at most {} decimal places", MONEY_SCALE),
        });
    }
    Ok(amount.round_dp(MONEY_SCALE))
}

/// Like [`validate_money`] but also rejects zero.
pub fn validate_positive_money(field: &'static str, amount: Decimal) -> Result<Decimal, CommandError> {
    let amount = validate_money(field, amount)?;
    if amount.is_zero() {
        return Err(CommandError::InvalidAmount {
            field,
            amount,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(amount)
}

// ============================================================================
// Order Value Objects
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OrderItem {
    pub description: String,
    pub quantity: i32,
}

impl OrderItem {
    pub fn new(description: impl Into<String>, quantity: i32) -> Self {
        Self {
            description: description.into(),
            quantity,
        }
    }
}

/// Check an item list and return the total item count.
pub fn validate_items(items: &[OrderItem]) -> Result<i64, CommandError> {
    if items.is_empty() {
        return Err(CommandError::InvalidInput {
            field: "items",
            reason: "an order needs at least one item".to_string(),
        });
    }

    let mut total = 0i64;
    for (position, item) in items.iter().enumerate() {
        if item.description.trim().is_empty() {
            return Err(CommandError::InvalidInput {
                field: "items.description",
                reason: format!("item {} has an empty description", position + 1),
            });
        }
        if item.quantity < 1 {
            return Err(CommandError::InvalidInput {
                field: "items.quantity",
                reason: format!("item {} has quantity {}, minimum is 1", position + 1, item.quantity),
            });
        }
        total += i64::from(item.quantity);
    }
    Ok(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Assigned,
    OutForDelivery,
    Delivered,
    Cancelled,
    Returned,
    PartialReturned,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Created,
        OrderStatus::Assigned,
        OrderStatus::OutForDelivery,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::Returned,
        OrderStatus::PartialReturned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Assigned => "ASSIGNED",
            OrderStatus::OutForDelivery => "OUT_FOR_DELIVERY",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Returned => "RETURNED",
            OrderStatus::PartialReturned => "PARTIAL_RETURNED",
        }
    }

    /// Items, amount and notes may only change while the order is still open.
    pub fn is_editable(self) -> bool {
        matches!(
            self,
            OrderStatus::Created | OrderStatus::Assigned | OrderStatus::OutForDelivery
        )
    }

    pub fn accepts_returns(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::PartialReturned)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CommandError::StorageFailure(format!("unknown order status '{}'", s)))
    }
}

/// How an invoice was settled, or how a refund was paid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Upi,
    CustomerCredit,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "CASH",
            PaymentMethod::Card => "CARD",
            PaymentMethod::Upi => "UPI",
            PaymentMethod::CustomerCredit => "CUSTOMER_CREDIT",
        }
    }

    pub fn is_credit(self) -> bool {
        self == PaymentMethod::CustomerCredit
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CASH" => Ok(PaymentMethod::Cash),
            "CARD" => Ok(PaymentMethod::Card),
            "UPI" => Ok(PaymentMethod::Upi),
            "CUSTOMER_CREDIT" => Ok(PaymentMethod::CustomerCredit),
            other => Err(CommandError::StorageFailure(format!("unknown payment method '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            other => Err(CommandError::StorageFailure(format!("unknown payment status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnType {
    Full,
    Partial,
}

impl ReturnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReturnType::Full => "FULL",
            ReturnType::Partial => "PARTIAL",
        }
    }
}

impl FromStr for ReturnType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FULL" => Ok(ReturnType::Full),
            "PARTIAL" => Ok(ReturnType::Partial),
            other => Err(CommandError::StorageFailure(format!("unknown return type '{}'", other))),
        }
    }
}

// ============================================================================
// Order snapshot
// ============================================================================

/// Full current representation of an order. This is also the payload every
/// lifecycle event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    pub invoice_number: Option<String>,
    pub store_id: StoreId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub invoice_amount: Decimal,
    pub total_items: i64,
    pub notes: Option<String>,
    pub status: OrderStatus,

    pub assigned_agent_id: Option<AgentId>,
    pub payment_method: Option<PaymentMethod>,
    pub payment_status: Option<PaymentStatus>,
    /// Sum of all returns processed against this order.
    pub refunded_amount: Decimal,

    /// Bumped on every committed change
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub out_for_delivery_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn order_number_for(id: OrderId) -> String {
        format!("ORD-{:06}", id.0)
    }

    pub fn remaining_refundable(&self) -> Decimal {
        self.invoice_amount - self.refunded_amount
    }

    /// Time between assignment and delivery.
    pub fn delivery_duration(&self) -> Option<Duration> {
        match (self.assigned_at, self.delivered_at) {
            (Some(assigned), Some(delivered)) => Some(delivered - assigned),
            _ => None,
        }
    }

    /// Last-write-wins ordering used by subscribers applying snapshots.
    pub fn supersedes(&self, other: &Order) -> bool {
        (self.updated_at, self.version) > (other.updated_at, other.version)
    }
}

/// A refund processed against a delivered order. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReturn {
    pub id: ReturnId,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub return_type: ReturnType,
    pub refund_amount: Decimal,
    pub refund_method: PaymentMethod,
    pub reason: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Return record before the ledger assigns it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReturn {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub return_type: ReturnType,
    pub refund_amount: Decimal,
    pub refund_method: PaymentMethod,
    pub reason: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl NewReturn {
    pub fn with_id(self, id: ReturnId) -> OrderReturn {
        OrderReturn {
            id,
            order_id: self.order_id,
            customer_id: self.customer_id,
            return_type: self.return_type,
            refund_amount: self.refund_amount,
            refund_method: self.refund_method,
            reason: self.reason,
            processed_at: self.processed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAgent {
    pub id: AgentId,
    pub store_id: StoreId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub store_id: StoreId,
    pub name: String,
    /// Materialized dues balance. Always re-derivable from the ledger.
    pub dues_balance: Decimal,
}

// ============================================================================
// Unit Tests
// ============================================================================
