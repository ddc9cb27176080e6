use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::order::{CustomerId, Order, OrderEventType, OrderId, OrderReturn, StoreId};

/// Audience an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Store(StoreId),
    Admin,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Store(id) => write!(f, "store:{}", id),
            Channel::Admin => f.write_str("admin"),
        }
    }
}

/// Published after a lifecycle change commits. Carries the full post-commit
/// snapshot so subscribers converge regardless of delivery order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub event_id: Uuid,
    pub event_type: OrderEventType,
    pub order_id: OrderId,
    pub store_id: StoreId,
    pub customer_id: CustomerId,
    pub snapshot: Order,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_record: Option<OrderReturn>,
    /// Customer balance after the commit, when the change moved dues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dues_balance: Option<Decimal>,
    pub committed_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(event_type: OrderEventType, snapshot: Order, committed_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type,
            order_id: snapshot.id,
            store_id: snapshot.store_id,
            customer_id: snapshot.customer_id,
            snapshot,
            return_record: None,
            dues_balance: None,
            committed_at,
        }
    }

    pub fn with_return(mut self, record: OrderReturn) -> Self {
        self.return_record = Some(record);
        self
    }

    pub fn with_dues_balance(mut self, balance: Decimal) -> Self {
        self.dues_balance = Some(balance);
        self
    }

    /// The owning store's channel, then the admin channel.
    pub fn audiences(&self) -> [Channel; 2] {
        [Channel::Store(self.store_id), Channel::Admin]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{CreateOrder, OrderItem};
    use std::str::FromStr;

    fn snapshot() -> Order {
        let draft = CreateOrder {
            store_id: StoreId(3),
            customer_id: CustomerId(8),
            items: vec![OrderItem::new("Milk", 2)],
            invoice_amount: Decimal::from_str("12.50").unwrap(),
            invoice_number: None,
            notes: None,
        };
        Order::open(OrderId(21), &draft, Utc::now()).unwrap()
    }

    #[test]
    fn test_audiences_are_store_then_admin() {
        let event = LifecycleEvent::new(OrderEventType::OrderCreated, snapshot(), Utc::now());
        assert_eq!(event.audiences(), [Channel::Store(StoreId(3)), Channel::Admin]);
        assert_eq!(Channel::Store(StoreId(3)).to_string(), "store:3");
        assert_eq!(Channel::Admin.to_string(), "admin");
    }

    #[test]
    fn test_wire_shape() {
        let event = LifecycleEvent::new(OrderEventType::OrderDelivered, snapshot(), Utc::now())
            .with_dues_balance(Decimal::from_str("12.50").unwrap());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["eventType"], "order-delivered");
        assert_eq!(json["orderId"], 21);
        assert_eq!(json["storeId"], 3);
        assert_eq!(json["customerId"], 8);
        assert_eq!(json["snapshot"]["order_number"], "ORD-000021");
        assert!(json.get("returnRecord").is_none());
        assert!(json.get("duesBalance").is_some());

        let back: LifecycleEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
