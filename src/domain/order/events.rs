use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::value_objects::{AgentId, NewReturn, OrderItem, PaymentMethod};

// ============================================================================
// Order lifecycle changes
// ============================================================================

/// Event type published to viewers after a change commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderEventType {
    OrderCreated,
    OrderUpdated,
    OrderAssigned,
    OrderOutForDelivery,
    OrderDelivered,
    OrderCancelled,
    OrderReturned,
}

impl OrderEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderEventType::OrderCreated => "order-created",
            OrderEventType::OrderUpdated => "order-updated",
            OrderEventType::OrderAssigned => "order-assigned",
            OrderEventType::OrderOutForDelivery => "order-out-for-delivery",
            OrderEventType::OrderDelivered => "order-delivered",
            OrderEventType::OrderCancelled => "order-cancelled",
            OrderEventType::OrderReturned => "order-returned",
        }
    }
}

impl std::fmt::Display for OrderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated change to an existing order, produced by
/// `Order::handle_command` and folded in by `Order::apply_change`.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderChange {
    Assigned {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    OutForDelivery {
        at: DateTime<Utc>,
    },
    Delivered {
        payment_method: PaymentMethod,
        at: DateTime<Utc>,
    },
    Returned {
        record: NewReturn,
    },
    Cancelled {
        at: DateTime<Utc>,
    },
    Edited {
        items: Vec<OrderItem>,
        invoice_amount: Decimal,
        total_items: i64,
        notes: Option<String>,
        at: DateTime<Utc>,
    },
    Deleted,
}

impl OrderChange {
    /// `None` for changes that are not broadcast (physical deletion).
    pub fn event_type(&self) -> Option<OrderEventType> {
        match self {
            OrderChange::Assigned { .. } => Some(OrderEventType::OrderAssigned),
            OrderChange::OutForDelivery { .. } => Some(OrderEventType::OrderOutForDelivery),
            OrderChange::Delivered { .. } => Some(OrderEventType::OrderDelivered),
            OrderChange::Returned { .. } => Some(OrderEventType::OrderReturned),
            OrderChange::Cancelled { .. } => Some(OrderEventType::OrderCancelled),
            OrderChange::Edited { .. } => Some(OrderEventType::OrderUpdated),
            OrderChange::Deleted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names_match_as_str() {
        let all = [
            OrderEventType::OrderCreated,
            OrderEventType::OrderUpdated,
            OrderEventType::OrderAssigned,
            OrderEventType::OrderOutForDelivery,
            OrderEventType::OrderDelivered,
            OrderEventType::OrderCancelled,
            OrderEventType::OrderReturned,
        ];
        for event_type in all {
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        }
    }

    #[test]
    fn test_deletion_is_not_broadcast() {
        assert_eq!(OrderChange::Deleted.event_type(), None);
        assert_eq!(
            OrderChange::Cancelled { at: Utc::now() }.event_type(),
            Some(OrderEventType::OrderCancelled)
        );
    }
}
