use std::fmt;

use rust_decimal::Decimal;

use crate::domain::order::{OrderId, OrderStatus, StoreId};
use crate::utils::IsTransient;

// ============================================================================
// Command Errors
// ============================================================================
//
// Every failure a core command can report. Caller errors (InvalidTransition,
// InvalidAmount, InvalidInput, NotFound) are never retried. StorageFailure and
// PublishFailure are transient.
//
// ============================================================================

/// Operation a caller attempted on an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Assign,
    MarkOutForDelivery,
    Deliver,
    Return,
    Cancel,
    Edit,
    Delete,
    ClearDues,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Assign => "assign",
            Operation::MarkOutForDelivery => "mark_out_for_delivery",
            Operation::Deliver => "deliver",
            Operation::Return => "return",
            Operation::Cancel => "cancel",
            Operation::Edit => "edit",
            Operation::Delete => "delete",
            Operation::ClearDues => "clear_dues",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Order,
    Agent,
    Customer,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Order => f.write_str("order"),
            Entity::Agent => f.write_str("delivery agent"),
            Entity::Customer => f.write_str("customer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("cannot {operation} order {order_id} while it is {status}")]
    InvalidTransition {
        order_id: OrderId,
        status: OrderStatus,
        operation: Operation,
    },

    #[error("invalid {field} {amount}: {reason}")]
    InvalidAmount {
        field: &'static str,
        amount: Decimal,
        reason: String,
    },

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("{entity} {id} not found{}", .store.map(|s| format!(" in store {}", s)).unwrap_or_default())]
    NotFound {
        entity: Entity,
        id: i64,
        store: Option<StoreId>,
    },

    #[error("order {order_id} is being modified concurrently: {reason}")]
    ConcurrentModification { order_id: OrderId, reason: String },

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("publish to {channel} failed: {reason}")]
    PublishFailure { channel: String, reason: String },
}

impl CommandError {
    pub fn not_found(entity: Entity, id: i64) -> Self {
        CommandError::NotFound {
            entity,
            id,
            store: None,
        }
    }

    pub fn storage(err: impl fmt::Display) -> Self {
        CommandError::StorageFailure(err.to_string())
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::InvalidTransition { .. } => "invalid_transition",
            CommandError::InvalidAmount { .. } => "invalid_amount",
            CommandError::InvalidInput { .. } => "invalid_input",
            CommandError::NotFound { .. } => "not_found",
            CommandError::ConcurrentModification { .. } => "concurrent_modification",
            CommandError::StorageFailure(_) => "storage_failure",
            CommandError::PublishFailure { .. } => "publish_failure",
        }
    }
}

impl IsTransient for CommandError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            CommandError::StorageFailure(_) | CommandError::PublishFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_detail() {
        let err = CommandError::InvalidTransition {
            order_id: OrderId(7),
            status: OrderStatus::Created,
            operation: Operation::Deliver,
        };
        assert_eq!(err.to_string(), "cannot deliver order 7 while it is CREATED");

        let err = CommandError::NotFound {
            entity: Entity::Agent,
            id: 3,
            store: Some(StoreId(9)),
        };
        assert_eq!(err.to_string(), "delivery agent 3 not found in store 9");
        assert_eq!(CommandError::not_found(Entity::Order, 1).to_string(), "order 1 not found");
    }

    #[test]
    fn test_only_infrastructure_failures_are_transient() {
        assert!(CommandError::StorageFailure("down".into()).is_transient());
        assert!(CommandError::PublishFailure {
            channel: "admin".into(),
            reason: "closed".into()
        }
        .is_transient());
        assert!(!CommandError::not_found(Entity::Customer, 1).is_transient());
        assert!(!CommandError::ConcurrentModification {
            order_id: OrderId(1),
            reason: "lock wait timed out".into()
        }
        .is_transient());
    }
}
