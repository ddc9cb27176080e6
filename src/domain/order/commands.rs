use rust_decimal::Decimal;

use crate::domain::errors::{CommandError, Operation};
use super::value_objects::{
    validate_items, validate_money, AgentId, CustomerId, OrderItem, PaymentMethod, ReturnType, StoreId,
};

// ============================================================================
// Order Commands - Represent caller intent
// ============================================================================

/// Payload of the order-creation command.
#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub store_id: StoreId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderItem>,
    pub invoice_amount: Decimal,
    pub invoice_number: Option<String>,
    pub notes: Option<String>,
}

impl CreateOrder {
    /// Returns the normalized invoice amount and the total item count.
    pub fn validate(&self) -> Result<(Decimal, i64), CommandError> {
        let total_items = validate_items(&self.items)?;
        let amount = validate_money("invoice_amount", self.invoice_amount)?;
        if let Some(number) = &self.invoice_number {
            if number.trim().is_empty() {
                return Err(CommandError::InvalidInput {
                    field: "invoice_number",
                    reason: "must not be blank when given".to_string(),
                });
            }
        }
        Ok((amount, total_items))
    }
}

/// Commands against an existing order.
#[derive(Debug, Clone)]
pub enum OrderCommand {
    Assign {
        agent_id: AgentId,
    },
    MarkOutForDelivery,
    Deliver {
        payment_method: PaymentMethod,
    },
    Return {
        return_type: ReturnType,
        amount: Decimal,
        refund_method: PaymentMethod,
        reason: Option<String>,
    },
    Cancel,
    Edit {
        items: Vec<OrderItem>,
        invoice_amount: Decimal,
        notes: Option<String>,
    },
    Delete,
}

impl OrderCommand {
    pub fn operation(&self) -> Operation {
        match self {
            OrderCommand::Assign { .. } => Operation::Assign,
            OrderCommand::MarkOutForDelivery => Operation::MarkOutForDelivery,
            OrderCommand::Deliver { .. } => Operation::Deliver,
            OrderCommand::Return { .. } => Operation::Return,
            OrderCommand::Cancel => Operation::Cancel,
            OrderCommand::Edit { .. } => Operation::Edit,
            OrderCommand::Delete => Operation::Delete,
        }
    }
}
