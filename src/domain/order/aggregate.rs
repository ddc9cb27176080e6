use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::errors::{CommandError, Operation};
use super::commands::{CreateOrder, OrderCommand};
use super::events::OrderChange;
use super::value_objects::{
    validate_items, validate_money, validate_positive_money, NewReturn, Order, OrderId,
    OrderStatus, PaymentStatus, ReturnType,
};

// ============================================================================
// Order State Machine
// ============================================================================
//
//   CREATED ──assign──▶ ASSIGNED ──advance──▶ OUT_FOR_DELIVERY ──deliver──▶ DELIVERED
//      │                   │                                                  │
//      └──cancel──▶ CANCELLED ◀──cancel──┘                return ▼            │
//                      │                        PARTIAL_RETURNED / RETURNED ◀─┘
//                   delete
//
// Edits keep the status and are allowed until delivery. Financial transitions
// (deliver, return) happen once; a retried assign to the same agent is a no-op.
//
// ============================================================================

/// Result of validating a command against the current snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Apply(OrderChange),
    /// The command was already applied with identical arguments.
    AlreadyApplied,
}

impl Order {
    /// Build the initial snapshot of a freshly allocated order.
    pub fn open(id: OrderId, draft: &CreateOrder, now: DateTime<Utc>) -> Result<Self, CommandError> {
        let (invoice_amount, total_items) = draft.validate()?;

        Ok(Self {
            id,
            order_number: Order::order_number_for(id),
            invoice_number: draft.invoice_number.as_ref().map(|n| n.trim().to_string()),
            store_id: draft.store_id,
            customer_id: draft.customer_id,
            items: draft.items.clone(),
            invoice_amount,
            total_items,
            notes: clean_text(draft.notes.as_deref()),
            status: OrderStatus::Created,
            assigned_agent_id: None,
            payment_method: None,
            payment_status: None,
            refunded_amount: Decimal::ZERO,
            version: 1,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            out_for_delivery_at: None,
            delivered_at: None,
            cancelled_at: None,
        })
    }

    fn reject(&self, operation: Operation) -> CommandError {
        CommandError::InvalidTransition {
            order_id: self.id,
            status: self.status,
            operation,
        }
    }

    /// Validate a command and describe the change it would make.
    pub fn handle_command(&self, command: &OrderCommand, now: DateTime<Utc>) -> Result<Decision, CommandError> {
        let operation = command.operation();

        match command {
            OrderCommand::Assign { agent_id } => match self.status {
                OrderStatus::Created => Ok(Decision::Apply(OrderChange::Assigned {
                    agent_id: *agent_id,
                    at: now,
                })),
                OrderStatus::Assigned if self.assigned_agent_id == Some(*agent_id) => {
                    Ok(Decision::AlreadyApplied)
                }
                _ => Err(self.reject(operation)),
            },

            OrderCommand::MarkOutForDelivery => match self.status {
                OrderStatus::Assigned => Ok(Decision::Apply(OrderChange::OutForDelivery { at: now })),
                _ => Err(self.reject(operation)),
            },

            OrderCommand::Deliver { payment_method } => match self.status {
                OrderStatus::OutForDelivery => Ok(Decision::Apply(OrderChange::Delivered {
                    payment_method: *payment_method,
                    at: now,
                })),
                _ => Err(self.reject(operation)),
            },

            OrderCommand::Return {
                return_type,
                amount,
                refund_method,
                reason,
            } => {
                if !self.status.accepts_returns() {
                    return Err(self.reject(operation));
                }

                let amount = validate_positive_money("refund_amount", *amount)?;
                let remaining = self.remaining_refundable();
                if amount > remaining {
                    return Err(CommandError::InvalidAmount {
                        field: "refund_amount",
                        amount,
                        reason: format!("exceeds the remaining refundable amount {}", remaining),
                    });
                }
                if *return_type == ReturnType::Full && amount != remaining {
                    return Err(CommandError::InvalidAmount {
                        field: "refund_amount",
                        amount,
                        reason: format!("a FULL return must refund the remaining {}", remaining),
                    });
                }

                Ok(Decision::Apply(OrderChange::Returned {
                    record: NewReturn {
                        order_id: self.id,
                        customer_id: self.customer_id,
                        return_type: *return_type,
                        refund_amount: amount,
                        refund_method: *refund_method,
                        reason: clean_text(reason.as_deref()),
                        processed_at: now,
                    },
                }))
            }

            OrderCommand::Cancel => match self.status {
                OrderStatus::Created | OrderStatus::Assigned => {
                    Ok(Decision::Apply(OrderChange::Cancelled { at: now }))
                }
                _ => Err(self.reject(operation)),
            },

            OrderCommand::Edit {
                items,
                invoice_amount,
                notes,
            } => {
                if !self.status.is_editable() {
                    return Err(self.reject(operation));
                }
                let total_items = validate_items(items)?;
                let invoice_amount = validate_money("invoice_amount", *invoice_amount)?;

                Ok(Decision::Apply(OrderChange::Edited {
                    items: items.clone(),
                    invoice_amount,
                    total_items,
                    notes: clean_text(notes.as_deref()),
                    at: now,
                }))
            }

            OrderCommand::Delete => match self.status {
                OrderStatus::Cancelled => Ok(Decision::Apply(OrderChange::Deleted)),
                _ => Err(self.reject(operation)),
            },
        }
    }

    /// Fold a validated change into the snapshot.
    pub fn apply_change(&mut self, change: &OrderChange) {
        match change {
            OrderChange::Assigned { agent_id, at } => {
                self.status = OrderStatus::Assigned;
                self.assigned_agent_id = Some(*agent_id);
                self.assigned_at = Some(*at);
                self.updated_at = *at;
            }
            OrderChange::OutForDelivery { at } => {
                self.status = OrderStatus::OutForDelivery;
                self.out_for_delivery_at = Some(*at);
                self.updated_at = *at;
            }
            OrderChange::Delivered { payment_method, at } => {
                self.status = OrderStatus::Delivered;
                self.payment_method = Some(*payment_method);
                // Credit deliveries are also PAID; the debt lives in the dues balance.
                self.payment_status = Some(PaymentStatus::Paid);
                self.delivered_at = Some(*at);
                self.updated_at = *at;
            }
            OrderChange::Returned { record } => {
                self.refunded_amount += record.refund_amount;
                self.status = if self.refunded_amount >= self.invoice_amount {
                    OrderStatus::Returned
                } else {
                    OrderStatus::PartialReturned
                };
                self.updated_at = record.processed_at;
            }
            OrderChange::Cancelled { at } => {
                self.status = OrderStatus::Cancelled;
                self.cancelled_at = Some(*at);
                self.updated_at = *at;
            }
            OrderChange::Edited {
                items,
                invoice_amount,
                total_items,
                notes,
                at,
            } => {
                self.items = items.clone();
                self.invoice_amount = *invoice_amount;
                self.total_items = *total_items;
                self.notes = notes.clone();
                self.updated_at = *at;
            }
            OrderChange::Deleted => {}
        }

        self.version += 1;
    }
}

fn clean_text(text: Option<&str>) -> Option<String> {
    text.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string)
}

// ============================================================================
// Unit Tests
// ============================================================================
