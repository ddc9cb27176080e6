use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::order::{ClearanceId, CustomerId, Order, OrderReturn, PaymentMethod};

// ============================================================================
// Dues Value Objects
// ============================================================================

/// Payload of the due-clearance command.
#[derive(Debug, Clone)]
pub struct ClearDues {
    pub customer_id: CustomerId,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub cleared_on: NaiveDate,
    pub notes: Option<String>,
}

/// Append-only record that a customer paid down outstanding dues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DueClearance {
    pub id: ClearanceId,
    pub customer_id: CustomerId,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub cleared_on: NaiveDate,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDueClearance {
    pub customer_id: CustomerId,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub cleared_on: NaiveDate,
    pub notes: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl NewDueClearance {
    pub fn with_id(self, id: ClearanceId) -> DueClearance {
        DueClearance {
            id,
            customer_id: self.customer_id,
            amount: self.amount,
            payment_method: self.payment_method,
            cleared_on: self.cleared_on,
            notes: self.notes,
            recorded_at: self.recorded_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuesCause {
    CreditDelivery,
    CreditReturn,
    Clearance,
}

impl DuesCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DuesCause::CreditDelivery => "credit_delivery",
            DuesCause::CreditReturn => "credit_return",
            DuesCause::Clearance => "clearance",
        }
    }
}

/// Signed adjustment to a customer's cached dues balance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuesDelta {
    pub customer_id: CustomerId,
    pub amount: Decimal,
    pub cause: DuesCause,
}

/// Everything in the ledger that contributes to one customer's dues.
#[derive(Debug, Clone, Default)]
pub struct CustomerHistory {
    pub orders: Vec<Order>,
    pub returns: Vec<OrderReturn>,
    pub clearances: Vec<DueClearance>,
}

impl CustomerHistory {
    /// Authoritative balance: credit-paid invoices, plus credit-method refunds,
    /// minus clearances.
    pub fn outstanding_dues(&self) -> Decimal {
        let credit_invoices: Decimal = self
            .orders
            .iter()
            .filter(|order| order.payment_method.is_some_and(PaymentMethod::is_credit))
            .map(|order| order.invoice_amount)
            .sum();

        let credit_refunds: Decimal = self
            .returns
            .iter()
            .filter(|record| record.refund_method.is_credit())
            .map(|record| record.refund_amount)
            .sum();

        let cleared: Decimal = self.clearances.iter().map(|c| c.amount).sum();

        credit_invoices + credit_refunds - cleared
    }
}

/// Cached balance next to the balance recomputed from history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DuesReport {
    pub customer_id: CustomerId,
    pub cached: Decimal,
    pub recomputed: Decimal,
}

impl DuesReport {
    pub fn is_consistent(&self) -> bool {
        self.cached == self.recomputed
    }

    pub fn drift(&self) -> Decimal {
        self.cached - self.recomputed
    }
}
