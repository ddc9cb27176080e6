use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::errors::{CommandError, Entity};
use crate::domain::order::{validate_positive_money, CustomerId, Order, OrderChange};
use crate::ledger::{LedgerStore, LedgerTransaction};
use crate::metrics::Metrics;
use super::value_objects::{ClearDues, DueClearance, DuesCause, DuesDelta, DuesReport, NewDueClearance};

// ============================================================================
// Dues Reconciler
// ============================================================================
//
// The cached `dues_balance` on a customer is a materialized view of:
//
//   sum(credit-paid invoices) + sum(credit-method refunds) - sum(clearances)
//
// Every ledger write that moves one of those sums adjusts the cache inside
// the same transaction. `verify` / `repair` compare against (and rewrite from)
// the recomputed value.
//
// ============================================================================

const REPAIR_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct DuesReconciler {
    ledger: Arc<dyn LedgerStore>,
    metrics: Arc<Metrics>,
}

impl DuesReconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>, metrics: Arc<Metrics>) -> Self {
        Self { ledger, metrics }
    }

    /// Dues movement caused by applying `change` to `order`, if any.
    pub fn delta_for(order: &Order, change: &OrderChange) -> Option<DuesDelta> {
        match change {
            OrderChange::Delivered { payment_method, .. } if payment_method.is_credit() => Some(DuesDelta {
                customer_id: order.customer_id,
                amount: order.invoice_amount,
                cause: DuesCause::CreditDelivery,
            }),
            // Credit refunds are banked against the account, so they add to dues.
            OrderChange::Returned { record } if record.refund_method.is_credit() => Some(DuesDelta {
                customer_id: record.customer_id,
                amount: record.refund_amount,
                cause: DuesCause::CreditReturn,
            }),
            _ => None,
        }
    }

    /// Adjust the cached balance inside the caller's transaction.
    pub async fn apply_delta(
        &self,
        tx: &mut dyn LedgerTransaction,
        delta: &DuesDelta,
    ) -> Result<Decimal, CommandError> {
        let balance = tx.adjust_dues(delta.customer_id, delta.amount).await?;
        tracing::debug!(
            customer_id = %delta.customer_id,
            delta = %delta.amount,
            cause = delta.cause.as_str(),
            balance = %balance,
            "Dues adjusted"
        );
        Ok(balance)
    }

    /// Authoritative balance walked from the customer's full history.
    pub async fn recompute(&self, customer_id: CustomerId) -> Result<Decimal, CommandError> {
        let history = self.ledger.customer_history(customer_id).await?;
        Ok(history.outstanding_dues())
    }

    pub async fn verify(&self, customer_id: CustomerId) -> Result<DuesReport, CommandError> {
        let customer = self
            .ledger
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| CommandError::not_found(Entity::Customer, customer_id.0))?;
        let recomputed = self.recompute(customer_id).await?;

        let report = DuesReport {
            customer_id,
            cached: customer.dues_balance,
            recomputed,
        };
        if !report.is_consistent() {
            self.metrics.dues_mismatches_total.inc();
            tracing::warn!(
                customer_id = %customer_id,
                cached = %report.cached,
                recomputed = %report.recomputed,
                drift = %report.drift(),
                "Dues cache drifted from ledger"
            );
        }
        Ok(report)
    }

    /// Rewrite the cache to the recomputed value. The write only lands if the
    /// cached balance is still the one the recompute was compared against.
    pub async fn repair(&self, customer_id: CustomerId) -> Result<DuesReport, CommandError> {
        for _ in 0..REPAIR_ATTEMPTS {
            let report = self.verify(customer_id).await?;
            if report.is_consistent() {
                return Ok(report);
            }

            let mut tx = self.ledger.begin().await?;
            let customer = tx
                .lock_customer(customer_id)
                .await?
                .ok_or_else(|| CommandError::not_found(Entity::Customer, customer_id.0))?;
            if customer.dues_balance != report.cached {
                continue;
            }
            tx.set_dues(customer_id, report.recomputed).await?;
            tx.commit().await?;

            self.metrics.dues_repairs_total.inc();
            tracing::info!(
                customer_id = %customer_id,
                from = %report.cached,
                to = %report.recomputed,
                "Dues cache repaired"
            );
            return Ok(DuesReport {
                cached: report.recomputed,
                ..report
            });
        }

        Err(CommandError::storage(format!(
            "dues for customer {} kept changing during repair",
            customer_id
        )))
    }

    /// Record a payment against outstanding dues in its own transaction.
    /// Returns the clearance and the new cached balance.
    pub async fn clear_dues(
        &self,
        command: &ClearDues,
        now: DateTime<Utc>,
    ) -> Result<(DueClearance, Decimal), CommandError> {
        let amount = validate_positive_money("amount", command.amount)?;

        let mut tx = self.ledger.begin().await?;
        let customer = tx
            .lock_customer(command.customer_id)
            .await?
            .ok_or_else(|| CommandError::not_found(Entity::Customer, command.customer_id.0))?;

        if amount > customer.dues_balance {
            return Err(CommandError::InvalidAmount {
                field: "amount",
                amount,
                reason: format!("exceeds outstanding dues {}", customer.dues_balance),
            });
        }

        let clearance = tx
            .insert_clearance(&NewDueClearance {
                customer_id: command.customer_id,
                amount,
                payment_method: command.payment_method,
                cleared_on: command.cleared_on,
                notes: command
                    .notes
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string),
                recorded_at: now,
            })
            .await?;

        let balance = self
            .apply_delta(
                tx.as_mut(),
                &DuesDelta {
                    customer_id: command.customer_id,
                    amount: -amount,
                    cause: DuesCause::Clearance,
                },
            )
            .await?;
        tx.commit().await?;

        Ok((clearance, balance))
    }
}
