//! Payment recording workflow.
//!
//! Orchestrates partial/full payment recording, invoice status transitions,
//! and the best-effort visit side effect. The hard rule here: the
//! idempotency check runs before the optimistic-lock rejection, so a client
//! that already charged successfully but never saw the response cannot be
//! double-charged on retry.

use crate::error::BillingError;
use crate::gateways::{
    audit_best_effort, notify_best_effort, Audience, AuditEvent, AuditGateway,
    NotificationGateway, VisitGateway,
};
use crate::models::{
    HoldPatch, Invoice, InvoicePatch, InvoiceStatus, PaymentTransaction, RecordPayment,
};
use crate::services::metrics::{ERRORS_TOTAL, INVOICES_TOTAL, PAYMENTS_TOTAL, SAGA_ROLLBACKS_TOTAL};
use crate::services::saga::{Compensation, Saga, SagaFailure};
use crate::services::store::BillingStore;
use crate::services::totals;
use crate::workflows::drive_visit_completion;
use billing_core::config::BillingSettings;
use billing_core::retry::{retry_transient, RetryConfig};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Business policy applied to incoming payments. The installment cap is
/// deliberately configuration, not a constant: the number is a clinic policy
/// with no engineering rationale and may be revisited without touching the
/// workflow.
#[derive(Clone, Copy, Debug)]
pub struct PaymentPolicy {
    /// Sub-total installments accepted before the next payment must clear
    /// the balance.
    pub max_partial_payments: u32,
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            max_partial_payments: 2,
        }
    }
}

impl From<&BillingSettings> for PaymentPolicy {
    fn from(settings: &BillingSettings) -> Self {
        Self {
            max_partial_payments: settings.max_partial_payments,
        }
    }
}

/// Result of a payment request.
#[derive(Debug)]
pub enum PaymentOutcome {
    Recorded {
        invoice: Invoice,
        payment: PaymentTransaction,
    },
    /// The request was already applied (the invoice is paid); current state
    /// returned without a new charge.
    Duplicate { invoice: Invoice },
}

pub struct PaymentWorkflow {
    store: Arc<dyn BillingStore>,
    visits: Arc<dyn VisitGateway>,
    notifications: Arc<dyn NotificationGateway>,
    audit: Arc<dyn AuditGateway>,
    policy: PaymentPolicy,
    retry: RetryConfig,
}

impl PaymentWorkflow {
    pub fn new(
        store: Arc<dyn BillingStore>,
        visits: Arc<dyn VisitGateway>,
        notifications: Arc<dyn NotificationGateway>,
        audit: Arc<dyn AuditGateway>,
    ) -> Self {
        Self {
            store,
            visits,
            notifications,
            audit,
            policy: PaymentPolicy::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: PaymentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn load_invoice(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        retry_transient(&self.retry, "get_invoice", || {
            self.store.get_invoice(invoice_id)
        })
        .await?
        .ok_or(BillingError::InvoiceNotFound(invoice_id))
    }

    /// Read an invoice, repairing a paid-invoice/stuck-visit mismatch on the
    /// way out. A crash between the completion saga's two steps leaves
    /// exactly that mismatch behind; the next read closes it.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Invoice, BillingError> {
        let invoice = self.load_invoice(invoice_id).await?;
        if invoice.status() == InvoiceStatus::Paid {
            drive_visit_completion(
                self.visits.as_ref(),
                self.notifications.as_ref(),
                &invoice,
                invoice.completed_by.as_deref(),
                "read",
            )
            .await;
        }
        Ok(invoice)
    }

    /// Record a payment against an invoice.
    ///
    /// Transitions the invoice to `paid` when the balance is cleared,
    /// otherwise to `partial_paid`, and then drives the linked visit toward
    /// `completed` (best-effort, never failing the payment).
    #[instrument(skip(self, payment), fields(invoice_id = %invoice_id, amount = %payment.amount))]
    pub async fn record_partial_payment(
        &self,
        invoice_id: Uuid,
        payment: RecordPayment,
        expected_version: Option<i64>,
    ) -> Result<PaymentOutcome, BillingError> {
        let result = self
            .record_inner(invoice_id, payment, expected_version)
            .await;
        if let Err(e) = &result {
            ERRORS_TOTAL.with_label_values(&[e.code()]).inc();
        }
        result
    }

    async fn record_inner(
        &self,
        invoice_id: Uuid,
        payment: RecordPayment,
        expected_version: Option<i64>,
    ) -> Result<PaymentOutcome, BillingError> {
        if payment.amount <= Decimal::ZERO {
            return Err(BillingError::InvalidPaymentAmount(payment.amount));
        }

        let invoice = self.load_invoice(invoice_id).await?;

        // Idempotency outranks optimistic-lock strictness: check the
        // terminal state before rejecting a stale version.
        if let Some(expected) = expected_version {
            if expected != invoice.version {
                if invoice.status() == InvoiceStatus::Paid {
                    info!(
                        invoice_id = %invoice_id,
                        "stale version against a paid invoice; treating as duplicate delivery"
                    );
                    drive_visit_completion(
                        self.visits.as_ref(),
                        self.notifications.as_ref(),
                        &invoice,
                        invoice.completed_by.as_deref(),
                        "idempotent_reentry",
                    )
                    .await;
                    return Ok(PaymentOutcome::Duplicate { invoice });
                }
                return Err(BillingError::VersionMismatch {
                    invoice_id,
                    current_version: invoice.version,
                    expected_version: expected,
                });
            }
        }

        let status = invoice.status();
        if matches!(status, InvoiceStatus::Cancelled | InvoiceStatus::OnHold) {
            return Err(BillingError::NotPayable { invoice_id, status });
        }

        if payment.amount > invoice.balance {
            return Err(BillingError::PaymentExceedsBalance {
                amount: payment.amount,
                balance: invoice.balance,
            });
        }

        let prior_payments = retry_transient(&self.retry, "list_payments", || {
            self.store.list_payments(invoice_id)
        })
        .await?;
        let partial_count = prior_payments
            .iter()
            .filter(|p| p.is_partial(invoice.total_amount))
            .count();
        if partial_count >= self.policy.max_partial_payments as usize
            && payment.amount < invoice.balance
        {
            return Err(BillingError::PartialPaymentLimit {
                recorded: partial_count,
                limit: self.policy.max_partial_payments,
            });
        }

        let items = retry_transient(&self.retry, "list_items", || {
            self.store.list_items(invoice_id)
        })
        .await?;

        // Payment row first, invoice second. A conflict on the invoice
        // write compensates the row away, so the committed payment sum
        // always equals paid_amount.
        let mut saga: Saga<'static, BillingError> = Saga::new();

        let store = Arc::clone(&self.store);
        let recorded = match saga
            .run_compensable(
                "record payment transaction",
                self.store.insert_payment(invoice_id, &payment),
                move |p: &PaymentTransaction| {
                    let payment_id = p.payment_id;
                    let compensation: Compensation<'static, BillingError> = Box::new(move || {
                        Box::pin(async move {
                            store.delete_payment(payment_id).await.map(|_| ())
                        })
                    });
                    compensation
                },
            )
            .await
        {
            Ok(p) => p,
            Err(failure) => return self.resolve_saga_failure(invoice_id, failure).await,
        };

        let mut all_payments = prior_payments;
        all_payments.push(recorded.clone());

        let recomputed = totals::calculate(
            &items,
            &all_payments,
            invoice.discount_amount,
            invoice.discount_percentage,
            invoice.tax_amount,
        );
        let new_status = if recomputed.balance <= Decimal::ZERO {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::PartialPaid
        };

        let patch = InvoicePatch {
            status: Some(new_status),
            subtotal: Some(recomputed.subtotal),
            discount_amount: Some(recomputed.discount_amount),
            tax_amount: Some(recomputed.tax_amount),
            total_amount: Some(recomputed.total_amount),
            paid_amount: Some(recomputed.paid_amount),
            balance: Some(recomputed.balance),
            hold: Some(if new_status == InvoiceStatus::PartialPaid {
                HoldPatch {
                    on_hold: false,
                    reason: Some(format!(
                        "awaiting remaining balance of {}",
                        recomputed.balance
                    )),
                    date: Some(Utc::now()),
                }
            } else {
                HoldPatch {
                    on_hold: false,
                    reason: None,
                    date: None,
                }
            }),
            ..Default::default()
        };

        // Always a concrete version: the caller's, or the one just read.
        let cas_version = expected_version.or(Some(invoice.version));
        let updated = match saga
            .run(
                "apply payment to invoice",
                self.store.update_invoice(invoice_id, cas_version, &patch),
            )
            .await
        {
            Ok(inv) => inv,
            Err(failure) => return self.resolve_saga_failure(invoice_id, failure).await,
        };
        saga.commit();

        PAYMENTS_TOTAL
            .with_label_values(&[recorded.payment_method.as_str()])
            .inc();
        INVOICES_TOTAL
            .with_label_values(&[updated.status().as_str()])
            .inc();

        info!(
            invoice_id = %invoice_id,
            payment_id = %recorded.payment_id,
            status = updated.status().as_str(),
            balance = %updated.balance,
            "Payment recorded"
        );

        audit_best_effort(
            self.audit.as_ref(),
            AuditEvent {
                action: "payment_recorded",
                invoice_id,
                actor: Some(recorded.received_by.clone()),
                detail: serde_json::json!({
                    "payment_id": recorded.payment_id,
                    "amount": recorded.amount.to_string(),
                    "status": updated.status().as_str(),
                    "balance": updated.balance.to_string(),
                }),
            },
        )
        .await;

        // Any payment drives the linked visit toward completed. This must
        // not fail the payment.
        drive_visit_completion(
            self.visits.as_ref(),
            self.notifications.as_ref(),
            &updated,
            Some(recorded.received_by.as_str()),
            "payment",
        )
        .await;

        Ok(PaymentOutcome::Recorded {
            invoice: updated,
            payment: recorded,
        })
    }

    async fn resolve_saga_failure(
        &self,
        invoice_id: Uuid,
        failure: SagaFailure<BillingError>,
    ) -> Result<PaymentOutcome, BillingError> {
        match failure {
            SagaFailure::RolledBack { step, source } => {
                SAGA_ROLLBACKS_TOTAL
                    .with_label_values(&["payment", "clean"])
                    .inc();
                if matches!(source, BillingError::VersionMismatch { .. }) {
                    // Terminal-state check again: the conflicting writer may
                    // have just finished paying this invoice.
                    if let Some(current) = self.store.get_invoice(invoice_id).await? {
                        if current.status() == InvoiceStatus::Paid {
                            info!(
                                invoice_id = %invoice_id,
                                step,
                                "conflicting writer paid the invoice; treating as duplicate delivery"
                            );
                            return Ok(PaymentOutcome::Duplicate { invoice: current });
                        }
                    }
                }
                Err(source)
            }
            SagaFailure::RollbackIncomplete {
                step,
                source,
                compensation_failures,
            } => {
                SAGA_ROLLBACKS_TOTAL
                    .with_label_values(&["payment", "incomplete"])
                    .inc();
                error!(
                    invoice_id = %invoice_id,
                    step,
                    failed_compensations = compensation_failures.len(),
                    "rollback incomplete; billing state is known-inconsistent"
                );
                notify_best_effort(
                    self.notifications.as_ref(),
                    Audience::Operators,
                    &format!(
                        "ROLLBACK INCOMPLETE on invoice {invoice_id}: '{step}' failed ({source}) \
                         and {} compensation(s) also failed; manual reconciliation required",
                        compensation_failures.len()
                    ),
                )
                .await;
                Err(BillingError::RollbackIncomplete {
                    invoice_id,
                    step,
                    reason: source.to_string(),
                    failed_compensations: compensation_failures.len(),
                })
            }
        }
    }
}
