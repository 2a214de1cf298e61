//! Invoice administration: creation, cancellation, hold/release.
//!
//! Invoices are created when a visit requires billing and are never
//! deleted; cancellation is the terminal alternative. All transitions go
//! through the versioned store.

use crate::error::BillingError;
use crate::gateways::{audit_best_effort, AuditEvent, AuditGateway};
use crate::models::{CreateInvoice, HoldPatch, Invoice, InvoicePatch, InvoiceStatus};
use crate::services::metrics::{ERRORS_TOTAL, INVOICES_TOTAL};
use crate::services::store::BillingStore;
use billing_core::retry::{retry_transient, RetryConfig};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct InvoiceWorkflow {
    store: Arc<dyn BillingStore>,
    audit: Arc<dyn AuditGateway>,
    retry: RetryConfig,
}

impl InvoiceWorkflow {
    pub fn new(store: Arc<dyn BillingStore>, audit: Arc<dyn AuditGateway>) -> Self {
        Self {
            store,
            audit,
            retry: RetryConfig::default(),
        }
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

    fn observe<T>(result: Result<T, BillingError>) -> Result<T, BillingError> {
        if let Err(e) = &result {
            ERRORS_TOTAL.with_label_values(&[e.code()]).inc();
        }
        result
    }

    /// Create a pending invoice for a visit.
    #[instrument(skip(self, input), fields(patient_id = %input.patient_id))]
    pub async fn create_invoice(&self, input: CreateInvoice) -> Result<Invoice, BillingError> {
        let invoice = Self::observe(self.store.insert_invoice(&input).await)?;
        INVOICES_TOTAL.with_label_values(&["pending"]).inc();
        audit_best_effort(
            self.audit.as_ref(),
            AuditEvent {
                action: "invoice_created",
                invoice_id: invoice.invoice_id,
                actor: None,
                detail: serde_json::json!({
                    "patient_id": invoice.patient_id,
                    "visit_id": invoice.visit_id,
                }),
            },
        )
        .await;
        Ok(invoice)
    }

    /// Cancel an invoice. Cancelling an already-cancelled invoice is a
    /// no-op, checked before the version so retries cannot conflict.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, cancelled_by = cancelled_by))]
    pub async fn cancel_invoice(
        &self,
        invoice_id: Uuid,
        cancelled_by: &str,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        Self::observe(
            self.cancel_inner(invoice_id, cancelled_by, expected_version)
                .await,
        )
    }

    async fn cancel_inner(
        &self,
        invoice_id: Uuid,
        cancelled_by: &str,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load_invoice(invoice_id).await?;

        if invoice.status() == InvoiceStatus::Cancelled {
            info!(invoice_id = %invoice_id, "invoice already cancelled; no-op");
            return Ok(invoice);
        }

        if let Some(expected) = expected_version {
            if expected != invoice.version {
                return Err(BillingError::VersionMismatch {
                    invoice_id,
                    current_version: invoice.version,
                    expected_version: expected,
                });
            }
        }

        if invoice.status() == InvoiceStatus::Paid {
            return Err(BillingError::InvalidStatusTransition {
                invoice_id,
                from: InvoiceStatus::Paid,
                to: InvoiceStatus::Cancelled,
            });
        }

        let patch = InvoicePatch {
            status: Some(InvoiceStatus::Cancelled),
            ..Default::default()
        };
        let updated = self
            .store
            .update_invoice(invoice_id, expected_version.or(Some(invoice.version)), &patch)
            .await?;

        INVOICES_TOTAL.with_label_values(&["cancelled"]).inc();
        info!(invoice_id = %invoice_id, cancelled_by, "Invoice cancelled");
        audit_best_effort(
            self.audit.as_ref(),
            AuditEvent {
                action: "invoice_cancelled",
                invoice_id,
                actor: Some(cancelled_by.to_string()),
                detail: serde_json::json!({ "prior_status": invoice.status().as_str() }),
            },
        )
        .await;

        Ok(updated)
    }

    /// Put an invoice on hold, freezing payments and edits.
    #[instrument(skip(self, reason), fields(invoice_id = %invoice_id, held_by = held_by))]
    pub async fn place_on_hold(
        &self,
        invoice_id: Uuid,
        reason: &str,
        held_by: &str,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        Self::observe(
            self.hold_inner(invoice_id, reason, held_by, expected_version)
                .await,
        )
    }

    async fn hold_inner(
        &self,
        invoice_id: Uuid,
        reason: &str,
        held_by: &str,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load_invoice(invoice_id).await?;
        let status = invoice.status();

        if status == InvoiceStatus::OnHold {
            info!(invoice_id = %invoice_id, "invoice already on hold; no-op");
            return Ok(invoice);
        }

        if let Some(expected) = expected_version {
            if expected != invoice.version {
                return Err(BillingError::VersionMismatch {
                    invoice_id,
                    current_version: invoice.version,
                    expected_version: expected,
                });
            }
        }

        if !status.is_editable() {
            return Err(BillingError::InvalidStatusTransition {
                invoice_id,
                from: status,
                to: InvoiceStatus::OnHold,
            });
        }

        let patch = InvoicePatch {
            status: Some(InvoiceStatus::OnHold),
            hold: Some(HoldPatch {
                on_hold: true,
                reason: Some(reason.to_string()),
                date: Some(Utc::now()),
            }),
            ..Default::default()
        };
        let updated = self
            .store
            .update_invoice(invoice_id, expected_version.or(Some(invoice.version)), &patch)
            .await?;

        INVOICES_TOTAL.with_label_values(&["on_hold"]).inc();
        info!(invoice_id = %invoice_id, held_by, "Invoice placed on hold");
        audit_best_effort(
            self.audit.as_ref(),
            AuditEvent {
                action: "invoice_held",
                invoice_id,
                actor: Some(held_by.to_string()),
                detail: serde_json::json!({
                    "reason": reason,
                    "prior_status": status.as_str(),
                }),
            },
        )
        .await;

        Ok(updated)
    }

    /// Release a held invoice back into the payment flow. The resulting
    /// status is derived from payment state; a settled invoice still goes
    /// through the completion workflow to reach `paid`.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, released_by = released_by))]
    pub async fn release_hold(
        &self,
        invoice_id: Uuid,
        released_by: &str,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        Self::observe(
            self.release_inner(invoice_id, released_by, expected_version)
                .await,
        )
    }

    async fn release_inner(
        &self,
        invoice_id: Uuid,
        released_by: &str,
        expected_version: Option<i64>,
    ) -> Result<Invoice, BillingError> {
        let invoice = self.load_invoice(invoice_id).await?;

        if invoice.status() != InvoiceStatus::OnHold {
            info!(invoice_id = %invoice_id, "invoice not on hold; no-op");
            return Ok(invoice);
        }

        if let Some(expected) = expected_version {
            if expected != invoice.version {
                return Err(BillingError::VersionMismatch {
                    invoice_id,
                    current_version: invoice.version,
                    expected_version: expected,
                });
            }
        }

        let new_status = if invoice.paid_amount > Decimal::ZERO {
            InvoiceStatus::PartialPaid
        } else {
            InvoiceStatus::Pending
        };
        let patch = InvoicePatch {
            status: Some(new_status),
            hold: Some(HoldPatch {
                on_hold: false,
                reason: None,
                date: None,
            }),
            ..Default::default()
        };
        let updated = self
            .store
            .update_invoice(invoice_id, expected_version.or(Some(invoice.version)), &patch)
            .await?;

        info!(invoice_id = %invoice_id, released_by, status = new_status.as_str(), "Invoice hold released");
        audit_best_effort(
            self.audit.as_ref(),
            AuditEvent {
                action: "invoice_hold_released",
                invoice_id,
                actor: Some(released_by.to_string()),
                detail: serde_json::json!({ "status": new_status.as_str() }),
            },
        )
        .await;

        Ok(updated)
    }
}
