//! Invoice completion workflow.
//!
//! Marks an invoice paid and completes its visit as one logical operation,
//! approximated by a two-step saga: the invoice flips first, the visit
//! second, and a visit failure rolls the invoice back. A crash between the
//! two steps leaves a paid invoice with an unfinished visit; that window is
//! accepted and closed by the idempotent self-healing re-entry below rather
//! than prevented.

use crate::error::BillingError;
use crate::gateways::{
    audit_best_effort, notify_best_effort, Audience, AuditEvent, AuditGateway,
    NotificationGateway, VisitGateway,
};
use crate::models::{CompletionPatch, Invoice, InvoicePatch, InvoiceStatus, VisitCompletion, VisitStatus};
use crate::services::metrics::{ERRORS_TOTAL, INVOICES_TOTAL, SAGA_ROLLBACKS_TOTAL};
use crate::services::saga::{Compensation, Saga, SagaFailure};
use crate::services::store::BillingStore;
use crate::workflows::drive_visit_completion;
use billing_core::retry::{retry_transient, RetryConfig};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Result of a completion request.
#[derive(Debug)]
pub enum CompletionOutcome {
    Completed { invoice: Invoice },
    /// The invoice was already paid; the call is a safe no-op (with the
    /// visit repaired if it had been left behind).
    AlreadyCompleted { invoice: Invoice },
}

pub struct InvoiceCompletionWorkflow {
    store: Arc<dyn BillingStore>,
    visits: Arc<dyn VisitGateway>,
    notifications: Arc<dyn NotificationGateway>,
    audit: Arc<dyn AuditGateway>,
    retry: RetryConfig,
}

impl InvoiceCompletionWorkflow {
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

    /// Drive a paid invoice's visit to `completed` if it was left behind.
    /// Returns true when the visit is known completed afterwards.
    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    pub async fn repair_visit_status(&self, invoice: &Invoice) -> bool {
        if invoice.status() != InvoiceStatus::Paid {
            return false;
        }
        drive_visit_completion(
            self.visits.as_ref(),
            self.notifications.as_ref(),
            invoice,
            invoice.completed_by.as_deref(),
            "idempotent_reentry",
        )
        .await
    }

    /// Mark an invoice paid and complete its visit.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, completed_by = completed_by))]
    pub async fn complete_invoice(
        &self,
        invoice_id: Uuid,
        completed_by: &str,
        expected_version: Option<i64>,
    ) -> Result<CompletionOutcome, BillingError> {
        let result = self
            .complete_inner(invoice_id, completed_by, expected_version)
            .await;
        if let Err(e) = &result {
            ERRORS_TOTAL.with_label_values(&[e.code()]).inc();
        }
        result
    }

    async fn complete_inner(
        &self,
        invoice_id: Uuid,
        completed_by: &str,
        expected_version: Option<i64>,
    ) -> Result<CompletionOutcome, BillingError> {
        let invoice = self.load_invoice(invoice_id).await?;

        // Idempotent re-entry comes before any conflict handling.
        if invoice.status() == InvoiceStatus::Paid {
            info!(invoice_id = %invoice_id, "invoice already paid; completion is a no-op");
            self.repair_visit_status(&invoice).await;
            return Ok(CompletionOutcome::AlreadyCompleted { invoice });
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

        // An unlinked invoice is a data-integrity defect, not a retryable
        // condition.
        let Some(visit_id) = invoice.visit_id else {
            return Err(BillingError::MissingVisit(invoice_id));
        };

        let prior_status = invoice.status();
        if !prior_status.is_editable() {
            return Err(BillingError::InvalidStatusTransition {
                invoice_id,
                from: prior_status,
                to: InvoiceStatus::Paid,
            });
        }

        let mut saga: Saga<'static, BillingError> = Saga::new();

        // Step 1: flip the invoice. The undo reverts the status with the
        // version check skipped — compensation is internal bookkeeping, not
        // a multi-actor mutation.
        let paid_patch = InvoicePatch {
            status: Some(InvoiceStatus::Paid),
            completion: Some(CompletionPatch {
                completed_by: Some(completed_by.to_string()),
                completed_at: Some(Utc::now()),
            }),
            ..Default::default()
        };
        let cas_version = expected_version.or(Some(invoice.version));
        let store = Arc::clone(&self.store);
        let marked = match saga
            .run_compensable(
                "mark invoice paid",
                self.store
                    .update_invoice(invoice_id, cas_version, &paid_patch),
                move |_| {
                    let revert = InvoicePatch {
                        status: Some(prior_status),
                        completion: Some(CompletionPatch {
                            completed_by: None,
                            completed_at: None,
                        }),
                        ..Default::default()
                    };
                    let compensation: Compensation<'static, BillingError> = Box::new(move || {
                        Box::pin(async move {
                            store.update_invoice(invoice_id, None, &revert).await.map(|_| ())
                        })
                    });
                    compensation
                },
            )
            .await
        {
            Ok(inv) => inv,
            Err(failure) => return self.resolve_saga_failure(invoice_id, failure).await,
        };

        // Step 2: complete the visit. An already-completed visit is fine;
        // anything else must succeed or step 1 is rolled back.
        let visits = Arc::clone(&self.visits);
        let meta = VisitCompletion {
            completed_by: Some(completed_by.to_string()),
        };
        let visit_step = async move {
            match visits.status(visit_id).await {
                Ok(VisitStatus::Completed) => Ok(()),
                Ok(_) => visits.complete(visit_id, meta).await,
                Err(e) => Err(e),
            }
            .map_err(|e| BillingError::CompletionFailed {
                invoice_id,
                step: "complete visit",
                reason: e.to_string(),
            })
        };
        if let Err(failure) = saga.run("complete visit", visit_step).await {
            return self.resolve_saga_failure(invoice_id, failure).await;
        }
        saga.commit();

        INVOICES_TOTAL.with_label_values(&["paid"]).inc();
        info!(
            invoice_id = %invoice_id,
            visit_id = %visit_id,
            completed_by,
            "Invoice completed and visit closed"
        );

        audit_best_effort(
            self.audit.as_ref(),
            AuditEvent {
                action: "invoice_completed",
                invoice_id,
                actor: Some(completed_by.to_string()),
                detail: serde_json::json!({
                    "visit_id": visit_id,
                    "prior_status": prior_status.as_str(),
                }),
            },
        )
        .await;
        notify_best_effort(
            self.notifications.as_ref(),
            Audience::BillingStaff,
            &format!("invoice {invoice_id} marked paid by {completed_by}"),
        )
        .await;

        Ok(CompletionOutcome::Completed { invoice: marked })
    }

    async fn resolve_saga_failure(
        &self,
        invoice_id: Uuid,
        failure: SagaFailure<BillingError>,
    ) -> Result<CompletionOutcome, BillingError> {
        match failure {
            SagaFailure::RolledBack { step, source } => {
                SAGA_ROLLBACKS_TOTAL
                    .with_label_values(&["completion", "clean"])
                    .inc();
                if matches!(source, BillingError::VersionMismatch { .. }) {
                    // Terminal-state check again: the conflicting writer may
                    // have completed this invoice already.
                    if let Some(current) = self.store.get_invoice(invoice_id).await? {
                        if current.status() == InvoiceStatus::Paid {
                            info!(
                                invoice_id = %invoice_id,
                                step,
                                "conflicting writer already completed the invoice; no-op"
                            );
                            self.repair_visit_status(&current).await;
                            return Ok(CompletionOutcome::AlreadyCompleted { invoice: current });
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
                    .with_label_values(&["completion", "incomplete"])
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
