//! Billing workflows.
//!
//! Each workflow is a stateless orchestration value over the store and the
//! injected gateways; the only per-call state is a saga compensation stack
//! discarded when the invocation ends.

pub mod completion;
pub mod invoice;
pub mod items;
pub mod payment;

pub use completion::{CompletionOutcome, InvoiceCompletionWorkflow};
pub use invoice::InvoiceWorkflow;
pub use items::InvoiceItemWorkflow;
pub use payment::{PaymentOutcome, PaymentPolicy, PaymentWorkflow};

use crate::gateways::{notify_best_effort, Audience, NotificationGateway, VisitGateway};
use crate::models::{Invoice, VisitCompletion, VisitStatus};
use crate::services::metrics::VISIT_REPAIRS_TOTAL;
use tracing::{info, warn};

/// Best-effort push of an invoice's linked visit toward `completed`.
///
/// Used outside the completion saga: after a payment lands, on idempotent
/// completion re-entry, and on the self-healing read path. Returns true when
/// the visit is known completed afterwards. Failures never propagate — a
/// paid invoice with a stuck visit blocks the patient from a new visit, so
/// every miss leaves an operator-visible trace instead.
pub(crate) async fn drive_visit_completion(
    visits: &dyn VisitGateway,
    notifications: &dyn NotificationGateway,
    invoice: &Invoice,
    completed_by: Option<&str>,
    trigger: &'static str,
) -> bool {
    let Some(visit_id) = invoice.visit_id else {
        warn!(invoice_id = %invoice.invoice_id, "invoice has payments but no linked visit");
        notify_best_effort(
            notifications,
            Audience::Operators,
            &format!(
                "invoice {} has payments but no linked visit; manual linkage required",
                invoice.invoice_id
            ),
        )
        .await;
        return false;
    };

    match visits.status(visit_id).await {
        Ok(VisitStatus::Completed) => true,
        Ok(VisitStatus::Cancelled) => {
            warn!(
                invoice_id = %invoice.invoice_id,
                visit_id = %visit_id,
                "linked visit is cancelled; cannot complete"
            );
            notify_best_effort(
                notifications,
                Audience::Operators,
                &format!(
                    "invoice {} has payments but visit {} is cancelled",
                    invoice.invoice_id, visit_id
                ),
            )
            .await;
            false
        }
        Ok(VisitStatus::InProgress) => {
            let meta = VisitCompletion {
                completed_by: completed_by.map(str::to_string),
            };
            match visits.complete(visit_id, meta).await {
                Ok(()) => {
                    info!(
                        invoice_id = %invoice.invoice_id,
                        visit_id = %visit_id,
                        trigger,
                        "visit driven to completed"
                    );
                    VISIT_REPAIRS_TOTAL.with_label_values(&[trigger]).inc();
                    true
                }
                Err(e) => {
                    warn!(
                        invoice_id = %invoice.invoice_id,
                        visit_id = %visit_id,
                        error = %e,
                        "visit completion failed; invoice state is ahead of visit state"
                    );
                    notify_best_effort(
                        notifications,
                        Audience::Operators,
                        &format!(
                            "invoice {} is settled but visit {} could not be completed: {}",
                            invoice.invoice_id, visit_id, e
                        ),
                    )
                    .await;
                    false
                }
            }
        }
        Err(e) => {
            warn!(
                invoice_id = %invoice.invoice_id,
                visit_id = %visit_id,
                error = %e,
                "could not read visit status"
            );
            notify_best_effort(
                notifications,
                Audience::Operators,
                &format!(
                    "could not verify visit {} for settled invoice {}: {}",
                    visit_id, invoice.invoice_id, e
                ),
            )
            .await;
            false
        }
    }
}
