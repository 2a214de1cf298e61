//! Invoice completion workflow integration tests.

mod common;

use billing_engine::error::BillingError;
use billing_engine::models::{CreateInvoice, InvoiceStatus, VisitStatus};
use billing_engine::workflows::CompletionOutcome;
use common::{assert_invariants, cash_payment, TestEngine};
use rust_decimal::Decimal;
use uuid::Uuid;

#[tokio::test]
async fn completing_a_pending_invoice_pays_it_and_closes_the_visit() {
    let engine = TestEngine::new();
    let invoice = engine.seed_invoice("100.00").await;
    let visit_id = invoice.visit_id.unwrap();

    let outcome = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", Some(invoice.version))
        .await
        .expect("complete");
    let completed = match outcome {
        CompletionOutcome::Completed { invoice } => invoice,
        other => panic!("expected completion, got {other:?}"),
    };

    assert_eq!(completed.status(), InvoiceStatus::Paid);
    assert_eq!(completed.completed_by.as_deref(), Some("dr-ahuja"));
    assert!(completed.completed_at.is_some());
    assert_eq!(completed.version, invoice.version + 1);
    assert_eq!(engine.visits.status_of(visit_id), VisitStatus::Completed);
    assert_invariants(&completed);
}

#[tokio::test]
async fn completion_is_idempotent_with_at_most_one_visit_side_effect() {
    let engine = TestEngine::new();
    let invoice = engine.seed_invoice("100.00").await;

    let first = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", Some(invoice.version))
        .await
        .expect("first call");
    assert!(matches!(first, CompletionOutcome::Completed { .. }));

    // Same arguments again: same observable result, no second side effect.
    let second = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", Some(invoice.version))
        .await
        .expect("second call");
    match second {
        CompletionOutcome::AlreadyCompleted { invoice } => {
            assert_eq!(invoice.status(), InvoiceStatus::Paid);
        }
        other => panic!("expected idempotent no-op, got {other:?}"),
    }
    assert_eq!(engine.visits.completions().len(), 1);
}

#[tokio::test]
async fn visit_failure_rolls_the_invoice_back() {
    let engine = TestEngine::new();
    let invoice = engine.seed_invoice("100.00").await;
    let visit_id = invoice.visit_id.unwrap();
    engine.visits.fail_completions(true);

    let err = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", Some(invoice.version))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVOICE_COMPLETION_FAILED");

    // The invoice reverted and no visit mutation persisted.
    let stored = engine.store.raw_invoice(invoice.invoice_id);
    assert_eq!(stored.status(), InvoiceStatus::Pending);
    assert!(stored.completed_by.is_none());
    assert!(stored.completed_at.is_none());
    assert_eq!(engine.visits.status_of(visit_id), VisitStatus::InProgress);
    assert!(engine.visits.completions().is_empty());
}

#[tokio::test]
async fn failed_compensation_escalates_as_rollback_incomplete() {
    let engine = TestEngine::new();
    let invoice = engine.seed_invoice("100.00").await;
    engine.visits.fail_completions(true);
    // Seeding used one invoice update; let the "mark paid" write (call 2)
    // succeed and fail the revert (call 3).
    engine.store.fail_invoice_updates_from(3);

    let err = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", Some(invoice.version))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ROLLBACK_INCOMPLETE");

    // The invoice is stuck paid with an unfinished visit: known-inconsistent,
    // and an operator was paged.
    let stored = engine.store.raw_invoice(invoice.invoice_id);
    assert_eq!(stored.status(), InvoiceStatus::Paid);
    let messages = engine.notifications.operator_messages();
    assert!(
        messages.iter().any(|m| m.contains("ROLLBACK INCOMPLETE")),
        "expected operator escalation, got {messages:?}"
    );
}

#[tokio::test]
async fn invoice_without_visit_cannot_be_completed() {
    let engine = TestEngine::new();
    let invoice = engine
        .invoices
        .create_invoice(CreateInvoice {
            patient_id: Uuid::new_v4(),
            visit_id: None,
            discount_amount: Decimal::ZERO,
            discount_percentage: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
        })
        .await
        .expect("create");

    let err = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", Some(invoice.version))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVOICE_MISSING_VISIT");
}

#[tokio::test]
async fn stale_version_on_unpaid_invoice_is_a_conflict() {
    let engine = TestEngine::new();
    let invoice = engine.seed_invoice("100.00").await;

    let err = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", Some(invoice.version + 7))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::VersionMismatch { .. }));
}

#[tokio::test]
async fn cancelled_invoice_cannot_be_completed() {
    let engine = TestEngine::new();
    let invoice = engine.seed_invoice("100.00").await;
    let cancelled = engine
        .invoices
        .cancel_invoice(invoice.invoice_id, "admin", Some(invoice.version))
        .await
        .expect("cancel");

    let err = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", Some(cancelled.version))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS_TRANSITION");
}

#[tokio::test]
async fn idempotent_reentry_repairs_a_stuck_visit() {
    let engine = TestEngine::new();
    let invoice = engine.seed_invoice("100.00").await;
    let visit_id = invoice.visit_id.unwrap();

    // Simulate a crash between the saga's two steps: the invoice is paid
    // but the visit never completed.
    let mut broken = engine.store.raw_invoice(invoice.invoice_id);
    broken.status = InvoiceStatus::Paid.as_str().to_string();
    broken.completed_by = Some("dr-ahuja".to_string());
    engine.store.put_invoice(broken);
    assert_eq!(engine.visits.status_of(visit_id), VisitStatus::InProgress);

    let outcome = engine
        .completion
        .complete_invoice(invoice.invoice_id, "dr-ahuja", None)
        .await
        .expect("re-entry");
    assert!(matches!(outcome, CompletionOutcome::AlreadyCompleted { .. }));
    assert_eq!(engine.visits.status_of(visit_id), VisitStatus::Completed);
}

#[tokio::test]
async fn completion_after_partial_payment_keeps_totals() {
    let engine = TestEngine::new();
    let invoice = engine.seed_invoice("100.00").await;

    let outcome = engine
        .payments
        .record_partial_payment(invoice.invoice_id, cash_payment("60.00"), Some(invoice.version))
        .await
        .expect("partial payment");
    let invoice = match outcome {
        billing_engine::workflows::PaymentOutcome::Recorded { invoice, .. } => invoice,
        other => panic!("expected recorded payment, got {other:?}"),
    };

    // Cashier closes out the remainder manually.
    let outcome = engine
        .completion
        .complete_invoice(invoice.invoice_id, "cashier-1", Some(invoice.version))
        .await
        .expect("complete");
    let completed = match outcome {
        CompletionOutcome::Completed { invoice } => invoice,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(completed.status(), InvoiceStatus::Paid);
    // Completion changes status, not money: the partial payment history
    // stays intact.
    assert_eq!(completed.paid_amount, common::money("60.00"));
    assert_invariants(&completed);
}
