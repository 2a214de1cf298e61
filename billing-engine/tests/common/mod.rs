//! Test helper module for billing-engine integration tests.
//!
//! Provides an in-memory store with the same compare-and-swap semantics as
//! the Postgres implementation, recording gateway stubs, and seed helpers,
//! so workflow properties run hermetically.

#![allow(dead_code)]

use async_trait::async_trait;
use billing_engine::error::{BillingError, StorageError};
use billing_engine::gateways::{
    Audience, AuditEvent, AuditGateway, GatewayError, NotificationGateway, VisitGateway,
};
use billing_engine::models::{
    CreateInvoice, CreateInvoiceItem, Invoice, InvoiceItem, InvoicePatch, ItemType,
    PaymentTransaction, RecordPayment, UpdateInvoiceItem, VisitCompletion, VisitStatus,
};
use billing_engine::services::store::BillingStore;
use billing_engine::services::totals;
use billing_engine::workflows::{
    InvoiceCompletionWorkflow, InvoiceItemWorkflow, InvoiceWorkflow, PaymentWorkflow,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub fn money(s: &str) -> Decimal {
    Decimal::from_str(s).expect("valid decimal literal")
}

pub fn cash_payment(amount: &str) -> RecordPayment {
    RecordPayment {
        amount: money(amount),
        payment_method: "cash".to_string(),
        reference: None,
        received_by: "cashier".to_string(),
        processed_by: None,
    }
}

/// The two arithmetic invariants every observed invoice state must satisfy.
pub fn assert_invariants(invoice: &Invoice) {
    assert_eq!(
        invoice.total_amount,
        invoice.subtotal - invoice.discount_amount + invoice.tax_amount,
        "total_amount invariant violated"
    );
    assert_eq!(
        invoice.balance,
        invoice.total_amount - invoice.paid_amount,
        "balance invariant violated"
    );
}

/// In-memory store with the same conditional-update semantics as the
/// Postgres implementation, plus failure injection for rollback tests.
#[derive(Default)]
pub struct MemoryStore {
    invoices: Mutex<HashMap<Uuid, Invoice>>,
    items: Mutex<HashMap<Uuid, InvoiceItem>>,
    payments: Mutex<HashMap<Uuid, PaymentTransaction>>,
    invoice_update_calls: AtomicUsize,
    fail_invoice_updates_from: AtomicUsize,
}

impl MemoryStore {
    /// Make the Nth and later invoice updates fail with a transient storage
    /// error (1-based call numbering).
    pub fn fail_invoice_updates_from(&self, call: usize) {
        self.fail_invoice_updates_from.store(call, Ordering::SeqCst);
    }

    pub fn payment_count(&self, invoice_id: Uuid) -> usize {
        self.payments
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .count()
    }

    /// Direct read bypassing all workflow logic.
    pub fn raw_invoice(&self, invoice_id: Uuid) -> Invoice {
        self.invoices
            .lock()
            .unwrap()
            .get(&invoice_id)
            .cloned()
            .expect("invoice seeded")
    }

    /// Direct write bypassing all workflow logic; for constructing broken
    /// states the engine is supposed to repair.
    pub fn put_invoice(&self, invoice: Invoice) {
        self.invoices
            .lock()
            .unwrap()
            .insert(invoice.invoice_id, invoice);
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn insert_invoice(&self, input: &CreateInvoice) -> Result<Invoice, BillingError> {
        let initial = totals::calculate(
            &[],
            &[],
            input.discount_amount,
            input.discount_percentage,
            input.tax_amount,
        );
        let now = Utc::now();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            patient_id: input.patient_id,
            visit_id: input.visit_id,
            status: "pending".to_string(),
            version: 1,
            subtotal: initial.subtotal,
            discount_amount: initial.discount_amount,
            discount_percentage: initial.discount_percentage,
            tax_amount: initial.tax_amount,
            total_amount: initial.total_amount,
            paid_amount: initial.paid_amount,
            balance: initial.balance,
            on_hold: false,
            hold_reason: None,
            hold_date: None,
            completed_by: None,
            completed_at: None,
            created_utc: now,
            updated_utc: now,
        };
        self.invoices
            .lock()
            .unwrap()
            .insert(invoice.invoice_id, invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError> {
        Ok(self.invoices.lock().unwrap().get(&invoice_id).cloned())
    }

    async fn update_invoice(
        &self,
        invoice_id: Uuid,
        expected_version: Option<i64>,
        patch: &InvoicePatch,
    ) -> Result<Invoice, BillingError> {
        let call = self.invoice_update_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_from = self.fail_invoice_updates_from.load(Ordering::SeqCst);
        if fail_from != 0 && call >= fail_from {
            return Err(BillingError::Storage(StorageError::transient(
                anyhow::anyhow!("injected update failure"),
            )));
        }

        let mut invoices = self.invoices.lock().unwrap();
        let invoice = invoices
            .get_mut(&invoice_id)
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;

        if let Some(expected) = expected_version {
            if invoice.version != expected {
                return Err(BillingError::VersionMismatch {
                    invoice_id,
                    current_version: invoice.version,
                    expected_version: expected,
                });
            }
        }

        patch.apply(invoice);
        Ok(invoice.clone())
    }

    async fn insert_item(&self, input: &CreateInvoiceItem) -> Result<InvoiceItem, BillingError> {
        let item = InvoiceItem {
            item_id: Uuid::new_v4(),
            invoice_id: input.invoice_id,
            item_type: input.item_type.as_str().to_string(),
            description: input.description.clone(),
            quantity: input.quantity,
            unit_price: input.unit_price,
            total_price: totals::line_total(input.quantity, input.unit_price),
            created_utc: Utc::now(),
        };
        self.items
            .lock()
            .unwrap()
            .insert(item.item_id, item.clone());
        Ok(item)
    }

    async fn update_item(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
        input: &UpdateInvoiceItem,
    ) -> Result<Option<InvoiceItem>, BillingError> {
        let mut items = self.items.lock().unwrap();
        let Some(item) = items
            .get_mut(&item_id)
            .filter(|it| it.invoice_id == invoice_id)
        else {
            return Ok(None);
        };
        if let Some(description) = &input.description {
            item.description = description.clone();
        }
        if let Some(quantity) = input.quantity {
            item.quantity = quantity;
        }
        if let Some(unit_price) = input.unit_price {
            item.unit_price = unit_price;
        }
        item.total_price = totals::line_total(item.quantity, item.unit_price);
        Ok(Some(item.clone()))
    }

    async fn delete_item(&self, invoice_id: Uuid, item_id: Uuid) -> Result<bool, BillingError> {
        let mut items = self.items.lock().unwrap();
        let matches = items
            .get(&item_id)
            .is_some_and(|it| it.invoice_id == invoice_id);
        if matches {
            items.remove(&item_id);
        }
        Ok(matches)
    }

    async fn restore_item(&self, item: &InvoiceItem) -> Result<(), BillingError> {
        self.items
            .lock()
            .unwrap()
            .insert(item.item_id, item.clone());
        Ok(())
    }

    async fn list_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, BillingError> {
        let mut items: Vec<_> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|it| it.invoice_id == invoice_id)
            .cloned()
            .collect();
        items.sort_by_key(|it| (it.created_utc, it.item_id));
        Ok(items)
    }

    async fn insert_payment(
        &self,
        invoice_id: Uuid,
        input: &RecordPayment,
    ) -> Result<PaymentTransaction, BillingError> {
        let payment = PaymentTransaction {
            payment_id: Uuid::new_v4(),
            invoice_id,
            amount: input.amount,
            payment_method: input.payment_method.clone(),
            reference: input.reference.clone(),
            received_by: input.received_by.clone(),
            processed_by: input.processed_by.clone(),
            created_utc: Utc::now(),
        };
        self.payments
            .lock()
            .unwrap()
            .insert(payment.payment_id, payment.clone());
        Ok(payment)
    }

    async fn delete_payment(&self, payment_id: Uuid) -> Result<bool, BillingError> {
        Ok(self.payments.lock().unwrap().remove(&payment_id).is_some())
    }

    async fn list_payments(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<PaymentTransaction>, BillingError> {
        let mut payments: Vec<_> = self
            .payments
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.created_utc, p.payment_id));
        Ok(payments)
    }
}

/// Visit gateway stub with settable statuses and failure injection.
#[derive(Default)]
pub struct StubVisitGateway {
    statuses: Mutex<HashMap<Uuid, VisitStatus>>,
    completions: Mutex<Vec<Uuid>>,
    fail_completions: Mutex<bool>,
}

impl StubVisitGateway {
    pub fn set_status(&self, visit_id: Uuid, status: VisitStatus) {
        self.statuses.lock().unwrap().insert(visit_id, status);
    }

    pub fn fail_completions(&self, fail: bool) {
        *self.fail_completions.lock().unwrap() = fail;
    }

    pub fn status_of(&self, visit_id: Uuid) -> VisitStatus {
        self.statuses
            .lock()
            .unwrap()
            .get(&visit_id)
            .copied()
            .unwrap_or(VisitStatus::InProgress)
    }

    /// Every successful completion call, in order.
    pub fn completions(&self) -> Vec<Uuid> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisitGateway for StubVisitGateway {
    async fn status(&self, visit_id: Uuid) -> Result<VisitStatus, GatewayError> {
        Ok(self.status_of(visit_id))
    }

    async fn complete(&self, visit_id: Uuid, _meta: VisitCompletion) -> Result<(), GatewayError> {
        if *self.fail_completions.lock().unwrap() {
            return Err(GatewayError::Unavailable("visit service down".to_string()));
        }
        self.statuses
            .lock()
            .unwrap()
            .insert(visit_id, VisitStatus::Completed);
        self.completions.lock().unwrap().push(visit_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotificationGateway {
    messages: Mutex<Vec<(Audience, String)>>,
}

impl RecordingNotificationGateway {
    pub fn operator_messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(audience, _)| *audience == Audience::Operators)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationGateway for RecordingNotificationGateway {
    async fn notify(&self, audience: Audience, message: &str) -> Result<(), GatewayError> {
        self.messages
            .lock()
            .unwrap()
            .push((audience, message.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAuditGateway {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditGateway {
    pub fn actions(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.action).collect()
    }
}

#[async_trait]
impl AuditGateway for RecordingAuditGateway {
    async fn record(&self, event: AuditEvent) -> Result<(), GatewayError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Fully wired engine over the in-memory store and recording stubs.
pub struct TestEngine {
    pub store: Arc<MemoryStore>,
    pub visits: Arc<StubVisitGateway>,
    pub notifications: Arc<RecordingNotificationGateway>,
    pub audit: Arc<RecordingAuditGateway>,
    pub invoices: InvoiceWorkflow,
    pub items: InvoiceItemWorkflow,
    pub payments: PaymentWorkflow,
    pub completion: InvoiceCompletionWorkflow,
}

impl TestEngine {
    pub fn new() -> Self {
        billing_engine::services::init_metrics();

        let store = Arc::new(MemoryStore::default());
        let visits = Arc::new(StubVisitGateway::default());
        let notifications = Arc::new(RecordingNotificationGateway::default());
        let audit = Arc::new(RecordingAuditGateway::default());

        let dyn_store: Arc<dyn BillingStore> = store.clone();
        let dyn_visits: Arc<dyn VisitGateway> = visits.clone();
        let dyn_notifications: Arc<dyn NotificationGateway> = notifications.clone();
        let dyn_audit: Arc<dyn AuditGateway> = audit.clone();

        let invoices = InvoiceWorkflow::new(dyn_store.clone(), dyn_audit.clone());
        let items = InvoiceItemWorkflow::new(dyn_store.clone(), dyn_notifications.clone());
        let payments = PaymentWorkflow::new(
            dyn_store.clone(),
            dyn_visits.clone(),
            dyn_notifications.clone(),
            dyn_audit.clone(),
        );
        let completion =
            InvoiceCompletionWorkflow::new(dyn_store, dyn_visits, dyn_notifications, dyn_audit);

        Self {
            store,
            visits,
            notifications,
            audit,
            invoices,
            items,
            payments,
            completion,
        }
    }

    /// Create a pending invoice with one service item totalling `total`,
    /// linked to a fresh in-progress visit.
    pub async fn seed_invoice(&self, total: &str) -> Invoice {
        let patient_id = Uuid::new_v4();
        let visit_id = Uuid::new_v4();
        self.visits.set_status(visit_id, VisitStatus::InProgress);

        let invoice = self
            .invoices
            .create_invoice(CreateInvoice::for_visit(patient_id, visit_id))
            .await
            .expect("create invoice");

        let (invoice, _) = self
            .items
            .add_item(
                CreateInvoiceItem {
                    invoice_id: invoice.invoice_id,
                    item_type: ItemType::Service,
                    description: "Consultation".to_string(),
                    quantity: Decimal::ONE,
                    unit_price: money(total),
                },
                Some(invoice.version),
            )
            .await
            .expect("add seed item");

        invoice
    }
}
