//! Storage contract for the billing engine.
//!
//! One trait, one entity family: invoices plus their dependent item and
//! payment rows. Conflict detection is compare-and-swap on the invoice
//! `version` at the moment of the underlying write; there is no read-then-
//! write window and no locking anywhere else.

use crate::error::BillingError;
use crate::models::{
    CreateInvoice, CreateInvoiceItem, Invoice, InvoiceItem, InvoicePatch, PaymentTransaction,
    RecordPayment, UpdateInvoiceItem,
};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Create an invoice in `pending` status at version 1 with totals
    /// recomputed from its (empty) item list.
    async fn insert_invoice(&self, input: &CreateInvoice) -> Result<Invoice, BillingError>;

    /// Fetch an invoice; the returned record carries its current version.
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError>;

    /// Conditionally update an invoice.
    ///
    /// With `expected_version = Some(v)` the write commits only if the
    /// stored version still equals `v` at write time and fails with
    /// [`BillingError::VersionMismatch`] otherwise. `None` skips the check
    /// and is reserved for non-conflicting internal bookkeeping (saga
    /// compensations); every multi-actor business mutation supplies a
    /// concrete version. A committed update increments `version` by
    /// exactly 1.
    async fn update_invoice(
        &self,
        invoice_id: Uuid,
        expected_version: Option<i64>,
        patch: &InvoicePatch,
    ) -> Result<Invoice, BillingError>;

    async fn insert_item(&self, input: &CreateInvoiceItem) -> Result<InvoiceItem, BillingError>;

    async fn update_item(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
        input: &UpdateInvoiceItem,
    ) -> Result<Option<InvoiceItem>, BillingError>;

    async fn delete_item(&self, invoice_id: Uuid, item_id: Uuid) -> Result<bool, BillingError>;

    /// Re-insert a previously deleted item with its original identity; used
    /// only by saga compensations.
    async fn restore_item(&self, item: &InvoiceItem) -> Result<(), BillingError>;

    async fn list_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, BillingError>;

    async fn insert_payment(
        &self,
        invoice_id: Uuid,
        input: &RecordPayment,
    ) -> Result<PaymentTransaction, BillingError>;

    /// Remove a payment row; used only by saga compensations for payments
    /// whose invoice update never committed.
    async fn delete_payment(&self, payment_id: Uuid) -> Result<bool, BillingError>;

    async fn list_payments(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<PaymentTransaction>, BillingError>;
}
