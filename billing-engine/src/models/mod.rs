//! Domain models for the billing engine.

mod invoice;
mod item;
mod payment;
mod visit;

pub use invoice::{
    CompletionPatch, CreateInvoice, HoldPatch, Invoice, InvoicePatch, InvoiceStatus,
};
pub use item::{CreateInvoiceItem, InvoiceItem, ItemType, UpdateInvoiceItem};
pub use payment::{PaymentTransaction, RecordPayment};
pub use visit::{VisitCompletion, VisitStatus};
