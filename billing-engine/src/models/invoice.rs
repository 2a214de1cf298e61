//! Invoice model for the billing engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Pending,
    PartialPaid,
    Paid,
    Cancelled,
    OnHold,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::PartialPaid => "partial_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::OnHold => "on_hold",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "draft" => InvoiceStatus::Draft,
            "partial_paid" => InvoiceStatus::PartialPaid,
            "paid" => InvoiceStatus::Paid,
            "cancelled" => InvoiceStatus::Cancelled,
            "on_hold" => InvoiceStatus::OnHold,
            _ => InvoiceStatus::Pending,
        }
    }

    /// Items may be added, changed, or removed only in these statuses.
    pub fn is_editable(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Draft | InvoiceStatus::Pending | InvoiceStatus::PartialPaid
        )
    }

    /// Terminal success state: retried operations against a paid invoice
    /// short-circuit to a no-op instead of raising a conflict.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice record.
///
/// `version` increments by exactly 1 on every committed mutation and is the
/// optimistic-concurrency token for all multi-actor writes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub status: String,
    pub version: i64,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub balance: Decimal,
    pub on_hold: bool,
    pub hold_reason: Option<String>,
    pub hold_date: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }
}

/// Input for creating an invoice when a visit requires billing.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub discount_amount: Decimal,
    pub discount_percentage: Decimal,
    pub tax_amount: Decimal,
}

impl CreateInvoice {
    pub fn for_visit(patient_id: Uuid, visit_id: Uuid) -> Self {
        Self {
            patient_id,
            visit_id: Some(visit_id),
            discount_amount: Decimal::ZERO,
            discount_percentage: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
        }
    }
}

/// Hold metadata written as one unit: either all three fields are
/// overwritten or none are.
#[derive(Debug, Clone)]
pub struct HoldPatch {
    pub on_hold: bool,
    pub reason: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

/// Completion metadata written as one unit.
#[derive(Debug, Clone)]
pub struct CompletionPatch {
    pub completed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Conditional update for an invoice. `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct InvoicePatch {
    pub status: Option<InvoiceStatus>,
    pub subtotal: Option<Decimal>,
    pub discount_amount: Option<Decimal>,
    pub discount_percentage: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub paid_amount: Option<Decimal>,
    pub balance: Option<Decimal>,
    pub hold: Option<HoldPatch>,
    pub completion: Option<CompletionPatch>,
}

impl InvoicePatch {
    /// Apply the patch in memory, mirroring the storage-layer conditional
    /// update. Alternate store implementations use this so their semantics
    /// cannot drift from the SQL path.
    pub fn apply(&self, invoice: &mut Invoice) {
        if let Some(status) = self.status {
            invoice.status = status.as_str().to_string();
        }
        if let Some(subtotal) = self.subtotal {
            invoice.subtotal = subtotal;
        }
        if let Some(discount_amount) = self.discount_amount {
            invoice.discount_amount = discount_amount;
        }
        if let Some(discount_percentage) = self.discount_percentage {
            invoice.discount_percentage = discount_percentage;
        }
        if let Some(tax_amount) = self.tax_amount {
            invoice.tax_amount = tax_amount;
        }
        if let Some(total_amount) = self.total_amount {
            invoice.total_amount = total_amount;
        }
        if let Some(paid_amount) = self.paid_amount {
            invoice.paid_amount = paid_amount;
        }
        if let Some(balance) = self.balance {
            invoice.balance = balance;
        }
        if let Some(hold) = &self.hold {
            invoice.on_hold = hold.on_hold;
            invoice.hold_reason = hold.reason.clone();
            invoice.hold_date = hold.date;
        }
        if let Some(completion) = &self.completion {
            invoice.completed_by = completion.completed_by.clone();
            invoice.completed_at = completion.completed_at;
        }
        invoice.version += 1;
        invoice.updated_utc = Utc::now();
    }
}
