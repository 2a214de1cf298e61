//! Error contract of the billing engine.
//!
//! Every variant carries a stable `code()` string surfaced to callers.
//! Conflicts and policy violations are typed results, never string-tagged
//! exceptions; only transient storage failures are eligible for retry.

use crate::models::InvoiceStatus;
use billing_core::retry::Transient;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Storage-boundary failure, classified for the retry layer.
#[derive(Debug, Error)]
#[error("storage failure: {source}")]
pub struct StorageError {
    pub source: anyhow::Error,
    pub transient: bool,
}

impl StorageError {
    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self {
            source: source.into(),
            transient: true,
        }
    }

    pub fn permanent(source: impl Into<anyhow::Error>) -> Self {
        Self {
            source: source.into(),
            transient: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("invoice {0} not found")]
    InvoiceNotFound(Uuid),

    #[error(
        "version mismatch on invoice {invoice_id}: stored {current_version}, expected {expected_version}"
    )]
    VersionMismatch {
        invoice_id: Uuid,
        current_version: i64,
        expected_version: i64,
    },

    #[error("invoice {0} has no linked visit")]
    MissingVisit(Uuid),

    #[error("completing invoice {invoice_id} failed at '{step}': {reason}")]
    CompletionFailed {
        invoice_id: Uuid,
        step: &'static str,
        reason: String,
    },

    #[error("payment of {amount} exceeds outstanding balance {balance}")]
    PaymentExceedsBalance { amount: Decimal, balance: Decimal },

    #[error(
        "invoice already has {recorded} partial payments (limit {limit}); the next payment must clear the balance"
    )]
    PartialPaymentLimit { recorded: usize, limit: u32 },

    #[error("payment amount must be positive, got {0}")]
    InvalidPaymentAmount(Decimal),

    #[error("invalid item: {0}")]
    InvalidItem(String),

    #[error("item {item_id} not found on invoice {invoice_id}")]
    ItemNotFound { invoice_id: Uuid, item_id: Uuid },

    #[error("invoice {invoice_id} is {status} and cannot be edited")]
    NotEditable {
        invoice_id: Uuid,
        status: InvoiceStatus,
    },

    #[error("invoice {invoice_id} is {status} and cannot accept payments")]
    NotPayable {
        invoice_id: Uuid,
        status: InvoiceStatus,
    },

    #[error("invoice {invoice_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        invoice_id: Uuid,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    /// Compensations failed after a forward step failed: the system is in a
    /// known-inconsistent state and an operator must intervene.
    #[error(
        "rollback incomplete for invoice {invoice_id}: {failed_compensations} compensation(s) failed after '{step}' failed: {reason}"
    )]
    RollbackIncomplete {
        invoice_id: Uuid,
        step: &'static str,
        reason: String,
        failed_compensations: usize,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BillingError {
    /// Stable error code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::InvoiceNotFound(_) => "INVOICE_NOT_FOUND",
            BillingError::VersionMismatch { .. } => "VERSION_MISMATCH",
            BillingError::MissingVisit(_) => "INVOICE_MISSING_VISIT",
            BillingError::CompletionFailed { .. } => "INVOICE_COMPLETION_FAILED",
            BillingError::PaymentExceedsBalance { .. } => "PAYMENT_EXCEEDS_BALANCE",
            BillingError::PartialPaymentLimit { .. } => "PARTIAL_PAYMENT_LIMIT_EXCEEDED",
            BillingError::InvalidPaymentAmount(_) => "INVALID_PAYMENT_AMOUNT",
            BillingError::InvalidItem(_) => "INVALID_ITEM",
            BillingError::ItemNotFound { .. } => "ITEM_NOT_FOUND",
            BillingError::NotEditable { .. } => "INVOICE_NOT_EDITABLE",
            BillingError::NotPayable { .. } => "INVOICE_NOT_PAYABLE",
            BillingError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            BillingError::RollbackIncomplete { .. } => "ROLLBACK_INCOMPLETE",
            BillingError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl Transient for BillingError {
    fn is_transient(&self) -> bool {
        matches!(self, BillingError::Storage(e) if e.transient)
    }
}
