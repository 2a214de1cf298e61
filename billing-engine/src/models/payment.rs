//! Payment transaction model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A committed payment against an invoice. Immutable once created; the only
/// removal path is saga compensation of a payment whose invoice update never
/// committed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentTransaction {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub payment_method: String,
    pub reference: Option<String>,
    pub received_by: String,
    pub processed_by: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl PaymentTransaction {
    /// A partial installment is any payment below the invoice total.
    pub fn is_partial(&self, invoice_total: Decimal) -> bool {
        self.amount < invoice_total
    }
}

/// Input for recording a payment.
#[derive(Debug, Clone)]
pub struct RecordPayment {
    pub amount: Decimal,
    pub payment_method: String,
    pub reference: Option<String>,
    pub received_by: String,
    pub processed_by: Option<String>,
}
