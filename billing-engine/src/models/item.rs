//! Invoice item model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of billable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Service,
    Medicine,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Service => "service",
            ItemType::Medicine => "medicine",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "medicine" => ItemType::Medicine,
            _ => ItemType::Service,
        }
    }
}

/// Line item on an invoice. `total_price` is always derived as
/// `quantity * unit_price`, never supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub item_id: Uuid,
    pub invoice_id: Uuid,
    pub item_type: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub created_utc: DateTime<Utc>,
}

impl InvoiceItem {
    pub fn item_type(&self) -> ItemType {
        ItemType::from_string(&self.item_type)
    }
}

/// Input for adding an item to an invoice.
#[derive(Debug, Clone)]
pub struct CreateInvoiceItem {
    pub invoice_id: Uuid,
    pub item_type: ItemType,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

/// Input for updating an item.
#[derive(Debug, Clone, Default)]
pub struct UpdateInvoiceItem {
    pub description: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
}

impl UpdateInvoiceItem {
    /// A full-field update that restores an item to a previous state; used
    /// by saga compensations.
    pub fn restoring(item: &InvoiceItem) -> Self {
        Self {
            description: Some(item.description.clone()),
            quantity: Some(item.quantity),
            unit_price: Some(item.unit_price),
        }
    }
}
