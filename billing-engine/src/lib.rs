//! billing-engine: the billing consistency engine for the clinic platform.
//!
//! Keeps an invoice, its items, its payment transactions, and the linked
//! clinical visit mutually consistent without cross-table transactions:
//! optimistic versioning at the storage boundary, compensating transactions
//! across invoice/visit mutations, and idempotent re-entry so retried or
//! re-delivered requests never double-charge.
pub mod error;
pub mod gateways;
pub mod models;
pub mod services;
pub mod workflows;
