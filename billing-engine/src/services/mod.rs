//! Services module for the billing engine.

pub mod database;
pub mod metrics;
pub mod saga;
pub mod store;
pub mod totals;

pub use database::Database;
pub use metrics::{get_metrics, init_metrics};
pub use store::BillingStore;
