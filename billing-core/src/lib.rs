//! billing-core: Shared infrastructure for the clinic billing engine.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
