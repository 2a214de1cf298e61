//! Collaborator contracts consumed by the billing engine.
//!
//! The visit subsystem, notification delivery, and audit trail are external
//! systems. They are injected into workflows as trait objects; notification
//! and audit calls are best-effort and their failures are logged, never
//! propagated into billing results.

use crate::models::{VisitCompletion, VisitStatus};
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Failure talking to an external collaborator.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Read/complete capability on the visit subsystem.
#[async_trait]
pub trait VisitGateway: Send + Sync {
    async fn status(&self, visit_id: Uuid) -> Result<VisitStatus, GatewayError>;

    async fn complete(&self, visit_id: Uuid, meta: VisitCompletion) -> Result<(), GatewayError>;
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// On-call operators: rollback-incomplete escalation lands here.
    Operators,
    BillingStaff,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Operators => "operators",
            Audience::BillingStaff => "billing_staff",
        }
    }
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(&self, audience: Audience, message: &str) -> Result<(), GatewayError>;
}

/// An audit event emitted on every billing mutation.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: &'static str,
    pub invoice_id: Uuid,
    pub actor: Option<String>,
    pub detail: serde_json::Value,
}

#[async_trait]
pub trait AuditGateway: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), GatewayError>;
}

/// Send a notification, logging delivery failures instead of surfacing them.
pub(crate) async fn notify_best_effort(
    gateway: &dyn NotificationGateway,
    audience: Audience,
    message: &str,
) {
    if let Err(e) = gateway.notify(audience, message).await {
        warn!(audience = audience.as_str(), error = %e, "notification delivery failed");
    }
}

/// Record an audit event, logging failures instead of surfacing them.
pub(crate) async fn audit_best_effort(gateway: &dyn AuditGateway, event: AuditEvent) {
    let action = event.action;
    let invoice_id = event.invoice_id;
    if let Err(e) = gateway.record(event).await {
        warn!(action, invoice_id = %invoice_id, error = %e, "audit record failed");
    }
}
