//! Visit types as seen from the billing engine.
//!
//! The visit lifecycle is owned by a separate subsystem; billing only reads
//! status and requests completion through the gateway.

use serde::{Deserialize, Serialize};

/// Visit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    InProgress,
    Completed,
    Cancelled,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::InProgress => "in_progress",
            VisitStatus::Completed => "completed",
            VisitStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => VisitStatus::Completed,
            "cancelled" => VisitStatus::Cancelled,
            _ => VisitStatus::InProgress,
        }
    }
}

impl std::fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a visit-completion request.
#[derive(Debug, Clone, Default)]
pub struct VisitCompletion {
    pub completed_by: Option<String>,
}
