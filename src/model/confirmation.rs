//! Human confirmation requests for risky actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::string_enum;

/// Category of risky action that triggered a confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationKind {
    Destructive,
    Irreversible,
    Privileged,
    ExternalEffect,
    /// ASSISTED mode: the human performs the action and reports the result.
    ManualExecution,
}

string_enum!(ConfirmationKind {
    Destructive => "destructive",
    Irreversible => "irreversible",
    Privileged => "privileged",
    ExternalEffect => "external_effect",
    ManualExecution => "manual_execution",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

string_enum!(ConfirmationStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
    Expired => "EXPIRED",
});

/// The tool call awaiting approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub tool: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub kind: ConfirmationKind,
    pub action: ProposedAction,
    /// Snippet shown to the approver (test case, step, reasoning).
    pub context: String,
    pub status: ConfirmationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub responder: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationDecision {
    Approve,
    Reject,
}

impl ConfirmationDecision {
    pub fn status(self) -> ConfirmationStatus {
        match self {
            ConfirmationDecision::Approve => ConfirmationStatus::Approved,
            ConfirmationDecision::Reject => ConfirmationStatus::Rejected,
        }
    }
}

/// A human's answer to a pending request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationResponse {
    pub decision: ConfirmationDecision,
    #[serde(default)]
    pub responder: Option<String>,
    /// Free text; in ASSISTED mode this carries the observed result.
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmationFilter {
    pub run_id: Option<String>,
    pub status: Option<ConfirmationStatus>,
}
