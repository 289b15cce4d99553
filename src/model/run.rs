//! The audit run record and its aggregate counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::execution::TestStatus;
use super::string_enum;
use crate::run::RunStatus;

/// How much autonomy the agent has during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// No confirmation gate. Only allowed for low-risk configurations.
    Automatic,
    /// Tool calls matching the confirmation policy wait for a human.
    SemiAutomatic,
    /// Every proposed action is handed to a human for manual execution.
    Assisted,
    /// Decisions are made but tool calls are simulated.
    DryRun,
}

string_enum!(ExecutionMode {
    Automatic => "AUTOMATIC",
    SemiAutomatic => "SEMI_AUTOMATIC",
    Assisted => "ASSISTED",
    DryRun => "DRY_RUN",
});

/// Aggregate test-case outcomes for a run.
///
/// `completed` counts terminal records. ERROR records are folded into
/// `blocked`, so `passed + failed + blocked + skipped == completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: u32,
    pub completed: u32,
    pub passed: u32,
    pub failed: u32,
    pub blocked: u32,
    pub skipped: u32,
}

impl RunCounters {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Count one record that reached `status`. Non-terminal statuses are ignored.
    pub fn record(&mut self, status: TestStatus) {
        let slot = match status {
            TestStatus::Passed => &mut self.passed,
            TestStatus::Failed => &mut self.failed,
            TestStatus::Blocked | TestStatus::Error => &mut self.blocked,
            TestStatus::Skipped => &mut self.skipped,
            TestStatus::NotStarted | TestStatus::Running => return,
        };
        *slot += 1;
        self.completed += 1;
    }

    pub fn outcome_sum(&self) -> u32 {
        self.passed + self.failed + self.blocked + self.skipped
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.completed)
    }
}

/// One execution of a session's test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRun {
    pub id: String,
    pub session_id: String,
    pub config_id: String,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost_usd: f64,
    pub supervisor: Option<String>,
    pub failure_reason: Option<String>,
}

/// Input to `enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub session_id: String,
    pub config_id: String,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub supervisor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub session_id: Option<String>,
    pub limit: Option<u32>,
}
