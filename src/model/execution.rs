//! Per-test-case execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::string_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    NotStarted,
    Running,
    Passed,
    Failed,
    Blocked,
    Skipped,
    Error,
}

string_enum!(TestStatus {
    NotStarted => "NOT_STARTED",
    Running => "RUNNING",
    Passed => "PASSED",
    Failed => "FAILED",
    Blocked => "BLOCKED",
    Skipped => "SKIPPED",
    Error => "ERROR",
});

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TestStatus::NotStarted | TestStatus::Running)
    }
}

/// Terminal judgment for one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    Failed,
    Blocked,
    Skipped,
    Error,
}

string_enum!(Verdict {
    Passed => "PASSED",
    Failed => "FAILED",
    Blocked => "BLOCKED",
    Skipped => "SKIPPED",
    Error => "ERROR",
});

impl From<Verdict> for TestStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Passed => TestStatus::Passed,
            Verdict::Failed => TestStatus::Failed,
            Verdict::Blocked => TestStatus::Blocked,
            Verdict::Skipped => TestStatus::Skipped,
            Verdict::Error => TestStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestExecutionRecord {
    pub id: String,
    pub run_id: String,
    pub test_case_id: String,
    /// Position in the run, `0..total`.
    pub sequence: u32,
    pub status: TestStatus,
    pub verdict: Option<Verdict>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
    pub current_step: u32,
    pub total_steps: u32,
    pub tool_calls: u32,
    pub duration_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Final state written when a test case ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub verdict: Verdict,
    pub confidence: Option<f64>,
    pub reason: String,
    pub steps: u32,
    pub tool_calls: u32,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    pub fn new(verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            confidence: None,
            reason: reason.into(),
            steps: 0,
            tool_calls: 0,
            duration_ms: 0,
        }
    }
}
