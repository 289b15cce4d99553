//! Catalog rows maintained by the surrounding audit application.
//!
//! The engine only reads these; `storage::catalog` also offers inserts so the
//! CLI can import a session for standalone use.

use serde::{Deserialize, Serialize};

use crate::llm::LlmSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSession {
    pub id: String,
    pub name: String,
    /// Closed or archived sessions cannot start new runs.
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Execution settings a run is started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub id: String,
    pub name: String,
    /// Required for AUTOMATIC mode.
    #[serde(default)]
    pub low_risk: bool,
    /// Per-test-case step budget; falls back to `execution.default_max_steps`.
    #[serde(default)]
    pub max_steps: Option<u32>,
    /// Run wall-clock budget; falls back to `queue.run_timeout_sec`.
    #[serde(default)]
    pub run_timeout_sec: Option<u64>,
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub session_id: String,
    /// Ordering key within the session.
    pub position: u32,
    pub title: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    pub expected_result: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Catalog rows as loaded by `auditrun catalog import`.
///
/// ```toml
/// [[sessions]]
/// id = "q3-review"
/// name = "Q3 access review"
///
/// [[test_cases]]
/// id = "tc-1"
/// session_id = "q3-review"
/// position = 1
/// title = "Admin accounts use MFA"
/// expected_result = "every admin has MFA enabled"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub sessions: Vec<AuditSession>,
    #[serde(default)]
    pub configs: Vec<RunConfiguration>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}
