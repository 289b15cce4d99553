//! Test execution loop: LLM reasoning, policy check, tool invocation,
//! observation, repeated until a verdict or a stop condition.

pub mod executor;
pub mod policy;
pub mod prompt;
pub mod verdict;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::ExecutionConfig;
use crate::gate::ConfirmationGate;
use crate::journal::RunJournal;
use crate::llm::{LlmAdapter, LlmSettings};
use crate::model::{ExecutionMode, ProposedAction};
use crate::run::RunControl;
use crate::storage::Store;
use crate::transport::{ToolCapability, ToolTransport};

pub use self::executor::{execute_test_case, CaseResult};
pub use self::policy::ConfirmationPolicy;

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    ToolResult,
    ToolError,
    Rejected,
    Expired,
    Manual,
    Simulated,
    ParseError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub kind: ObservationKind,
    pub content: String,
}

impl Observation {
    pub fn new(kind: ObservationKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

/// One decide/act/observe cycle. Ephemeral: it only lives on as a
/// `step_completed` log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStep {
    pub index: u32,
    pub action: ProposedAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_id: Option<String>,
    pub observation: Observation,
    pub duration_ms: u64,
}

/// Receives the loop's confirmation waits so the run status can follow
/// (RUNNING <-> WAITING_CONFIRMATION).
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn confirmation_required(&self, run_id: &str, confirmation_id: &str);
    async fn confirmation_resolved(&self, run_id: &str, confirmation_id: &str);
}

/// Everything one run's loop needs, assembled by the run driver.
#[derive(Clone)]
pub struct EngineContext {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub store: Store,
    pub journal: RunJournal,
    pub gate: Arc<ConfirmationGate>,
    pub transport: Arc<dyn ToolTransport>,
    pub llm: LlmAdapter,
    pub llm_settings: LlmSettings,
    pub policy: ConfirmationPolicy,
    pub capabilities: Vec<ToolCapability>,
    pub limits: ExecutionConfig,
    pub max_steps: u32,
    pub control: RunControl,
    pub status: Arc<dyn StatusSink>,
}

impl EngineContext {
    pub fn capability(&self, tool: &str) -> Option<&ToolCapability> {
        self.capabilities.iter().find(|c| c.name == tool)
    }
}
