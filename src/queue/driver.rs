//! One spawned task per admitted run: setup, then every test case in order.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Command, DriverOutcome, LlmSource, LoopEvent, Shared};
use crate::engine::executor::CaseResult;
use crate::engine::{execute_test_case, EngineContext, StatusSink};
use crate::llm::LlmAdapter;
use crate::model::{
    AuditRun, ExecutionOutcome, LogEventType, LogLevel, RunLogEntry, TestStatus, Verdict,
};
use crate::run::{RunControl, StopReason};
use crate::transport::ToolCapability;

impl From<StopReason> for DriverOutcome {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Cancelled => DriverOutcome::Cancelled,
            StopReason::TimedOut => DriverOutcome::TimedOut,
        }
    }
}

/// Forwards confirmation waits to the queue actor.
struct QueueSink {
    events: mpsc::Sender<Command>,
}

#[async_trait]
impl StatusSink for QueueSink {
    async fn confirmation_required(&self, run_id: &str, confirmation_id: &str) {
        let _ = self
            .events
            .send(Command::Event(LoopEvent::ConfirmationRequired {
                run_id: run_id.to_string(),
                confirmation_id: confirmation_id.to_string(),
            }))
            .await;
    }

    async fn confirmation_resolved(&self, run_id: &str, confirmation_id: &str) {
        let _ = self
            .events
            .send(Command::Event(LoopEvent::ConfirmationResolved {
                run_id: run_id.to_string(),
                confirmation_id: confirmation_id.to_string(),
            }))
            .await;
    }
}

pub(crate) struct RunDriver {
    shared: Arc<Shared>,
    run: AuditRun,
    control: RunControl,
    events: mpsc::Sender<Command>,
    /// First sequence number to execute (non-zero after recovery).
    start_at: u32,
}

impl RunDriver {
    pub fn new(
        shared: Arc<Shared>,
        run: AuditRun,
        control: RunControl,
        events: mpsc::Sender<Command>,
        start_at: u32,
    ) -> Self {
        Self {
            shared,
            run,
            control,
            events,
            start_at,
        }
    }

    pub async fn run(self) -> DriverOutcome {
        match self.execute().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(run_id = %self.run.id, error = %format!("{:#}", e), "run driver failed");
                DriverOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn execute(&self) -> Result<DriverOutcome> {
        let store = &self.shared.store;
        let run_id = self.run.id.as_str();

        // -------------------------------------------------------------------
        // Setup
        // -------------------------------------------------------------------

        let config = store
            .get_config(&self.run.config_id)?
            .ok_or_else(|| anyhow!("run configuration {} no longer exists", self.run.config_id))?;
        let cases = store.test_cases_for_session(&self.run.session_id)?;
        if cases.len() as u32 != self.run.counters.total {
            return Err(anyhow!(
                "session {} now has {} test cases, run expects {}",
                self.run.session_id,
                cases.len(),
                self.run.counters.total
            ));
        }

        let llm = match &self.shared.llm {
            LlmSource::Fixed(adapter) => adapter.clone(),
            LlmSource::FromRunConfig => {
                LlmAdapter::from_settings(&config.llm).context("failed to build LLM client")?
            }
        };

        let capabilities = match self.capabilities().await? {
            Ok(caps) => caps,
            Err(reason) => return Ok(reason.into()),
        };
        debug!(run_id, tools = capabilities.len(), "target capabilities loaded");

        self.send(LoopEvent::SetupComplete {
            run_id: run_id.to_string(),
        })
        .await;

        let limits = self.shared.config.execution.clone();
        let max_steps = config.max_steps.unwrap_or(limits.default_max_steps).max(1);
        let ctx = EngineContext {
            run_id: run_id.to_string(),
            mode: self.run.mode,
            store: store.clone(),
            journal: self.shared.journal.clone(),
            gate: self.shared.gate.clone(),
            transport: self.shared.transport.clone(),
            llm,
            llm_settings: config.llm.clone(),
            policy: self.shared.policy.clone(),
            capabilities,
            limits,
            max_steps,
            control: self.control.clone(),
            status: Arc::new(QueueSink {
                events: self.events.clone(),
            }),
        };

        // -------------------------------------------------------------------
        // Test cases
        // -------------------------------------------------------------------

        let session_started = Instant::now();
        let mut finished_here = 0u32;

        for (sequence, case) in cases.iter().enumerate().skip(self.start_at as usize) {
            let sequence = sequence as u32;
            if let Err(reason) = self.control.checkpoint().await {
                return Ok(reason.into());
            }

            let record = store.begin_execution(run_id, sequence, &case.id, max_steps)?;
            self.shared
                .journal
                .record(
                    RunLogEntry::new(
                        run_id,
                        LogEventType::TestCaseStarted,
                        format!("test case {} of {}: {}", sequence + 1, cases.len(), case.title),
                    )
                    .with_metadata(json!({
                        "execution_id": record.id,
                        "test_case_id": case.id,
                        "sequence": sequence,
                    })),
                )
                .await?;

            let result = if case.enabled {
                execute_test_case(&ctx, case, &record).await?
            } else {
                CaseResult {
                    outcome: ExecutionOutcome::new(Verdict::Skipped, "test case disabled"),
                    stopped: None,
                }
            };

            finished_here += 1;
            let remaining = cases.len() as u32 - sequence - 1;
            let estimate = (remaining > 0).then(|| {
                let per_case = session_started.elapsed() / finished_here;
                Utc::now()
                    + chrono::Duration::from_std(per_case * remaining)
                        .unwrap_or_else(|_| chrono::Duration::zero())
            });

            let finished = store.finish_execution(&record.id, &result.outcome, estimate)?;
            let level = match finished.status {
                TestStatus::Passed | TestStatus::Skipped => LogLevel::Info,
                TestStatus::Failed | TestStatus::Blocked => LogLevel::Warn,
                _ => LogLevel::Error,
            };
            self.shared
                .journal
                .record(
                    RunLogEntry::new(
                        run_id,
                        LogEventType::TestCaseFinished,
                        format!("{}: {} ({})", case.title, result.outcome.verdict, result.outcome.reason),
                    )
                    .with_level(level)
                    .with_metadata(json!({
                        "execution_id": finished.id,
                        "sequence": sequence,
                        "verdict": result.outcome.verdict,
                        "confidence": result.outcome.confidence,
                        "steps": result.outcome.steps,
                        "tool_calls": result.outcome.tool_calls,
                        "duration_ms": result.outcome.duration_ms,
                    })),
                )
                .await?;

            if let Some(reason) = result.stopped {
                return Ok(reason.into());
            }
        }

        // A pause requested during the last step holds completion until resume
        if let Err(reason) = self.control.checkpoint().await {
            return Ok(reason.into());
        }

        info!(run_id, "all test cases finished");
        Ok(DriverOutcome::Completed)
    }

    /// Fetch the target's tool list, retrying transient failures. The inner
    /// `Err` is a stop signal received while backing off.
    async fn capabilities(&self) -> Result<Result<Vec<ToolCapability>, StopReason>> {
        let limits = &self.shared.config.execution;
        let mut failures = 0u32;

        loop {
            match self.shared.transport.capabilities().await {
                Ok(caps) => return Ok(Ok(caps)),
                Err(e) if e.is_transient() && failures < limits.transport_retry_ceiling => {
                    failures += 1;
                    let delay = limits.backoff(failures);
                    self.shared
                        .journal
                        .record(
                            RunLogEntry::new(
                                &self.run.id,
                                LogEventType::TransportRetry,
                                format!("capability query failed ({}), retry {}", e, failures),
                            )
                            .with_level(LogLevel::Warn),
                        )
                        .await?;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        reason = self.control.stopped() => return Ok(Err(reason)),
                    }
                }
                Err(e) => {
                    return Err(anyhow!(e)).context("could not load target capabilities");
                }
            }
        }
    }

    async fn send(&self, event: LoopEvent) {
        let _ = self.events.send(Command::Event(event)).await;
    }
}
