//! Per-test-case decision loop.
//!
//! Each iteration is one step: a step-boundary checkpoint (pause, cancel,
//! deadline), a model decision, and, for a tool call, the mode-specific
//! action (simulate, ask a human, or invoke the target) whose observation is
//! fed back into the conversation.

use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::prompt;
use super::verdict::{parse_verdict, Decision};
use super::{EngineContext, ExecutionStep, Observation, ObservationKind};
use crate::gate::{ConfirmationOutcome, GateError};
use crate::llm::{LlmError, Message, Reply, ToolCall, ToolSpec};
use crate::model::{
    ConfirmationKind, ExecutionMode, ExecutionOutcome, LogEventType, LogLevel, ProposedAction,
    RunLogEntry, TestCase, TestExecutionRecord, Verdict,
};
use crate::run::StopReason;
use crate::transport::TransportError;

const MAX_OBSERVATION_CHARS: usize = 8_000;

pub const STEP_BUDGET_EXCEEDED: &str = "step budget exceeded";
pub const RUN_CANCELLED: &str = "run cancelled";
pub const RUN_TIMED_OUT: &str = "run wall-clock budget exceeded";

/// How a test case ended.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseResult {
    pub outcome: ExecutionOutcome,
    /// Set when the run was cancelled or timed out during this case.
    pub stopped: Option<StopReason>,
}

/// Either keep going with a value or end the case.
enum Flow<T> {
    Next(T),
    Done(CaseResult),
}

enum Parsed {
    Call(ToolCall),
    Verdict(Decision),
}

/// Why an in-flight model or tool call was abandoned.
enum Cutoff {
    Run(StopReason),
    CaseBudget,
}

struct ParseFailure {
    problem: String,
    call: Option<ToolCall>,
    answer: Option<String>,
}

/// Run one enabled test case to a terminal outcome. `Err` means the run
/// itself cannot continue (storage failure).
pub async fn execute_test_case(
    ctx: &EngineContext,
    case: &TestCase,
    record: &TestExecutionRecord,
) -> Result<CaseResult> {
    let mut exec = CaseLoop::new(ctx, case, record);
    exec.run().await
}

struct CaseLoop<'a> {
    ctx: &'a EngineContext,
    case: &'a TestCase,
    record: &'a TestExecutionRecord,
    started: Instant,
    case_deadline: Option<Instant>,
    tools: Vec<ToolSpec>,
    messages: Vec<Message>,
    steps: u32,
    tool_calls: u32,
}

impl<'a> CaseLoop<'a> {
    fn new(ctx: &'a EngineContext, case: &'a TestCase, record: &'a TestExecutionRecord) -> Self {
        let started = Instant::now();
        let messages = vec![
            Message::system(prompt::system_prompt(ctx.mode)),
            Message::user(prompt::test_case_prompt(case, &ctx.capabilities, ctx.max_steps)),
        ];
        Self {
            ctx,
            case,
            record,
            started,
            case_deadline: ctx.limits.test_case_timeout().map(|t| started + t),
            tools: ctx.capabilities.iter().map(ToolSpec::from).collect(),
            messages,
            steps: 0,
            tool_calls: 0,
        }
    }

    async fn run(&mut self) -> Result<CaseResult> {
        let mut repairs = 0u32;
        let mut error_fed_back = false;

        loop {
            if let Err(reason) = self.ctx.control.checkpoint().await {
                return Ok(self.stopped(reason));
            }
            if self.budget_exhausted() {
                return Ok(self.finish(Verdict::Blocked, None, STEP_BUDGET_EXCEEDED));
            }

            let reply = match self.decide().await? {
                Flow::Next(reply) => reply,
                Flow::Done(result) => return Ok(result),
            };

            match self.parse(reply) {
                Err(failure) => {
                    if repairs < self.ctx.limits.max_repair_attempts {
                        repairs += 1;
                        debug!(
                            run_id = %self.ctx.run_id,
                            attempt = repairs,
                            problem = %failure.problem,
                            "asking model to repair its reply"
                        );
                        self.push_feedback(&failure, prompt::repair_prompt(&failure.problem));
                    } else if !error_fed_back {
                        error_fed_back = true;
                        self.push_feedback(&failure, prompt::parse_error_observation(&failure.problem));
                    } else {
                        return Ok(self.finish(
                            Verdict::Blocked,
                            None,
                            format!("unparseable model output: {}", failure.problem),
                        ));
                    }
                }
                Ok(Parsed::Verdict(decision)) => {
                    self.steps += 1;
                    let reason = if decision.reasoning.is_empty() {
                        "no reasoning given".to_string()
                    } else {
                        decision.reasoning
                    };
                    return Ok(self.finish(decision.verdict, decision.confidence, reason));
                }
                Ok(Parsed::Call(call)) => {
                    repairs = 0;
                    error_fed_back = false;
                    self.steps += 1;
                    if let Flow::Done(result) = self.act(call).await? {
                        return Ok(result);
                    }
                    self.ctx
                        .store
                        .set_execution_progress(&self.record.id, self.steps, self.tool_calls)?;
                }
            }
        }
    }

    fn budget_exhausted(&self) -> bool {
        self.steps >= self.ctx.max_steps
            || self.case_deadline.is_some_and(|d| Instant::now() >= d)
    }

    // -----------------------------------------------------------------------
    // Decision
    // -----------------------------------------------------------------------

    /// Ask the model, retrying transient provider failures. A malformed
    /// reply comes back as `Next(Err(problem))`.
    async fn decide(&mut self) -> Result<Flow<Result<Reply, String>>> {
        let options = self
            .ctx
            .llm_settings
            .options(self.ctx.limits.llm_call_timeout());
        let mut attempt = 0u32;

        loop {
            let completion = tokio::select! {
                completion = self.ctx.llm.complete(&self.messages, &self.tools, &options) => completion,
                cutoff = self.cutoff() => return Ok(Flow::Done(self.cut_off(cutoff))),
            };
            let error = match completion {
                Ok(completion) => {
                    let usage = completion.usage;
                    if usage.prompt_tokens + usage.completion_tokens > 0 {
                        self.ctx.store.add_usage(
                            &self.ctx.run_id,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                            self.ctx.llm_settings.cost(&usage),
                        )?;
                    }
                    return Ok(Flow::Next(Ok(completion.reply)));
                }
                Err(LlmError::Malformed(problem)) => return Ok(Flow::Next(Err(problem))),
                Err(e) => e,
            };

            if !error.is_transient() {
                let reason = match &error {
                    LlmError::Auth(msg) => format!("LLM authentication failed: {}", msg),
                    other => other.to_string(),
                };
                return Ok(Flow::Done(self.finish(Verdict::Error, None, reason)));
            }

            if attempt >= self.ctx.limits.llm_max_retries {
                return Ok(Flow::Done(self.finish(
                    Verdict::Blocked,
                    None,
                    format!("LLM unavailable after {} retries: {}", attempt, error),
                )));
            }

            attempt += 1;
            let delay = match &error {
                LlmError::RateLimited {
                    retry_after: Some(after),
                } => *after,
                _ => self.ctx.limits.backoff(attempt),
            };
            self.log(
                RunLogEntry::new(
                    &self.ctx.run_id,
                    LogEventType::LlmRetry,
                    format!("model call failed ({}), retry {} in {:?}", error, attempt, delay),
                )
                .with_level(LogLevel::Warn)
                .with_metadata(json!({
                    "attempt": attempt,
                    "delay_ms": delay.as_millis() as u64,
                    "error": error.to_string(),
                })),
            )
            .await?;

            if let Some(reason) = self.sleep(delay).await {
                return Ok(Flow::Done(self.stopped(reason)));
            }
        }
    }

    fn parse(&self, reply: Result<Reply, String>) -> Result<Parsed, ParseFailure> {
        match reply {
            Ok(Reply::ToolCall(mut call)) => {
                if call.id.is_empty() {
                    call.id = format!("call_{}", self.steps + 1);
                }
                match self.validate_call(&call) {
                    Ok(()) => Ok(Parsed::Call(call)),
                    Err(problem) => Err(ParseFailure {
                        problem,
                        call: Some(call),
                        answer: None,
                    }),
                }
            }
            Ok(Reply::FinalAnswer(text)) => match parse_verdict(&text) {
                Ok(decision) => Ok(Parsed::Verdict(decision)),
                Err(problem) => Err(ParseFailure {
                    problem,
                    call: None,
                    answer: Some(text),
                }),
            },
            Err(problem) => Err(ParseFailure {
                problem,
                call: None,
                answer: None,
            }),
        }
    }

    fn validate_call(&self, call: &ToolCall) -> Result<(), String> {
        if self.ctx.capability(&call.name).is_none() {
            let known: Vec<&str> = self.ctx.capabilities.iter().map(|c| c.name.as_str()).collect();
            return Err(format!(
                "unknown tool '{}' (available: {})",
                call.name,
                if known.is_empty() { "none".to_string() } else { known.join(", ") }
            ));
        }
        if !call.arguments.is_object() {
            return Err(format!("arguments for '{}' must be a JSON object", call.name));
        }
        Ok(())
    }

    /// Echo the failed reply and append the correction text.
    fn push_feedback(&mut self, failure: &ParseFailure, text: String) {
        match (&failure.call, &failure.answer) {
            (Some(call), _) => {
                self.messages.push(Message::tool_request(call.clone()));
                self.messages.push(Message::tool_result(call.id.clone(), text));
            }
            (None, Some(answer)) => {
                self.messages.push(Message::assistant(answer.clone()));
                self.messages.push(Message::user(text));
            }
            (None, None) => self.messages.push(Message::user(text)),
        }
    }

    // -----------------------------------------------------------------------
    // Action
    // -----------------------------------------------------------------------

    async fn act(&mut self, call: ToolCall) -> Result<Flow<()>> {
        let step_started = Instant::now();
        let action = ProposedAction {
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            reasoning: call.reasoning.clone(),
        };

        let mut confirmation_id = None;
        let observation = match self.ctx.mode {
            ExecutionMode::DryRun => Observation::new(
                ObservationKind::Simulated,
                format!(
                    "[dry run] '{}' was not executed. Assume it behaves as the target normally would for arguments {}.",
                    call.name, call.arguments
                ),
            ),
            ExecutionMode::Assisted => {
                let (id, outcome) = match self.confirm(ConfirmationKind::ManualExecution, &action).await? {
                    Flow::Next(v) => v,
                    Flow::Done(result) => return Ok(Flow::Done(result)),
                };
                confirmation_id = id;
                match outcome {
                    ConfirmationOutcome::Approved { note, .. } => Observation::new(
                        ObservationKind::Manual,
                        note.filter(|n| !n.trim().is_empty())
                            .unwrap_or_else(|| "operator performed the step and left no notes".to_string()),
                    ),
                    other => negative_observation(&call.name, &other),
                }
            }
            ExecutionMode::SemiAutomatic => {
                let required = self.ctx.policy.evaluate(
                    &call.name,
                    &call.arguments,
                    self.ctx.capability(&call.name),
                );
                match required {
                    Some(kind) => {
                        let (id, outcome) = match self.confirm(kind, &action).await? {
                            Flow::Next(v) => v,
                            Flow::Done(result) => return Ok(Flow::Done(result)),
                        };
                        confirmation_id = id;
                        if outcome.is_approved() {
                            match self.invoke(&call).await? {
                                Flow::Next(obs) => obs,
                                Flow::Done(result) => return Ok(Flow::Done(result)),
                            }
                        } else {
                            negative_observation(&call.name, &outcome)
                        }
                    }
                    None => match self.invoke(&call).await? {
                        Flow::Next(obs) => obs,
                        Flow::Done(result) => return Ok(Flow::Done(result)),
                    },
                }
            }
            ExecutionMode::Automatic => match self.invoke(&call).await? {
                Flow::Next(obs) => obs,
                Flow::Done(result) => return Ok(Flow::Done(result)),
            },
        };

        self.messages.push(Message::tool_request(call.clone()));
        self.messages
            .push(Message::tool_result(call.id.clone(), observation.content.clone()));

        let step = ExecutionStep {
            index: self.steps,
            action,
            confirmation_id,
            observation,
            duration_ms: step_started.elapsed().as_millis() as u64,
        };
        self.log(
            RunLogEntry::new(
                &self.ctx.run_id,
                LogEventType::StepCompleted,
                format!("step {} of '{}': {}", step.index, self.case.title, call.name),
            )
            .with_level(LogLevel::Debug)
            .with_metadata(json!({
                "execution_id": self.record.id,
                "step": step,
            })),
        )
        .await?;

        Ok(Flow::Next(()))
    }

    /// Request a confirmation and wait for it, giving up if the run stops.
    async fn confirm(
        &mut self,
        kind: ConfirmationKind,
        action: &ProposedAction,
    ) -> Result<Flow<(Option<String>, ConfirmationOutcome)>> {
        let context = format!(
            "test case '{}' (#{}), step {} of {}",
            self.case.title, self.record.sequence, self.steps, self.ctx.max_steps
        );
        let handle = match self
            .ctx
            .gate
            .request(
                &self.ctx.run_id,
                Some(&self.record.id),
                kind,
                action.clone(),
                context,
                None,
            )
            .await
        {
            Ok(handle) => handle,
            Err(GateError::AlreadyPending(_)) => {
                return Ok(Flow::Next((
                    None,
                    ConfirmationOutcome::Rejected {
                        responder: None,
                        note: Some("another confirmation is already pending for this run".into()),
                    },
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let id = handle.id().to_string();
        self.ctx.status.confirmation_required(&self.ctx.run_id, &id).await;

        let outcome = tokio::select! {
            outcome = handle.wait() => outcome,
            reason = self.ctx.control.stopped() => {
                self.ctx.gate.withdraw(&id, stop_text(reason)).await?;
                return Ok(Flow::Done(self.stopped(reason)));
            }
        };

        self.ctx.status.confirmation_resolved(&self.ctx.run_id, &id).await;
        Ok(Flow::Next((Some(id), outcome)))
    }

    /// Invoke the tool on the target, retrying transient failures up to the
    /// configured ceiling.
    async fn invoke(&mut self, call: &ToolCall) -> Result<Flow<Observation>> {
        let ceiling = self.ctx.limits.transport_retry_ceiling;
        let mut failures = 0u32;

        loop {
            let invoked = tokio::select! {
                invoked = self.ctx.transport.invoke_tool(&call.name, call.arguments.clone()) => invoked,
                cutoff = self.cutoff() => return Ok(Flow::Done(self.cut_off(cutoff))),
            };
            match invoked {
                Ok(result) => {
                    self.tool_calls += 1;
                    return Ok(Flow::Next(Observation::new(
                        ObservationKind::ToolResult,
                        render(&result),
                    )));
                }
                Err(TransportError::Remote { code, message }) => {
                    self.tool_calls += 1;
                    return Ok(Flow::Next(Observation::new(
                        ObservationKind::ToolError,
                        format!("tool '{}' failed with error {}: {}", call.name, code, message),
                    )));
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures > ceiling {
                        return Ok(Flow::Done(self.finish(
                            Verdict::Blocked,
                            None,
                            format!("transport failed after {} retries: {}", ceiling, e),
                        )));
                    }

                    let delay = self.ctx.limits.backoff(failures);
                    warn!(
                        run_id = %self.ctx.run_id,
                        tool = %call.name,
                        attempt = failures,
                        error = %e,
                        "transient transport failure"
                    );
                    self.log(
                        RunLogEntry::new(
                            &self.ctx.run_id,
                            LogEventType::TransportRetry,
                            format!("'{}' failed ({}), retry {} of {}", call.name, e, failures, ceiling),
                        )
                        .with_level(LogLevel::Warn)
                        .with_metadata(json!({"tool": call.name, "attempt": failures})),
                    )
                    .await?;

                    if let Some(reason) = self.sleep(delay).await {
                        return Ok(Flow::Done(self.stopped(reason)));
                    }
                }
                Err(e) => {
                    return Ok(Flow::Done(self.finish(
                        Verdict::Blocked,
                        None,
                        format!("transport unavailable: {}", e),
                    )));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Resolves when the run stops or this case runs out of time.
    async fn cutoff(&self) -> Cutoff {
        let case_budget = async {
            match self.case_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            reason = self.ctx.control.stopped() => Cutoff::Run(reason),
            _ = case_budget => Cutoff::CaseBudget,
        }
    }

    fn cut_off(&self, cutoff: Cutoff) -> CaseResult {
        match cutoff {
            Cutoff::Run(reason) => self.stopped(reason),
            Cutoff::CaseBudget => self.finish(Verdict::Blocked, None, STEP_BUDGET_EXCEEDED),
        }
    }

    /// Sleep unless the run stops first.
    async fn sleep(&self, delay: Duration) -> Option<StopReason> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            reason = self.ctx.control.stopped() => Some(reason),
        }
    }

    async fn log(&self, entry: RunLogEntry) -> Result<()> {
        self.ctx.journal.record(entry).await?;
        Ok(())
    }

    fn finish(&self, verdict: Verdict, confidence: Option<f64>, reason: impl Into<String>) -> CaseResult {
        CaseResult {
            outcome: ExecutionOutcome {
                verdict,
                confidence,
                reason: reason.into(),
                steps: self.steps.min(self.ctx.max_steps),
                tool_calls: self.tool_calls,
                duration_ms: self.started.elapsed().as_millis() as u64,
            },
            stopped: None,
        }
    }

    fn stopped(&self, reason: StopReason) -> CaseResult {
        let verdict = match reason {
            StopReason::Cancelled => Verdict::Skipped,
            StopReason::TimedOut => Verdict::Blocked,
        };
        let mut result = self.finish(verdict, None, stop_text(reason));
        result.stopped = Some(reason);
        result
    }
}

pub fn stop_text(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Cancelled => RUN_CANCELLED,
        StopReason::TimedOut => RUN_TIMED_OUT,
    }
}

fn negative_observation(tool: &str, outcome: &ConfirmationOutcome) -> Observation {
    match outcome {
        ConfirmationOutcome::Rejected { responder, note } => Observation::new(
            ObservationKind::Rejected,
            format!(
                "The call to '{}' was rejected by {}{}. It was not executed; do not retry it.",
                tool,
                responder.as_deref().unwrap_or("the supervisor"),
                note.as_deref().map(|n| format!(": {}", n)).unwrap_or_default()
            ),
        ),
        ConfirmationOutcome::Expired { reason } => Observation::new(
            ObservationKind::Expired,
            format!("The confirmation for '{}' expired ({}). It was not executed.", tool, reason),
        ),
        ConfirmationOutcome::Approved { .. } => Observation::new(
            ObservationKind::Manual,
            format!("The call to '{}' was approved.", tool),
        ),
    }
}

fn render(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_OBSERVATION_CHARS {
        let cut: String = text.chars().take(MAX_OBSERVATION_CHARS).collect();
        format!("{}... [truncated]", cut)
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::config::ExecutionConfig;
    use crate::engine::policy::{default_rules, ConfirmationPolicy};
    use crate::engine::StatusSink;
    use crate::gate::ConfirmationGate;
    use crate::journal::RunJournal;
    use crate::llm::{LlmAdapter, LlmSettings, ProviderKind, ScriptedLlm};
    use crate::model::{ConfirmationDecision, ConfirmationResponse, ConfirmationStatus};
    use crate::run::{RunControl, RunStatus};
    use crate::storage::runs::tests::sample_run;
    use crate::storage::Store;
    use crate::transport::{MockTransport, ToolTransport};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, String)>>,
        required: Mutex<Option<mpsc::UnboundedSender<String>>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn confirmation_required(&self, _run_id: &str, confirmation_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push(("required".into(), confirmation_id.into()));
            if let Some(tx) = self.required.lock().unwrap().as_ref() {
                let _ = tx.send(confirmation_id.to_string());
            }
        }

        async fn confirmation_resolved(&self, _run_id: &str, confirmation_id: &str) {
            self.events
                .lock()
                .unwrap()
                .push(("resolved".into(), confirmation_id.into()));
        }
    }

    struct Harness {
        ctx: EngineContext,
        store: Store,
        script: ScriptedLlm,
        transport: Arc<MockTransport>,
        sink: Arc<RecordingSink>,
        record: TestExecutionRecord,
        case: TestCase,
    }

    fn harness(mode: ExecutionMode, max_steps: u32) -> Harness {
        let store = Store::in_memory().unwrap();
        store.insert_run(&sample_run("r1", RunStatus::Running)).unwrap();
        let journal = RunJournal::new(store.clone());
        let gate = Arc::new(ConfirmationGate::new(
            store.clone(),
            journal.clone(),
            Duration::from_secs(60),
        ));
        let transport = Arc::new(
            MockTransport::new()
                .with_tool("read_config", "Read configuration", false)
                .with_tool("delete_user", "Delete a user", false),
        );
        let script = ScriptedLlm::default();
        let sink = Arc::new(RecordingSink::default());

        let limits = ExecutionConfig {
            retry_backoff_ms: 1,
            ..ExecutionConfig::default()
        };
        let capabilities = vec![
            crate::transport::ToolCapability {
                name: "read_config".into(),
                description: "Read configuration".into(),
                input_schema: json!({"type": "object"}),
                requires_confirmation: false,
            },
            crate::transport::ToolCapability {
                name: "delete_user".into(),
                description: "Delete a user".into(),
                input_schema: json!({"type": "object"}),
                requires_confirmation: false,
            },
        ];

        let ctx = EngineContext {
            run_id: "r1".into(),
            mode,
            store: store.clone(),
            journal,
            gate,
            transport: transport.clone() as Arc<dyn ToolTransport>,
            llm: LlmAdapter::Scripted(script.clone()),
            llm_settings: LlmSettings {
                provider: ProviderKind::Scripted,
                ..LlmSettings::default()
            },
            policy: ConfirmationPolicy::new(default_rules()),
            capabilities,
            limits,
            max_steps,
            control: RunControl::new(None),
            status: sink.clone(),
        };

        let case = TestCase {
            id: "tc-1".into(),
            session_id: "session-1".into(),
            position: 1,
            title: "Config is hardened".into(),
            preconditions: vec![],
            steps: vec!["read the config".into()],
            expected_result: "debug is off".into(),
            enabled: true,
        };
        let record = store.begin_execution("r1", 1, "tc-1", max_steps).unwrap();

        Harness {
            ctx,
            store,
            script,
            transport,
            sink,
            record,
            case,
        }
    }

    const PASSED: &str = r#"{"verdict": "PASSED", "confidence": 0.9, "reasoning": "debug is off"}"#;

    #[tokio::test]
    async fn test_tool_call_then_verdict() {
        let h = harness(ExecutionMode::Automatic, 10);
        h.script.push_tool_call("read_config", json!({"section": "main"}));
        h.script.push_answer(PASSED);

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.stopped, None);
        assert_eq!(result.outcome.verdict, Verdict::Passed);
        assert_eq!(result.outcome.confidence, Some(0.9));
        assert_eq!(result.outcome.steps, 2);
        assert_eq!(result.outcome.tool_calls, 1);
        assert_eq!(h.transport.calls()[0].arguments["section"], "main");

        // The observation went back to the model
        let requests = h.script.requests();
        let second_request = &requests[1];
        assert_eq!(second_request.last().unwrap().tool_call_id.as_deref(), Some("call_1"));

        let run = h.store.get_run("r1").unwrap().unwrap();
        assert!(run.prompt_tokens > 0);
    }

    #[tokio::test]
    async fn test_step_budget_exceeded_blocks() {
        let h = harness(ExecutionMode::Automatic, 3);
        for _ in 0..5 {
            h.script.push_tool_call("read_config", json!({}));
        }

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Blocked);
        assert_eq!(result.outcome.reason, STEP_BUDGET_EXCEEDED);
        assert_eq!(result.outcome.steps, 3);
        assert_eq!(h.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_repair_then_success() {
        let h = harness(ExecutionMode::Automatic, 10);
        h.script.push_answer("it is probably fine");
        h.script.push_answer(PASSED);

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Passed);
        assert_eq!(result.outcome.steps, 1);

        let repair = h.script.requests()[1].last().unwrap().content.clone();
        assert!(repair.contains("could not be used"));
    }

    #[tokio::test]
    async fn test_repeated_parse_failures_block() {
        let h = harness(ExecutionMode::Automatic, 10);
        // Default limits: 2 repairs, then one error observation, then blocked
        for _ in 0..4 {
            h.script.push_answer("no json here");
        }

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Blocked);
        assert!(result.outcome.reason.starts_with("unparseable model output"));
        assert_eq!(h.script.requests().len(), 4);
        assert!(h.script.requests()[3].last().unwrap().content.starts_with("ERROR:"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_repairable() {
        let h = harness(ExecutionMode::Automatic, 10);
        h.script.push_tool_call("format_disk", json!({}));
        h.script.push_tool_call("read_config", json!("not an object"));
        h.script.push_answer(PASSED);

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Passed);
        assert_eq!(h.transport.call_count(), 0);
        let requests = h.script.requests();
        let feedback = &requests[1].last().unwrap().content;
        assert!(feedback.contains("unknown tool 'format_disk'"));
    }

    #[tokio::test]
    async fn test_semi_automatic_waits_for_approval() {
        let h = harness(ExecutionMode::SemiAutomatic, 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        *h.sink.required.lock().unwrap() = Some(tx);
        h.script.push_tool_call("delete_user", json!({"id": 42}));
        h.script.push_answer(PASSED);

        let gate = h.ctx.gate.clone();
        let approver = tokio::spawn(async move {
            let id = rx.recv().await.unwrap();
            gate.resolve(
                &id,
                ConfirmationResponse {
                    decision: ConfirmationDecision::Approve,
                    responder: Some("alice".into()),
                    note: None,
                },
            )
            .await
            .unwrap();
        });

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        approver.await.unwrap();

        assert_eq!(result.outcome.verdict, Verdict::Passed);
        assert_eq!(h.transport.call_count(), 1);
        let events: Vec<String> = h.sink.events.lock().unwrap().iter().map(|e| e.0.clone()).collect();
        assert_eq!(events, vec!["required", "resolved"]);
    }

    #[tokio::test]
    async fn test_rejection_is_a_negative_observation() {
        let h = harness(ExecutionMode::SemiAutomatic, 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        *h.sink.required.lock().unwrap() = Some(tx);
        h.script.push_tool_call("delete_user", json!({"id": 42}));
        h.script.push_answer(r#"{"verdict": "BLOCKED", "confidence": 0.7, "reasoning": "not allowed"}"#);

        let gate = h.ctx.gate.clone();
        tokio::spawn(async move {
            let id = rx.recv().await.unwrap();
            gate.resolve(
                &id,
                ConfirmationResponse {
                    decision: ConfirmationDecision::Reject,
                    responder: Some("bob".into()),
                    note: Some("production data".into()),
                },
            )
            .await
            .unwrap();
        });

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Blocked);
        assert_eq!(h.transport.call_count(), 0);
        let requests = h.script.requests();
        let observation = &requests[1].last().unwrap().content;
        assert!(observation.contains("rejected by bob: production data"));
    }

    #[tokio::test]
    async fn test_assisted_never_calls_transport() {
        let h = harness(ExecutionMode::Assisted, 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        *h.sink.required.lock().unwrap() = Some(tx);
        h.script.push_tool_call("read_config", json!({}));
        h.script.push_answer(PASSED);

        let gate = h.ctx.gate.clone();
        tokio::spawn(async move {
            let id = rx.recv().await.unwrap();
            let request = gate.get(&id).unwrap();
            assert_eq!(request.kind, ConfirmationKind::ManualExecution);
            gate.resolve(
                &id,
                ConfirmationResponse {
                    decision: ConfirmationDecision::Approve,
                    responder: Some("operator".into()),
                    note: Some("debug=false in main section".into()),
                },
            )
            .await
            .unwrap();
        });

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Passed);
        assert_eq!(result.outcome.tool_calls, 0);
        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(
            h.script.requests()[1].last().unwrap().content,
            "debug=false in main section"
        );
    }

    #[tokio::test]
    async fn test_dry_run_simulates_without_gate() {
        let h = harness(ExecutionMode::DryRun, 10);
        h.script.push_tool_call("delete_user", json!({"id": 1}));
        h.script.push_answer(PASSED);

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Passed);
        assert_eq!(h.transport.call_count(), 0);
        assert!(h.sink.events.lock().unwrap().is_empty());
        assert!(h.script.requests()[1].last().unwrap().content.starts_with("[dry run]"));
    }

    #[tokio::test]
    async fn test_transient_transport_failures_hit_ceiling() {
        let h = harness(ExecutionMode::Automatic, 10);
        for _ in 0..4 {
            h.transport.push_result("read_config", Err(TransportError::ConnectionLost));
        }
        h.script.push_tool_call("read_config", json!({}));

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Blocked);
        assert!(result.outcome.reason.starts_with("transport failed after 3 retries"));
        assert_eq!(h.transport.call_count(), 4);

        let retries = h
            .store
            .logs_for_run("r1", None, None)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == LogEventType::TransportRetry)
            .count();
        assert_eq!(retries, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let h = harness(ExecutionMode::Automatic, 10);
        h.transport.push_result("read_config", Err(TransportError::Timeout(Duration::from_secs(1))));
        h.transport.push_result("read_config", Ok(json!({"debug": false})));
        h.script.push_tool_call("read_config", json!({}));
        h.script.push_answer(PASSED);

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Passed);
        assert_eq!(result.outcome.tool_calls, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_error() {
        let h = harness(ExecutionMode::Automatic, 10);
        h.script.push_error(LlmError::Auth("bad key".into()));

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Error);
        assert!(result.outcome.reason.contains("authentication"));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let h = harness(ExecutionMode::Automatic, 10);
        h.script.push_error(LlmError::RateLimited {
            retry_after: Some(Duration::from_millis(5)),
        });
        h.script.push_answer(PASSED);

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        assert_eq!(result.outcome.verdict, Verdict::Passed);
        let logs = h.store.logs_for_run("r1", None, None).unwrap();
        assert!(logs.iter().any(|e| e.event_type == LogEventType::LlmRetry));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_withdraws_confirmation() {
        let h = harness(ExecutionMode::SemiAutomatic, 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        *h.sink.required.lock().unwrap() = Some(tx);
        h.script.push_tool_call("delete_user", json!({"id": 7}));

        let control = h.ctx.control.clone();
        let waiter = tokio::spawn(async move {
            let id = rx.recv().await.unwrap();
            control.cancel();
            id
        });

        let result = execute_test_case(&h.ctx, &h.case, &h.record).await.unwrap();
        let id = waiter.await.unwrap();

        assert_eq!(result.stopped, Some(StopReason::Cancelled));
        assert_eq!(result.outcome.verdict, Verdict::Skipped);
        assert_eq!(result.outcome.reason, RUN_CANCELLED);
        assert_eq!(h.ctx.gate.get(&id).unwrap().status, ConfirmationStatus::Expired);
        assert_eq!(h.transport.call_count(), 0);
    }
}
