//! End-to-end run scenarios through the public queue and gate APIs, with a
//! scripted model and a mock target system.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use auditrun::config::EngineConfig;
use auditrun::engine::executor::{RUN_TIMED_OUT, STEP_BUDGET_EXCEEDED};
use auditrun::gate::{run_sweeper, ConfirmationGate, GateError};
use auditrun::journal::RunJournal;
use auditrun::llm::{LlmAdapter, LlmSettings, ProviderKind, ScriptedLlm};
use auditrun::model::{
    AuditRun, AuditSession, ConfirmationDecision, ConfirmationFilter, ConfirmationKind,
    ConfirmationRequest, ConfirmationResponse, ConfirmationStatus, ExecutionMode, LogEventType,
    ProposedAction, RunConfiguration, RunRequest, TestCase, TestExecutionRecord, TestStatus,
    Verdict,
};
use auditrun::queue::{LlmSource, QueueHandle, QueueManager};
use auditrun::run::RunStatus;
use auditrun::storage::Store;
use auditrun::transport::MockTransport;

const PASSED: &str = r#"{"verdict": "PASSED", "confidence": 0.9, "reasoning": "matches the expected result"}"#;
const FAILED: &str = r#"{"verdict": "FAILED", "confidence": 0.7, "reasoning": "action was not allowed"}"#;

struct Engine {
    queue: QueueHandle,
    gate: Arc<ConfirmationGate>,
    script: ScriptedLlm,
    transport: Arc<MockTransport>,
    _sweeper: CancellationToken,
}

struct Setup {
    cases: usize,
    max_steps: Option<u32>,
    confirmation_ttl: Duration,
    run_timeout_sec: Option<u64>,
    test_case_timeout_sec: Option<u64>,
    /// Time the scripted model takes per reply.
    llm_delay: Option<Duration>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            cases: 3,
            max_steps: Some(8),
            confirmation_ttl: Duration::from_secs(60),
            run_timeout_sec: None,
            test_case_timeout_sec: None,
            llm_delay: None,
        }
    }
}

async fn start(setup: Setup) -> Engine {
    let store = Store::in_memory().unwrap();
    store
        .upsert_session(&AuditSession {
            id: "session-1".into(),
            name: "Access control review".into(),
            active: true,
        })
        .unwrap();
    store
        .upsert_config(&RunConfiguration {
            id: "config-1".into(),
            name: "rehearsal".into(),
            low_risk: false,
            max_steps: setup.max_steps,
            run_timeout_sec: setup.run_timeout_sec,
            llm: LlmSettings {
                provider: ProviderKind::Scripted,
                ..LlmSettings::default()
            },
        })
        .unwrap();
    for i in 0..setup.cases {
        store
            .upsert_test_case(&TestCase {
                id: format!("tc-{}", i),
                session_id: "session-1".into(),
                position: i as u32,
                title: format!("control {}", i + 1),
                preconditions: vec!["audit account is provisioned".into()],
                steps: vec!["exercise the control".into()],
                expected_result: "the control holds".into(),
                enabled: true,
            })
            .unwrap();
    }

    let mut config = EngineConfig::default();
    config.queue.max_concurrent_runs = 1;
    config.execution.retry_backoff_ms = 1;
    config.execution.test_case_timeout_sec = setup.test_case_timeout_sec;

    let journal = RunJournal::new(store.clone());
    let gate = Arc::new(ConfirmationGate::new(
        store.clone(),
        journal.clone(),
        setup.confirmation_ttl,
    ));
    let sweeper = CancellationToken::new();
    tokio::spawn(run_sweeper(
        gate.clone(),
        Duration::from_millis(20),
        sweeper.clone(),
    ));

    let transport = Arc::new(
        MockTransport::new()
            .with_tool("read_config", "Read a configuration value", false)
            .with_tool("delete_user", "Delete a user account", false)
            .with_default_result(json!({"ok": true})),
    );
    let script = ScriptedLlm::default();
    let model = match setup.llm_delay {
        Some(delay) => script.clone().with_delay(delay),
        None => script.clone(),
    };
    let (queue, _) = QueueManager::new(
        store,
        gate.clone(),
        transport.clone(),
        LlmSource::Fixed(LlmAdapter::Scripted(model)),
        config,
        journal,
    )
    .start()
    .await
    .unwrap();

    Engine {
        queue,
        gate,
        script,
        transport,
        _sweeper: sweeper,
    }
}

impl Engine {
    async fn enqueue(&self) -> AuditRun {
        self.queue
            .enqueue(RunRequest {
                session_id: "session-1".into(),
                config_id: "config-1".into(),
                mode: ExecutionMode::SemiAutomatic,
                supervisor: Some("alice".into()),
            })
            .await
            .unwrap()
    }

    async fn wait_for(&self, run_id: &str, status: RunStatus) -> AuditRun {
        for _ in 0..500 {
            let run = self.queue.get(run_id).unwrap();
            if run.status == status {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never reached {}", run_id, status);
    }

    async fn wait_idle(&self) {
        for _ in 0..500 {
            if self.queue.snapshot().await.unwrap().active == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never went idle");
    }

    fn pending(&self, run_id: &str) -> Vec<ConfirmationRequest> {
        self.gate
            .list(&ConfirmationFilter {
                run_id: Some(run_id.to_string()),
                status: Some(ConfirmationStatus::Pending),
            })
            .unwrap()
    }

    fn status_trail(&self, run_id: &str) -> Vec<String> {
        self.queue
            .logs(run_id, None, None)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == LogEventType::StatusChanged)
            .map(|e| e.metadata["to"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

fn assert_contiguous(records: &[TestExecutionRecord]) {
    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, index as u32, "sequence gap in {:?}", records);
    }
}

fn assert_counters_match(run: &AuditRun, records: &[TestExecutionRecord]) {
    let count = |status: TestStatus| records.iter().filter(|r| r.status == status).count() as u32;
    let terminal = records.iter().filter(|r| r.status.is_terminal()).count() as u32;

    assert_eq!(run.counters.completed, terminal);
    assert_eq!(run.counters.passed, count(TestStatus::Passed));
    assert_eq!(run.counters.failed, count(TestStatus::Failed));
    assert_eq!(
        run.counters.blocked,
        count(TestStatus::Blocked) + count(TestStatus::Error)
    );
    assert_eq!(run.counters.skipped, count(TestStatus::Skipped));
    assert!(run.counters.completed <= run.counters.total);
}

#[tokio::test]
async fn test_confirmation_round_trip_in_semi_automatic_run() {
    let engine = start(Setup::default()).await;
    engine.script.push_answer(PASSED);
    engine
        .script
        .push_tool_call("delete_user", json!({"user": "temp-auditor"}));
    engine.script.push_answer(PASSED);
    engine.script.push_answer(PASSED);

    let run = engine.enqueue().await;
    engine.wait_for(&run.id, RunStatus::WaitingConfirmation).await;

    let pending = engine.pending(&run.id);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ConfirmationKind::Destructive);
    assert_eq!(pending[0].action.tool, "delete_user");
    assert!(engine.transport.calls().is_empty());

    let resolved = engine
        .gate
        .resolve(
            &pending[0].id,
            ConfirmationResponse {
                decision: ConfirmationDecision::Approve,
                responder: Some("alice".into()),
                note: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, ConfirmationStatus::Approved);

    let run = engine.wait_for(&run.id, RunStatus::Completed).await;
    let records = engine.queue.executions(&run.id).unwrap();
    assert_eq!(records.len(), 3);
    assert_contiguous(&records);
    assert_counters_match(&run, &records);
    assert_eq!(run.counters.passed, 3);
    assert_eq!(records[1].verdict, Some(Verdict::Passed));
    assert_eq!(records[1].tool_calls, 1);

    let calls = engine.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments, json!({"user": "temp-auditor"}));

    assert_eq!(
        engine.status_trail(&run.id),
        vec![
            "INITIALIZING",
            "RUNNING",
            "WAITING_CONFIRMATION",
            "RUNNING",
            "COMPLETED"
        ]
    );
}

#[tokio::test]
async fn test_step_budget_blocks_case_and_loop_moves_on() {
    let engine = start(Setup {
        cases: 2,
        max_steps: Some(2),
        ..Setup::default()
    })
    .await;
    engine.script.push_tool_call("read_config", json!({"key": "mfa"}));
    engine.script.push_tool_call("read_config", json!({"key": "mfa.admins"}));
    // the budget check stops case 1 before a third decision is requested
    engine.script.push_answer(PASSED);

    let run = engine.enqueue().await;
    let run = engine.wait_for(&run.id, RunStatus::Completed).await;

    let records = engine.queue.executions(&run.id).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, TestStatus::Blocked);
    assert_eq!(records[0].reason.as_deref(), Some(STEP_BUDGET_EXCEEDED));
    assert!(records[0].current_step <= records[0].total_steps);
    assert_eq!(records[1].status, TestStatus::Passed);
    assert_counters_match(&run, &records);
    assert_eq!(engine.script.remaining(), 0);
    assert_eq!(engine.transport.call_count(), 2);
}

#[tokio::test]
async fn test_case_time_budget_cuts_off_case_and_loop_moves_on() {
    let engine = start(Setup {
        cases: 2,
        max_steps: Some(50),
        test_case_timeout_sec: Some(1),
        llm_delay: Some(Duration::from_millis(300)),
        ..Setup::default()
    })
    .await;
    // case 0 runs out of time before it gets past the third call
    for _ in 0..3 {
        engine.script.push_tool_call("read_config", json!({"key": "audit.retention"}));
    }
    engine.script.push_answer(PASSED);

    let run = engine.enqueue().await;
    let run = engine.wait_for(&run.id, RunStatus::Completed).await;

    let records = engine.queue.executions(&run.id).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, TestStatus::Blocked);
    assert_eq!(records[0].reason.as_deref(), Some(STEP_BUDGET_EXCEEDED));
    assert!(records[0].duration_ms.unwrap() < 1_500);
    assert_eq!(records[1].status, TestStatus::Passed);
    assert_counters_match(&run, &records);
    assert_eq!(engine.script.remaining(), 0);
}

#[tokio::test]
async fn test_run_wall_clock_budget_times_out_run() {
    let engine = start(Setup {
        cases: 2,
        max_steps: Some(50),
        run_timeout_sec: Some(1),
        llm_delay: Some(Duration::from_millis(300)),
        ..Setup::default()
    })
    .await;
    for _ in 0..20 {
        engine.script.push_tool_call("read_config", json!({"key": "audit.retention"}));
    }

    let run = engine.enqueue().await;
    let run = engine.wait_for(&run.id, RunStatus::Timeout).await;
    assert_eq!(run.failure_reason.as_deref(), Some(RUN_TIMED_OUT));
    assert!(run.completed_at.is_some());

    let records = engine.queue.executions(&run.id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TestStatus::Blocked);
    assert_eq!(records[0].reason.as_deref(), Some(RUN_TIMED_OUT));
    assert!(records[0].current_step < 20);

    engine.wait_idle().await;
    assert_eq!(
        engine.status_trail(&run.id),
        vec!["INITIALIZING", "RUNNING", "TIMEOUT"]
    );
}

#[tokio::test]
async fn test_cancel_paused_run_is_immediate() {
    let engine = start(Setup {
        cases: 2,
        ..Setup::default()
    })
    .await;
    engine.script.push_tool_call("delete_user", json!({"user": "bob"}));

    let run = engine.enqueue().await;
    engine.wait_for(&run.id, RunStatus::WaitingConfirmation).await;

    let paused = engine.queue.pause(&run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);

    let cancelled = engine.queue.cancel(&run.id, Some("alice")).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(cancelled.failure_reason.as_deref(), Some("cancelled by alice"));

    engine.wait_idle().await;
    let run = engine.queue.get(&run.id).unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    // Only the interrupted record exists; the second case never started
    let records = engine.queue.executions(&run.id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TestStatus::Skipped);
    assert_counters_match(&run, &records);
    assert!(engine.pending(&run.id).is_empty());
    assert!(engine.transport.calls().is_empty());
}

#[tokio::test]
async fn test_second_pending_confirmation_is_rejected() {
    let engine = start(Setup {
        cases: 1,
        ..Setup::default()
    })
    .await;
    engine.script.push_tool_call("delete_user", json!({"user": "carol"}));
    engine.script.push_answer(FAILED);

    let run = engine.enqueue().await;
    engine.wait_for(&run.id, RunStatus::WaitingConfirmation).await;

    let err = engine
        .gate
        .request(
            &run.id,
            None,
            ConfirmationKind::Privileged,
            ProposedAction {
                tool: "grant_admin".into(),
                arguments: json!({"user": "carol"}),
                reasoning: None,
            },
            "second request",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AlreadyPending(_)));
    assert_eq!(engine.pending(&run.id).len(), 1);

    let first = engine.pending(&run.id).remove(0);
    let response = || ConfirmationResponse {
        decision: ConfirmationDecision::Reject,
        responder: Some("alice".into()),
        note: Some("not on production".into()),
    };
    engine.gate.resolve(&first.id, response()).await.unwrap();
    let again = engine.gate.resolve(&first.id, response()).await.unwrap_err();
    assert!(matches!(again, GateError::Conflict { .. }));

    let run = engine.wait_for(&run.id, RunStatus::Completed).await;
    assert_eq!(run.counters.failed, 1);
    assert!(engine.transport.calls().is_empty());

    // The rejection reached the model as an observation
    let last_request = engine.script.requests().pop().unwrap();
    assert!(last_request
        .iter()
        .any(|m| m.content.contains("rejected by alice: not on production")));
}

#[tokio::test]
async fn test_expired_confirmation_is_fed_back_to_the_model() {
    let engine = start(Setup {
        cases: 1,
        confirmation_ttl: Duration::from_millis(100),
        ..Setup::default()
    })
    .await;
    engine.script.push_tool_call("delete_user", json!({"user": "dave"}));
    engine.script.push_answer(FAILED);

    let run = engine.enqueue().await;
    let run = engine.wait_for(&run.id, RunStatus::Completed).await;

    let confirmations = engine
        .gate
        .list(&ConfirmationFilter {
            run_id: Some(run.id.clone()),
            status: None,
        })
        .unwrap();
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].status, ConfirmationStatus::Expired);
    assert!(engine.transport.calls().is_empty());

    let last_request = engine.script.requests().pop().unwrap();
    assert!(last_request.iter().any(|m| m.content.contains("expired")));
    assert_eq!(run.counters.failed, 1);
}
