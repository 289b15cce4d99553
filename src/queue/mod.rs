//! Execution queue: the process-wide service that owns run status.
//!
//! One actor task holds the FIFO of pending runs and the table of active
//! ones. Callers talk to it through a [`QueueHandle`]; run drivers report
//! progress over the same channel. Because every status write goes through the
//! actor, a compare-and-set failure means the database was changed from
//! outside the engine.

mod driver;
mod recovery;

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::ConfirmationPolicy;
use crate::error::{EngineError, EngineResult};
use crate::gate::ConfirmationGate;
use crate::journal::RunJournal;
use crate::llm::LlmAdapter;
use crate::model::{
    AuditRun, ExecutionMode, LogEventType, LogLevel, RunCounters, RunFilter, RunLogEntry,
    RunRequest, TestExecutionRecord,
};
use crate::run::{RunControl, RunEvent, RunStatus};
use crate::storage::Store;
use crate::transport::ToolTransport;

use self::driver::RunDriver;
pub use self::recovery::RecoveryReport;

/// Where a run's model client comes from.
#[derive(Clone)]
pub enum LlmSource {
    /// Built per run from the run configuration's `LlmSettings`.
    FromRunConfig,
    /// Shared by every run (tests, offline rehearsals).
    Fixed(LlmAdapter),
}

/// Active and waiting run counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub active: usize,
    pub pending: usize,
    pub max_concurrent: usize,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// How a driver task ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DriverOutcome {
    Completed,
    Cancelled,
    TimedOut,
    Failed(String),
}

/// Progress reported by run drivers.
#[derive(Debug)]
pub(crate) enum LoopEvent {
    SetupComplete {
        run_id: String,
    },
    ConfirmationRequired {
        run_id: String,
        confirmation_id: String,
    },
    ConfirmationResolved {
        run_id: String,
        confirmation_id: String,
    },
    Finished {
        run_id: String,
        outcome: DriverOutcome,
    },
}

pub(crate) enum Command {
    Enqueue {
        request: RunRequest,
        reply: oneshot::Sender<EngineResult<AuditRun>>,
    },
    Cancel {
        run_id: String,
        actor: Option<String>,
        reply: oneshot::Sender<EngineResult<AuditRun>>,
    },
    Pause {
        run_id: String,
        reply: oneshot::Sender<EngineResult<AuditRun>>,
    },
    Resume {
        run_id: String,
        reply: oneshot::Sender<EngineResult<AuditRun>>,
    },
    Delete {
        run_id: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Event(LoopEvent),
}

// ---------------------------------------------------------------------------
// QueueManager
// ---------------------------------------------------------------------------

/// Dependencies shared by the actor and every run driver.
pub(crate) struct Shared {
    pub store: Store,
    pub gate: Arc<ConfirmationGate>,
    pub transport: Arc<dyn ToolTransport>,
    pub llm: LlmSource,
    pub config: EngineConfig,
    pub journal: RunJournal,
    pub policy: ConfirmationPolicy,
}

pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    pub fn new(
        store: Store,
        gate: Arc<ConfirmationGate>,
        transport: Arc<dyn ToolTransport>,
        llm: LlmSource,
        config: EngineConfig,
        journal: RunJournal,
    ) -> Self {
        let policy = ConfirmationPolicy::new(config.confirmation.rules.clone());
        Self {
            shared: Arc::new(Shared {
                store,
                gate,
                transport,
                llm,
                config,
                journal,
                policy,
            }),
        }
    }

    /// Recover persisted runs, then start the actor.
    pub async fn start(self) -> anyhow::Result<(QueueHandle, RecoveryReport)> {
        let buffer = self.shared.config.queue.command_buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);

        let mut actor = Actor {
            shared: self.shared.clone(),
            rx,
            tx: tx.clone(),
            pending: VecDeque::new(),
            active: HashMap::new(),
            shutting_down: false,
        };
        let report = actor.recover().await?;
        actor.admit().await;
        tokio::spawn(actor.run());

        info!(
            requeued = report.requeued.len(),
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            "run queue started"
        );

        let handle = QueueHandle {
            tx,
            store: self.shared.store.clone(),
        };
        Ok((handle, report))
    }
}

// ---------------------------------------------------------------------------
// QueueHandle
// ---------------------------------------------------------------------------

/// Cloneable front end of the queue. Reads go straight to storage; anything
/// that changes a run goes through the actor.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Command>,
    store: Store,
}

impl QueueHandle {
    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::QueueClosed)?;
        rx.await.map_err(|_| EngineError::QueueClosed)
    }

    pub async fn enqueue(&self, request: RunRequest) -> EngineResult<AuditRun> {
        self.ask(|reply| Command::Enqueue { request, reply }).await?
    }

    pub async fn cancel(&self, run_id: &str, actor: Option<&str>) -> EngineResult<AuditRun> {
        let run_id = run_id.to_string();
        let actor = actor.map(str::to_string);
        self.ask(|reply| Command::Cancel {
            run_id,
            actor,
            reply,
        })
        .await?
    }

    pub async fn pause(&self, run_id: &str) -> EngineResult<AuditRun> {
        let run_id = run_id.to_string();
        self.ask(|reply| Command::Pause { run_id, reply }).await?
    }

    pub async fn resume(&self, run_id: &str) -> EngineResult<AuditRun> {
        let run_id = run_id.to_string();
        self.ask(|reply| Command::Resume { run_id, reply }).await?
    }

    /// Delete a terminal run and its records.
    pub async fn delete(&self, run_id: &str) -> EngineResult<()> {
        let run_id = run_id.to_string();
        self.ask(|reply| Command::Delete { run_id, reply }).await?
    }

    pub async fn snapshot(&self) -> EngineResult<QueueSnapshot> {
        self.ask(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the actor. Active drivers are aborted and their runs stay in
    /// their persisted state for recovery on the next start.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.ask(|reply| Command::Shutdown { reply }).await
    }

    pub fn get(&self, run_id: &str) -> EngineResult<AuditRun> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))
    }

    pub fn list(&self, filter: &RunFilter) -> EngineResult<Vec<AuditRun>> {
        Ok(self.store.list_runs(filter)?)
    }

    pub fn executions(&self, run_id: &str) -> EngineResult<Vec<TestExecutionRecord>> {
        self.get(run_id)?;
        Ok(self.store.executions_for_run(run_id)?)
    }

    pub fn logs(
        &self,
        run_id: &str,
        after_id: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<RunLogEntry>> {
        self.get(run_id)?;
        Ok(self.store.logs_for_run(run_id, after_id, limit)?)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct ActiveRun {
    control: RunControl,
    task: JoinHandle<()>,
    /// Confirmation the driver is blocked on, if any.
    waiting_on: Option<String>,
}

pub(crate) struct Actor {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::Sender<Command>,
    pending: VecDeque<String>,
    active: HashMap<String, ActiveRun>,
    shutting_down: bool,
}

impl Actor {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Enqueue { request, reply } => {
                    let result = self.enqueue(request).await;
                    let _ = reply.send(result);
                    self.admit().await;
                }
                Command::Cancel {
                    run_id,
                    actor,
                    reply,
                } => {
                    let _ = reply.send(self.cancel(&run_id, actor.as_deref()).await);
                }
                Command::Pause { run_id, reply } => {
                    let _ = reply.send(self.pause(&run_id).await);
                }
                Command::Resume { run_id, reply } => {
                    let _ = reply.send(self.resume(&run_id).await);
                }
                Command::Delete { run_id, reply } => {
                    let _ = reply.send(self.delete(&run_id));
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Command::Event(event) => {
                    if let Err(e) = self.on_event(event).await {
                        error!(error = %e, "failed to apply run event");
                    }
                    self.admit().await;
                }
            }
        }
        debug!("run queue actor stopped");
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            active: self.active.len(),
            pending: self.pending.len(),
            max_concurrent: self.shared.config.queue.max_concurrent_runs,
        }
    }

    /// Abort every driver and wait until each task has stopped, so nothing
    /// touches the target or the database after the reply.
    async fn shutdown(&mut self) {
        self.shutting_down = true;
        let tasks: Vec<_> = self
            .active
            .drain()
            .map(|(run_id, active)| {
                debug!(%run_id, "aborting run driver for shutdown");
                active.task.abort();
                active.task
            })
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "run driver panicked during shutdown");
                }
            }
        }
        info!(pending = self.pending.len(), "run queue shut down");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn enqueue(&mut self, request: RunRequest) -> EngineResult<AuditRun> {
        let total = self.validate(&request)?;

        let run = AuditRun {
            id: Uuid::new_v4().to_string(),
            session_id: request.session_id,
            config_id: request.config_id,
            mode: request.mode,
            status: RunStatus::Pending,
            counters: RunCounters::new(total),
            created_at: Utc::now(),
            started_at: None,
            estimated_completion: None,
            completed_at: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            estimated_cost_usd: 0.0,
            supervisor: request.supervisor,
            failure_reason: None,
        };
        self.shared.store.insert_run(&run)?;
        self.shared
            .journal
            .record(
                RunLogEntry::new(
                    &run.id,
                    LogEventType::RunCreated,
                    format!("run created with {} test cases in {} mode", total, run.mode),
                )
                .with_metadata(json!({
                    "session_id": run.session_id,
                    "config_id": run.config_id,
                    "mode": run.mode,
                    "supervisor": run.supervisor,
                })),
            )
            .await?;

        info!(run_id = %run.id, mode = %run.mode, total, "run enqueued");
        self.pending.push_back(run.id.clone());
        Ok(run)
    }

    /// Fail-fast checks; returns the number of test cases.
    fn validate(&self, request: &RunRequest) -> EngineResult<u32> {
        let store = &self.shared.store;

        let session = store
            .get_session(&request.session_id)?
            .ok_or_else(|| EngineError::Config(format!("session {} does not exist", request.session_id)))?;
        if !session.active {
            return Err(EngineError::Config(format!(
                "session {} is not active",
                session.id
            )));
        }

        let config = store
            .get_config(&request.config_id)?
            .ok_or_else(|| {
                EngineError::Config(format!("run configuration {} does not exist", request.config_id))
            })?;

        let cases = store.test_cases_for_session(&session.id)?;
        if cases.is_empty() {
            return Err(EngineError::Config(format!(
                "session {} has no test cases",
                session.id
            )));
        }

        if request.mode == ExecutionMode::Automatic && !config.low_risk {
            return Err(EngineError::Config(format!(
                "AUTOMATIC mode requires a low-risk configuration; {} is not",
                config.id
            )));
        }

        if let LlmSource::FromRunConfig = self.shared.llm {
            LlmAdapter::from_settings(&config.llm)
                .map_err(|e| EngineError::Config(format!("LLM settings are unusable: {}", e)))?;
        }

        Ok(cases.len() as u32)
    }

    async fn cancel(&mut self, run_id: &str, actor: Option<&str>) -> EngineResult<AuditRun> {
        let reason = match actor {
            Some(who) => format!("cancelled by {}", who),
            None => "cancelled".to_string(),
        };
        let run = self.transition(run_id, RunEvent::Cancel, Some(&reason)).await?;

        self.pending.retain(|id| id != run_id);
        if let Some(active) = self.active.get(run_id) {
            active.control.cancel();
        }
        Ok(run)
    }

    async fn pause(&mut self, run_id: &str) -> EngineResult<AuditRun> {
        let run = self.transition(run_id, RunEvent::Pause, None).await?;
        if let Some(active) = self.active.get(run_id) {
            active.control.pause();
        }
        Ok(run)
    }

    async fn resume(&mut self, run_id: &str) -> EngineResult<AuditRun> {
        let mut run = self.transition(run_id, RunEvent::Resume, None).await?;
        if let Some(active) = self.active.get(run_id) {
            active.control.resume();
            if active.waiting_on.is_some() {
                run = self
                    .transition(run_id, RunEvent::ConfirmationRequired, None)
                    .await?;
            }
        }
        Ok(run)
    }

    fn delete(&mut self, run_id: &str) -> EngineResult<()> {
        let run = self
            .shared
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
        if !run.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "run {} is {}; only finished runs can be deleted",
                run_id, run.status
            )));
        }
        if self.active.contains_key(run_id) {
            return Err(EngineError::Conflict(format!(
                "run {} is still winding down",
                run_id
            )));
        }
        if !self.shared.store.delete_terminal_run(run_id)? {
            return Err(EngineError::Conflict(format!("run {} changed concurrently", run_id)));
        }
        info!(%run_id, "run deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Driver events
    // -----------------------------------------------------------------------

    async fn on_event(&mut self, event: LoopEvent) -> EngineResult<()> {
        match event {
            LoopEvent::SetupComplete { run_id } => {
                if self.status_of(&run_id)? == RunStatus::Initializing {
                    self.transition(&run_id, RunEvent::SetupComplete, None).await?;
                }
            }
            LoopEvent::ConfirmationRequired {
                run_id,
                confirmation_id,
            } => {
                if let Some(active) = self.active.get_mut(&run_id) {
                    active.waiting_on = Some(confirmation_id);
                }
                // A paused run moves to WAITING_CONFIRMATION on resume
                if self.status_of(&run_id)? == RunStatus::Running {
                    self.transition(&run_id, RunEvent::ConfirmationRequired, None)
                        .await?;
                }
            }
            LoopEvent::ConfirmationResolved {
                run_id,
                confirmation_id,
            } => {
                if let Some(active) = self.active.get_mut(&run_id) {
                    if active.waiting_on.as_deref() == Some(confirmation_id.as_str()) {
                        active.waiting_on = None;
                    }
                }
                if self.status_of(&run_id)? == RunStatus::WaitingConfirmation {
                    self.transition(&run_id, RunEvent::ConfirmationResolved, None)
                        .await?;
                }
            }
            LoopEvent::Finished { run_id, outcome } => {
                self.active.remove(&run_id);
                self.finish(&run_id, outcome).await?;
            }
        }
        Ok(())
    }

    async fn finish(&mut self, run_id: &str, outcome: DriverOutcome) -> EngineResult<()> {
        let status = self.status_of(run_id)?;
        if status.is_terminal() {
            debug!(%run_id, %status, "driver finished after run reached a terminal state");
            return Ok(());
        }

        match outcome {
            DriverOutcome::Completed => {
                self.transition(run_id, RunEvent::Complete, None).await?;
            }
            DriverOutcome::Cancelled => {
                self.transition(run_id, RunEvent::Cancel, Some("cancelled")).await?;
            }
            DriverOutcome::TimedOut => {
                self.transition(
                    run_id,
                    RunEvent::TimedOut,
                    Some(crate::engine::executor::RUN_TIMED_OUT),
                )
                .await?;
            }
            DriverOutcome::Failed(reason) => {
                self.shared
                    .journal
                    .record(
                        RunLogEntry::new(run_id, LogEventType::RunFailed, format!("run failed: {}", reason))
                            .with_level(LogLevel::Error)
                            .with_metadata(json!({"error": reason})),
                    )
                    .await?;
                self.transition(run_id, RunEvent::Fail, Some(&reason)).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Start pending runs, oldest first, while slots are free.
    async fn admit(&mut self) {
        let ceiling = self.shared.config.queue.max_concurrent_runs;
        while !self.shutting_down && self.active.len() < ceiling {
            let Some(run_id) = self.pending.pop_front() else {
                break;
            };
            match self.transition(&run_id, RunEvent::Admit, None).await {
                Ok(run) => {
                    let control = RunControl::new(self.deadline_for(&run, None));
                    self.spawn_driver(run, 0, control);
                }
                Err(EngineError::Storage(e)) => {
                    warn!(%run_id, error = %e, "storage error while admitting run, keeping it queued");
                    self.pending.push_front(run_id);
                    break;
                }
                Err(e) => self.reject(&run_id, e).await,
            }
        }
    }

    /// Fail a run that can no longer be admitted so it does not sit PENDING
    /// with no queue entry.
    async fn reject(&mut self, run_id: &str, cause: EngineError) {
        warn!(%run_id, error = %cause, "could not admit run");
        match self.status_of(run_id) {
            Ok(status) if status.is_terminal() => {
                debug!(%run_id, %status, "run already finished outside the queue");
            }
            Ok(_) => {
                let reason = format!("could not be admitted: {}", cause);
                if let Err(e) = self.transition(run_id, RunEvent::Fail, Some(&reason)).await {
                    error!(%run_id, error = %e, "failed to mark unadmittable run as failed");
                }
            }
            Err(e) => error!(%run_id, error = %e, "unadmittable run is unreadable"),
        }
    }

    fn run_deadline(&self, elapsed: Option<Duration>) -> Option<Instant> {
        let budget = self.shared.config.queue.run_timeout_sec;
        if budget == 0 {
            return None;
        }
        let budget = Duration::from_secs(budget).saturating_sub(elapsed.unwrap_or_default());
        Some(Instant::now() + budget)
    }

    /// Per-run budget override from the run configuration.
    fn deadline_for(&self, run: &AuditRun, elapsed: Option<Duration>) -> Option<Instant> {
        let override_sec = self
            .shared
            .store
            .get_config(&run.config_id)
            .ok()
            .flatten()
            .and_then(|c| c.run_timeout_sec);
        match override_sec {
            Some(0) => None,
            Some(sec) => {
                Some(Instant::now() + Duration::from_secs(sec).saturating_sub(elapsed.unwrap_or_default()))
            }
            None => self.run_deadline(elapsed),
        }
    }

    pub(crate) fn spawn_driver(&mut self, run: AuditRun, start_at: u32, control: RunControl) {
        let run_id = run.id.clone();
        let driver = RunDriver::new(self.shared.clone(), run, control.clone(), self.tx.clone(), start_at);
        let events = self.tx.clone();
        let task_run_id = run_id.clone();

        let task = tokio::spawn(async move {
            // A panic fails the run instead of leaking its slot
            let outcome = match AssertUnwindSafe(driver.run()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => DriverOutcome::Failed("run driver panicked".to_string()),
            };
            let _ = events
                .send(Command::Event(LoopEvent::Finished {
                    run_id: task_run_id,
                    outcome,
                }))
                .await;
        });

        info!(%run_id, start_at, "run driver started");
        self.active.insert(
            run_id,
            ActiveRun {
                control,
                task,
                waiting_on: None,
            },
        );
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn status_of(&self, run_id: &str) -> EngineResult<RunStatus> {
        self.shared
            .store
            .get_run(run_id)?
            .map(|r| r.status)
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))
    }

    /// Apply `event` through the transition table and persist it as a
    /// compare-and-set, with one journal entry.
    async fn transition(
        &self,
        run_id: &str,
        event: RunEvent,
        reason: Option<&str>,
    ) -> EngineResult<AuditRun> {
        let from = self.status_of(run_id)?;
        let to = from.apply(event)?;

        if !self.shared.store.transition_run(run_id, from, to, reason)? {
            return Err(EngineError::Conflict(format!(
                "run {} changed while applying {:?}",
                run_id, event
            )));
        }
        self.shared
            .journal
            .status_changed(run_id, from, to, reason)
            .await?;

        self.shared
            .store
            .get_run(run_id)?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))
    }
}
