//! Restart recovery.
//!
//! PENDING runs go back on the queue in creation order. Runs that held a slot
//! when the process stopped are resumed at their first unfinished test case
//! if their persisted context still adds up, and failed otherwise. Pending
//! confirmations from before the restart are expired either way; nobody is
//! waiting on them any more.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::Actor;
use crate::model::{AuditRun, LogEventType, LogLevel, RunLogEntry};
use crate::run::{RunControl, RunEvent, RunStatus};

const INTERRUPTED: [RunStatus; 4] = [
    RunStatus::Initializing,
    RunStatus::Running,
    RunStatus::WaitingConfirmation,
    RunStatus::Paused,
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// PENDING runs put back on the queue.
    pub requeued: Vec<String>,
    /// Interrupted runs re-attached to a new driver.
    pub resumed: Vec<String>,
    /// Interrupted runs whose context could not be rebuilt.
    pub failed: Vec<String>,
    pub expired_confirmations: usize,
}

impl Actor {
    pub(super) async fn recover(&mut self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for run in self.shared.store.runs_with_status(&[RunStatus::Pending])? {
            self.pending.push_back(run.id.clone());
            report.requeued.push(run.id);
        }

        for run in self.shared.store.runs_with_status(&INTERRUPTED)? {
            if self
                .shared
                .gate
                .expire_stale_for_run(&run.id, "engine restarted")
                .await?
            {
                report.expired_confirmations += 1;
            }

            match self.resume_point(&run)? {
                Ok(start_at) => {
                    self.reattach(run.clone(), start_at).await?;
                    report.resumed.push(run.id);
                }
                Err(reason) => {
                    warn!(run_id = %run.id, %reason, "run cannot be recovered");
                    self.shared
                        .journal
                        .record(
                            RunLogEntry::new(
                                &run.id,
                                LogEventType::RecoveryFailed,
                                format!("recovery failed: {}", reason),
                            )
                            .with_level(LogLevel::Error)
                            .with_metadata(json!({"status": run.status, "reason": reason})),
                        )
                        .await?;
                    self.transition(&run.id, RunEvent::Fail, Some(&format!("recovery failed: {}", reason)))
                        .await?;
                    report.failed.push(run.id);
                }
            }
        }

        Ok(report)
    }

    /// The sequence number to resume at, or why the run cannot be resumed.
    fn resume_point(&self, run: &AuditRun) -> Result<Result<u32, String>> {
        let store = &self.shared.store;

        if store.get_config(&run.config_id)?.is_none() {
            return Ok(Err(format!("run configuration {} no longer exists", run.config_id)));
        }
        if store.get_session(&run.session_id)?.is_none() {
            return Ok(Err(format!("session {} no longer exists", run.session_id)));
        }
        let cases = store.test_cases_for_session(&run.session_id)?;
        if cases.len() as u32 != run.counters.total {
            return Ok(Err(format!(
                "session has {} test cases, run expects {}",
                cases.len(),
                run.counters.total
            )));
        }

        let records = store.executions_for_run(&run.id)?;
        let mut finished = 0u32;
        for (index, record) in records.iter().enumerate() {
            if record.sequence != index as u32 {
                return Ok(Err(format!(
                    "execution sequence has a gap at {} (found {})",
                    index, record.sequence
                )));
            }
            if record.status.is_terminal() {
                if finished != index as u32 {
                    return Ok(Err(format!(
                        "finished record {} follows an unfinished one",
                        record.sequence
                    )));
                }
                finished += 1;
            } else if index + 1 != records.len() {
                return Ok(Err(format!(
                    "unfinished record {} is not the last one",
                    record.sequence
                )));
            }
        }

        if finished != run.counters.completed {
            return Ok(Err(format!(
                "counters report {} completed but {} records are finished",
                run.counters.completed, finished
            )));
        }
        if finished > run.counters.total {
            return Ok(Err("more records than test cases".to_string()));
        }
        Ok(Ok(finished))
    }

    async fn reattach(&mut self, run: AuditRun, start_at: u32) -> Result<()> {
        // The confirmation it was waiting on has just been expired
        let run = if run.status == RunStatus::WaitingConfirmation {
            self.transition(&run.id, RunEvent::ConfirmationResolved, None)
                .await?
        } else {
            run
        };

        let elapsed = run
            .started_at
            .and_then(|started| (Utc::now() - started).to_std().ok());
        let deadline = self.deadline_for(&run, elapsed);
        let control = if run.status == RunStatus::Paused {
            RunControl::paused(deadline)
        } else {
            RunControl::new(deadline)
        };

        self.shared
            .journal
            .record(
                RunLogEntry::new(
                    &run.id,
                    LogEventType::RecoveryResumed,
                    format!(
                        "resuming {} run at test case {} of {}",
                        run.status,
                        start_at + 1,
                        run.counters.total
                    ),
                )
                .with_metadata(json!({"status": run.status, "start_at": start_at})),
            )
            .await?;

        info!(run_id = %run.id, status = %run.status, start_at, "run recovered");
        self.spawn_driver(run, start_at, control);
        Ok(())
    }
}
