//! Test execution records and the run counters they feed.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_time, parse_opt_time, parse_text, Store};
use crate::model::{ExecutionOutcome, TestExecutionRecord, TestStatus, Verdict};

const EXECUTION_COLUMNS: &str = "id, run_id, test_case_id, sequence, status, verdict,
    confidence, reason, current_step, total_steps, tool_calls, duration_ms,
    started_at, finished_at";

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<TestExecutionRecord> {
    Ok(TestExecutionRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        test_case_id: row.get(2)?,
        sequence: row.get(3)?,
        status: parse_text(4, row.get(4)?)?,
        verdict: row
            .get::<_, Option<String>>(5)?
            .map(|v| parse_text::<Verdict>(5, v))
            .transpose()?,
        confidence: row.get(6)?,
        reason: row.get(7)?,
        current_step: row.get(8)?,
        total_steps: row.get(9)?,
        tool_calls: row.get(10)?,
        duration_ms: row.get::<_, Option<i64>>(11)?.map(|d| d as u64),
        started_at: parse_opt_time(12, row.get(12)?)?,
        finished_at: parse_opt_time(13, row.get(13)?)?,
    })
}

/// Which counter column a terminal status increments.
fn counter_column(status: TestStatus) -> Option<&'static str> {
    match status {
        TestStatus::Passed => Some("passed_count"),
        TestStatus::Failed => Some("failed_count"),
        TestStatus::Blocked | TestStatus::Error => Some("blocked_count"),
        TestStatus::Skipped => Some("skipped_count"),
        TestStatus::NotStarted | TestStatus::Running => None,
    }
}

impl Store {
    /// Open the record for `(run_id, sequence)` and mark it RUNNING.
    ///
    /// A leftover non-terminal record from an interrupted attempt is reset and
    /// reused; a terminal record is never re-executed.
    pub fn begin_execution(
        &self,
        run_id: &str,
        sequence: u32,
        test_case_id: &str,
        total_steps: u32,
    ) -> Result<TestExecutionRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = fmt_time(&Utc::now());

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT id, status FROM test_executions WHERE run_id = ?1 AND sequence = ?2",
                params![run_id, sequence],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let id = match existing {
            Some((id, status)) => {
                let status: TestStatus = status.parse()?;
                if status.is_terminal() {
                    bail!("execution {} of run {} already finished as {}", sequence, run_id, status);
                }
                tx.execute(
                    "UPDATE test_executions SET
                        status = 'RUNNING', test_case_id = ?2, total_steps = ?3,
                        current_step = 0, tool_calls = 0, started_at = ?4
                     WHERE id = ?1",
                    params![id, test_case_id, total_steps, now],
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO test_executions
                        (id, run_id, test_case_id, sequence, status, total_steps, started_at)
                     VALUES (?1, ?2, ?3, ?4, 'RUNNING', ?5, ?6)",
                    params![id, run_id, test_case_id, sequence, total_steps, now],
                )?;
                id
            }
        };

        let record = tx.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM test_executions WHERE id = ?1"),
            params![id],
            execution_from_row,
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Record progress of a RUNNING execution.
    pub fn set_execution_progress(&self, id: &str, current_step: u32, tool_calls: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE test_executions SET current_step = MIN(?2, total_steps), tool_calls = ?3
             WHERE id = ?1 AND status = 'RUNNING'",
            params![id, current_step, tool_calls],
        )?;
        Ok(())
    }

    /// Finalize an execution and bump the run counters in one transaction.
    ///
    /// Fails if the record is already terminal, so counters are never bumped
    /// twice for one test case.
    pub fn finish_execution(
        &self,
        execution_id: &str,
        outcome: &ExecutionOutcome,
        estimated_completion: Option<DateTime<Utc>>,
    ) -> Result<TestExecutionRecord> {
        let status = TestStatus::from(outcome.verdict);
        let Some(column) = counter_column(status) else {
            bail!("{} is not a terminal test status", status);
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = fmt_time(&Utc::now());
        let confidence = outcome.confidence.map(|c| c.clamp(0.0, 1.0));

        let changed = tx.execute(
            "UPDATE test_executions SET
                status = ?2, verdict = ?3, confidence = ?4, reason = ?5,
                current_step = MIN(?6, total_steps), tool_calls = ?7,
                duration_ms = ?8, finished_at = ?9
             WHERE id = ?1 AND status IN ('NOT_STARTED', 'RUNNING')",
            params![
                execution_id,
                status.as_str(),
                outcome.verdict.as_str(),
                confidence,
                outcome.reason,
                outcome.steps,
                outcome.tool_calls,
                outcome.duration_ms as i64,
                now,
            ],
        )?;
        if changed == 0 {
            bail!("execution {} is missing or already finished", execution_id);
        }

        let record = tx.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM test_executions WHERE id = ?1"),
            params![execution_id],
            execution_from_row,
        )?;

        tx.execute(
            &format!(
                "UPDATE audit_runs SET
                    completed_count = completed_count + 1,
                    {column} = {column} + 1,
                    estimated_completion = ?2
                 WHERE id = ?1"
            ),
            params![record.run_id, estimated_completion.as_ref().map(fmt_time)],
        )?;

        tx.commit()?;
        Ok(record)
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<TestExecutionRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM test_executions WHERE id = ?1"),
                params![id],
                execution_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Records of one run ordered by sequence.
    pub fn executions_for_run(&self, run_id: &str) -> Result<Vec<TestExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM test_executions WHERE run_id = ?1 ORDER BY sequence"
        ))?;
        let records = stmt
            .query_map(params![run_id], execution_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
