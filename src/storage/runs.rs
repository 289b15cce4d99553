//! Audit run rows.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{fmt_time, parse_opt_time, parse_text, parse_time, Store};
use crate::model::{AuditRun, RunCounters, RunFilter};
use crate::run::RunStatus;

const RUN_COLUMNS: &str = "id, session_id, config_id, mode, status,
    total_count, completed_count, passed_count, failed_count, blocked_count, skipped_count,
    created_at, started_at, estimated_completion, completed_at,
    prompt_tokens, completion_tokens, estimated_cost_usd, supervisor, failure_reason";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRun> {
    Ok(AuditRun {
        id: row.get(0)?,
        session_id: row.get(1)?,
        config_id: row.get(2)?,
        mode: parse_text(3, row.get(3)?)?,
        status: parse_text(4, row.get(4)?)?,
        counters: RunCounters {
            total: row.get(5)?,
            completed: row.get(6)?,
            passed: row.get(7)?,
            failed: row.get(8)?,
            blocked: row.get(9)?,
            skipped: row.get(10)?,
        },
        created_at: parse_time(11, row.get(11)?)?,
        started_at: parse_opt_time(12, row.get(12)?)?,
        estimated_completion: parse_opt_time(13, row.get(13)?)?,
        completed_at: parse_opt_time(14, row.get(14)?)?,
        prompt_tokens: row.get::<_, i64>(15)? as u64,
        completion_tokens: row.get::<_, i64>(16)? as u64,
        estimated_cost_usd: row.get(17)?,
        supervisor: row.get(18)?,
        failure_reason: row.get(19)?,
    })
}

impl Store {
    pub fn insert_run(&self, run: &AuditRun) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_runs (id, session_id, config_id, mode, status, total_count,
                                     created_at, supervisor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.id,
                run.session_id,
                run.config_id,
                run.mode.as_str(),
                run.status.as_str(),
                run.counters.total,
                fmt_time(&run.created_at),
                run.supervisor,
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<AuditRun>> {
        let conn = self.conn()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM audit_runs WHERE id = ?1"),
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Newest first.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<AuditRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM audit_runs
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR session_id = ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3"
        ))?;
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let runs = stmt
            .query_map(
                params![filter.status.map(|s| s.as_str()), filter.session_id, limit],
                run_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Runs in any of `statuses`, oldest first (FIFO order).
    pub fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<AuditRun>> {
        let conn = self.conn()?;
        let wanted: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let json = serde_json::to_string(&wanted)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM audit_runs
             WHERE status IN (SELECT value FROM json_each(?1))
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let runs = stmt
            .query_map(params![json], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Compare-and-set the run status. Returns `false` when the stored status
    /// is no longer `from`.
    ///
    /// Entering RUNNING stamps `started_at` once; entering a terminal state
    /// stamps `completed_at`. `reason` is kept as the failure reason.
    pub fn transition_run(
        &self,
        id: &str,
        from: RunStatus,
        to: RunStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now = fmt_time(&Utc::now());
        let started = (to == RunStatus::Running).then(|| now.clone());
        let completed = to.is_terminal().then(|| now.clone());

        let changed = conn.execute(
            "UPDATE audit_runs SET
                status = ?3,
                started_at = COALESCE(started_at, ?4),
                completed_at = COALESCE(?5, completed_at),
                failure_reason = COALESCE(?6, failure_reason)
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), started, completed, reason],
        )?;
        Ok(changed == 1)
    }

    /// Delete a run and everything hanging off it. Only terminal runs can be
    /// deleted; returns `false` otherwise.
    pub fn delete_terminal_run(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM audit_runs
             WHERE id = ?1 AND status IN ('COMPLETED', 'CANCELLED', 'FAILED', 'TIMEOUT')",
            params![id],
        )?;
        Ok(changed == 1)
    }

    pub fn add_usage(
        &self,
        id: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_usd: f64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE audit_runs SET
                prompt_tokens = prompt_tokens + ?2,
                completion_tokens = completion_tokens + ?3,
                estimated_cost_usd = estimated_cost_usd + ?4
             WHERE id = ?1",
            params![id, prompt_tokens as i64, completion_tokens as i64, cost_usd],
        )?;
        Ok(())
    }
}
