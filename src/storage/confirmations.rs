//! Confirmation request rows.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, OptionalExtension, Row};

use super::{fmt_time, parse_json, parse_opt_time, parse_text, parse_time, Store};
use crate::model::{ConfirmationFilter, ConfirmationRequest, ConfirmationStatus};

const CONFIRMATION_COLUMNS: &str = "id, run_id, execution_id, kind, action_json, context,
    status, created_at, expires_at, resolved_at, responder, note";

fn confirmation_from_row(row: &Row<'_>) -> rusqlite::Result<ConfirmationRequest> {
    Ok(ConfirmationRequest {
        id: row.get(0)?,
        run_id: row.get(1)?,
        execution_id: row.get(2)?,
        kind: parse_text(3, row.get(3)?)?,
        action: parse_json(4, row.get(4)?)?,
        context: row.get(5)?,
        status: parse_text(6, row.get(6)?)?,
        created_at: parse_time(7, row.get(7)?)?,
        expires_at: parse_time(8, row.get(8)?)?,
        resolved_at: parse_opt_time(9, row.get(9)?)?,
        responder: row.get(10)?,
        note: row.get(11)?,
    })
}

impl Store {
    /// Insert a new PENDING request. Returns `false` when the run already has
    /// one pending.
    pub fn insert_confirmation(&self, request: &ConfirmationRequest) -> Result<bool> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO confirmations (id, run_id, execution_id, kind, action_json, context,
                                        status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                request.id,
                request.run_id,
                request.execution_id,
                request.kind.as_str(),
                serde_json::to_string(&request.action)?,
                request.context,
                request.status.as_str(),
                fmt_time(&request.created_at),
                fmt_time(&request.expires_at),
            ],
        );
        drop(conn);

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
                    && self.pending_confirmation_for_run(&request.run_id)?.is_some() =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_confirmation(&self, id: &str) -> Result<Option<ConfirmationRequest>> {
        let conn = self.conn()?;
        let request = conn
            .query_row(
                &format!("SELECT {CONFIRMATION_COLUMNS} FROM confirmations WHERE id = ?1"),
                params![id],
                confirmation_from_row,
            )
            .optional()?;
        Ok(request)
    }

    pub fn pending_confirmation_for_run(&self, run_id: &str) -> Result<Option<ConfirmationRequest>> {
        let conn = self.conn()?;
        let request = conn
            .query_row(
                &format!(
                    "SELECT {CONFIRMATION_COLUMNS} FROM confirmations
                     WHERE run_id = ?1 AND status = 'PENDING'"
                ),
                params![run_id],
                confirmation_from_row,
            )
            .optional()?;
        Ok(request)
    }

    /// Move a PENDING request to `status`. Returns `false` if it was not
    /// PENDING any more (or does not exist).
    pub fn resolve_confirmation(
        &self,
        id: &str,
        status: ConfirmationStatus,
        responder: Option<&str>,
        note: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE confirmations SET status = ?2, resolved_at = ?3, responder = ?4, note = ?5
             WHERE id = ?1 AND status = 'PENDING'",
            params![id, status.as_str(), fmt_time(&Utc::now()), responder, note],
        )?;
        Ok(changed == 1)
    }

    /// PENDING requests whose deadline is at or before `now`.
    pub fn overdue_confirmations(&self, now: DateTime<Utc>) -> Result<Vec<ConfirmationRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM confirmations
             WHERE status = 'PENDING' AND expires_at <= ?1
             ORDER BY expires_at"
        ))?;
        let requests = stmt
            .query_map(params![fmt_time(&now)], confirmation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    /// Oldest first.
    pub fn list_confirmations(&self, filter: &ConfirmationFilter) -> Result<Vec<ConfirmationRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM confirmations
             WHERE (?1 IS NULL OR run_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at, rowid"
        ))?;
        let requests = stmt
            .query_map(
                params![filter.run_id, filter.status.map(|s| s.as_str())],
                confirmation_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }
}
