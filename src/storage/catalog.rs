//! Sessions, run configurations and test cases.
//!
//! These rows belong to the surrounding audit application; the engine reads
//! them when a run is enqueued and when it resumes after a restart.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_json, Store};
use crate::model::{AuditSession, Catalog, RunConfiguration, TestCase};

fn test_case_from_row(row: &Row<'_>) -> rusqlite::Result<TestCase> {
    Ok(TestCase {
        id: row.get(0)?,
        session_id: row.get(1)?,
        position: row.get(2)?,
        title: row.get(3)?,
        preconditions: parse_json(4, row.get(4)?)?,
        steps: parse_json(5, row.get(5)?)?,
        expected_result: row.get(6)?,
        enabled: row.get(7)?,
    })
}

impl Store {
    pub fn upsert_session(&self, session: &AuditSession) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (id, name, active) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, active = excluded.active",
            params![session.id, session.name, session.active],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<AuditSession>> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                "SELECT id, name, active FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AuditSession {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        active: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn upsert_config(&self, config: &RunConfiguration) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO run_configs (id, name, low_risk, max_steps, run_timeout_sec, llm_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, low_risk = excluded.low_risk,
                max_steps = excluded.max_steps, run_timeout_sec = excluded.run_timeout_sec,
                llm_json = excluded.llm_json",
            params![
                config.id,
                config.name,
                config.low_risk,
                config.max_steps,
                config.run_timeout_sec.map(|s| s as i64),
                serde_json::to_string(&config.llm)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_config(&self, id: &str) -> Result<Option<RunConfiguration>> {
        let conn = self.conn()?;
        let config = conn
            .query_row(
                "SELECT id, name, low_risk, max_steps, run_timeout_sec, llm_json
                 FROM run_configs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RunConfiguration {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        low_risk: row.get(2)?,
                        max_steps: row.get(3)?,
                        run_timeout_sec: row.get::<_, Option<i64>>(4)?.map(|s| s as u64),
                        llm: parse_json(5, row.get(5)?)?,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    pub fn upsert_test_case(&self, case: &TestCase) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO test_cases (id, session_id, position, title, preconditions_json,
                                     steps_json, expected_result, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                session_id = excluded.session_id, position = excluded.position,
                title = excluded.title, preconditions_json = excluded.preconditions_json,
                steps_json = excluded.steps_json, expected_result = excluded.expected_result,
                enabled = excluded.enabled",
            params![
                case.id,
                case.session_id,
                case.position,
                case.title,
                serde_json::to_string(&case.preconditions)?,
                serde_json::to_string(&case.steps)?,
                case.expected_result,
                case.enabled,
            ],
        )?;
        Ok(())
    }

    /// Test cases of a session in execution order, disabled ones included.
    pub fn test_cases_for_session(&self, session_id: &str) -> Result<Vec<TestCase>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, position, title, preconditions_json, steps_json,
                    expected_result, enabled
             FROM test_cases WHERE session_id = ?1 ORDER BY position, id",
        )?;
        let cases = stmt
            .query_map(params![session_id], test_case_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cases)
    }

    /// Upsert a whole catalog, sessions first so test cases find their parent.
    pub fn import_catalog(&self, catalog: &Catalog) -> Result<()> {
        for session in &catalog.sessions {
            self.upsert_session(session)
                .with_context(|| format!("failed to import session {}", session.id))?;
        }
        for config in &catalog.configs {
            self.upsert_config(config)
                .with_context(|| format!("failed to import run configuration {}", config.id))?;
        }
        for case in &catalog.test_cases {
            self.upsert_test_case(case)
                .with_context(|| format!("failed to import test case {}", case.id))?;
        }
        Ok(())
    }
}
