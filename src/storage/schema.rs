//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS run_configs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            low_risk INTEGER NOT NULL DEFAULT 0,
            max_steps INTEGER,
            run_timeout_sec INTEGER,
            llm_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_cases (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            title TEXT NOT NULL,
            preconditions_json TEXT NOT NULL DEFAULT '[]',
            steps_json TEXT NOT NULL DEFAULT '[]',
            expected_result TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_test_cases_session ON test_cases(session_id, position);

        CREATE TABLE IF NOT EXISTS audit_runs (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            config_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            total_count INTEGER NOT NULL DEFAULT 0,
            completed_count INTEGER NOT NULL DEFAULT 0,
            passed_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            blocked_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            estimated_completion TEXT,
            completed_at TEXT,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            estimated_cost_usd REAL NOT NULL DEFAULT 0,
            supervisor TEXT,
            failure_reason TEXT,
            CHECK (completed_count <= total_count),
            CHECK (passed_count + failed_count + blocked_count + skipped_count = completed_count)
        );
        CREATE INDEX IF NOT EXISTS idx_audit_runs_status ON audit_runs(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_runs_session ON audit_runs(session_id);

        CREATE TABLE IF NOT EXISTS test_executions (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES audit_runs(id) ON DELETE CASCADE,
            test_case_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            status TEXT NOT NULL,
            verdict TEXT,
            confidence REAL,
            reason TEXT,
            current_step INTEGER NOT NULL DEFAULT 0,
            total_steps INTEGER NOT NULL,
            tool_calls INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER,
            started_at TEXT,
            finished_at TEXT,
            UNIQUE (run_id, sequence),
            CHECK (current_step <= total_steps),
            CHECK (confidence IS NULL OR (confidence >= 0 AND confidence <= 1))
        );

        CREATE TABLE IF NOT EXISTS confirmations (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES audit_runs(id) ON DELETE CASCADE,
            execution_id TEXT,
            kind TEXT NOT NULL,
            action_json TEXT NOT NULL,
            context TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            resolved_at TEXT,
            responder TEXT,
            note TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_confirmations_one_pending
            ON confirmations(run_id) WHERE status = 'PENDING';
        CREATE INDEX IF NOT EXISTS idx_confirmations_expiry ON confirmations(status, expires_at);

        CREATE TABLE IF NOT EXISTS run_logs (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES audit_runs(id) ON DELETE CASCADE,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_run_logs_run ON run_logs(run_id, id);",
    )?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}
