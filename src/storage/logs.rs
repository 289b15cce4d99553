//! Append-only run log.

use anyhow::Result;
use rusqlite::{params, Row};

use super::{fmt_time, parse_json, parse_text, parse_time, Store};
use crate::model::RunLogEntry;

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<RunLogEntry> {
    Ok(RunLogEntry {
        id: Some(row.get(0)?),
        run_id: row.get(1)?,
        timestamp: parse_time(2, row.get(2)?)?,
        event_type: parse_text(3, row.get(3)?)?,
        level: parse_text(4, row.get(4)?)?,
        message: row.get(5)?,
        metadata: parse_json(6, row.get(6)?)?,
    })
}

impl Store {
    /// Append an entry and return its id.
    pub fn append_log(&self, entry: &RunLogEntry) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO run_logs (run_id, timestamp, event_type, level, message, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.run_id,
                fmt_time(&entry.timestamp),
                entry.event_type.as_str(),
                entry.level.as_str(),
                entry.message,
                serde_json::to_string(&entry.metadata)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Entries of one run in append order, optionally only those after `after_id`.
    pub fn logs_for_run(
        &self,
        run_id: &str,
        after_id: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<RunLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, timestamp, event_type, level, message, metadata_json
             FROM run_logs WHERE run_id = ?1 AND id > ?2
             ORDER BY id LIMIT ?3",
        )?;
        let entries = stmt
            .query_map(
                params![run_id, after_id.unwrap_or(0), limit.map(i64::from).unwrap_or(-1)],
                log_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogEventType, LogLevel};
    use crate::run::RunStatus;
    use crate::storage::runs::tests::sample_run;

    #[test]
    fn test_append_and_page() {
        let store = Store::in_memory().unwrap();
        store.insert_run(&sample_run("r1", RunStatus::Running)).unwrap();

        let first = store
            .append_log(&RunLogEntry::new("r1", LogEventType::RunCreated, "created"))
            .unwrap();
        store
            .append_log(
                &RunLogEntry::new("r1", LogEventType::LlmRetry, "rate limited")
                    .with_level(LogLevel::Warn)
                    .with_metadata(serde_json::json!({"attempt": 1})),
            )
            .unwrap();

        let all = store.logs_for_run("r1", None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].level, LogLevel::Warn);
        assert_eq!(all[1].metadata["attempt"], 1);

        let tail = store.logs_for_run("r1", Some(first), None).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_type, LogEventType::LlmRetry);
    }
}
