//! Run journal: the append-only record of what happened to each run.
//!
//! Every entry goes to the `run_logs` table, is mirrored to `tracing` at its
//! level, and is optionally appended as one JSON line to an audit file.
//! The file is a best-effort copy; only the database write can fail a call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::model::{LogEventType, LogLevel, RunLogEntry};
use crate::run::RunStatus;
use crate::storage::Store;

// ---------------------------------------------------------------------------
// AuditFile
// ---------------------------------------------------------------------------

/// JSON-lines file opened in append mode.
pub struct AuditFile {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl AuditFile {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create audit log directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open audit log: {}", path.display()))?;

        debug!(path = %path.display(), "audit log opened");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(file),
        })
    }

    pub async fn append(&self, entry: &RunLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("failed to serialize log entry")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write to audit log: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush audit log: {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// RunJournal
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RunJournal {
    store: Store,
    file: Option<Arc<AuditFile>>,
}

impl RunJournal {
    pub fn new(store: Store) -> Self {
        Self { store, file: None }
    }

    pub fn with_file(mut self, file: AuditFile) -> Self {
        self.file = Some(Arc::new(file));
        self
    }

    /// Persist one entry and return it with its assigned id.
    pub async fn record(&self, mut entry: RunLogEntry) -> Result<RunLogEntry> {
        entry.id = Some(self.store.append_log(&entry)?);
        trace_entry(&entry);

        if let Some(file) = &self.file {
            if let Err(e) = file.append(&entry).await {
                warn!(error = %e, "audit file append failed");
            }
        }
        Ok(entry)
    }

    pub async fn status_changed(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        reason: Option<&str>,
    ) -> Result<RunLogEntry> {
        let level = match to {
            RunStatus::Failed | RunStatus::Timeout => LogLevel::Error,
            RunStatus::Cancelled => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        let message = match reason {
            Some(reason) => format!("{} -> {}: {}", from, to, reason),
            None => format!("{} -> {}", from, to),
        };
        self.record(
            RunLogEntry::new(run_id, LogEventType::StatusChanged, message)
                .with_level(level)
                .with_metadata(json!({"from": from, "to": to, "reason": reason})),
        )
        .await
    }
}

fn trace_entry(entry: &RunLogEntry) {
    let event = entry.event_type.as_str();
    match entry.level {
        LogLevel::Debug => debug!(run_id = %entry.run_id, event, "{}", entry.message),
        LogLevel::Info => info!(run_id = %entry.run_id, event, "{}", entry.message),
        LogLevel::Warn => warn!(run_id = %entry.run_id, event, "{}", entry.message),
        LogLevel::Error => error!(run_id = %entry.run_id, event, "{}", entry.message),
    }
}
