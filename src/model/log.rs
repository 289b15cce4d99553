//! Append-only run log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::string_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventType {
    RunCreated,
    StatusChanged,
    TestCaseStarted,
    TestCaseFinished,
    StepCompleted,
    ConfirmationRequested,
    ConfirmationResolved,
    LlmRetry,
    TransportRetry,
    RecoveryResumed,
    RecoveryFailed,
    RunFailed,
}

string_enum!(LogEventType {
    RunCreated => "run_created",
    StatusChanged => "status_changed",
    TestCaseStarted => "test_case_started",
    TestCaseFinished => "test_case_finished",
    StepCompleted => "step_completed",
    ConfirmationRequested => "confirmation_requested",
    ConfirmationResolved => "confirmation_resolved",
    LlmRetry => "llm_retry",
    TransportRetry => "transport_retry",
    RecoveryResumed => "recovery_resumed",
    RecoveryFailed => "recovery_failed",
    RunFailed => "run_failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

string_enum!(LogLevel {
    Debug => "debug",
    Info => "info",
    Warn => "warn",
    Error => "error",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// Assigned by storage; `None` until appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: LogEventType,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RunLogEntry {
    /// New `info` entry stamped now, with empty metadata.
    pub fn new(run_id: impl Into<String>, event_type: LogEventType, message: impl Into<String>) -> Self {
        Self {
            id: None,
            run_id: run_id.into(),
            timestamp: Utc::now(),
            event_type,
            level: LogLevel::Info,
            message: message.into(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builder_defaults() {
        let entry = RunLogEntry::new("run-1", LogEventType::RunCreated, "created");
        assert_eq!(entry.level, LogLevel::Info);
        assert!(entry.id.is_none());
        assert!(entry.metadata.as_object().unwrap().is_empty());

        let entry = entry
            .with_level(LogLevel::Error)
            .with_metadata(serde_json::json!({"reason": "boom"}));
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.metadata["reason"], "boom");
    }

    #[test]
    fn test_event_type_strings_match_serde() {
        let json = serde_json::to_string(&LogEventType::ConfirmationResolved).unwrap();
        assert_eq!(json, format!("\"{}\"", LogEventType::ConfirmationResolved.as_str()));
        assert_eq!(
            "recovery_failed".parse::<LogEventType>().unwrap(),
            LogEventType::RecoveryFailed
        );
    }
}
