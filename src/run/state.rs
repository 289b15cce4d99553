//! Run lifecycle states and the transition table.
//!
//! `RunStatus::apply` is the only place that decides whether a transition is
//! legal. Persistence uses the result as a compare-and-set target, so an
//! illegal event never mutates a stored run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of one audit run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Initializing,
    Running,
    Paused,
    WaitingConfirmation,
    Completed,
    Cancelled,
    Failed,
    Timeout,
}

/// Something that happened to a run and may move it to another state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    /// The queue granted a concurrency slot.
    Admit,
    /// The driver finished loading configuration and capabilities.
    SetupComplete,
    ConfirmationRequired,
    ConfirmationResolved,
    Pause,
    Resume,
    Cancel,
    /// Every test case reached a terminal status.
    Complete,
    Fail,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition: {event:?} is not allowed while the run is {from}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub event: RunEvent,
}

impl RunStatus {
    pub const ALL: [RunStatus; 9] = [
        RunStatus::Pending,
        RunStatus::Initializing,
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::WaitingConfirmation,
        RunStatus::Completed,
        RunStatus::Cancelled,
        RunStatus::Failed,
        RunStatus::Timeout,
    ];

    /// Apply `event` to this state, returning the next state.
    pub fn apply(self, event: RunEvent) -> Result<RunStatus, TransitionError> {
        use RunEvent as E;
        use RunStatus as S;

        let next = match (self, event) {
            (S::Pending, E::Admit) => S::Initializing,
            (S::Initializing, E::SetupComplete) => S::Running,

            (S::Running, E::ConfirmationRequired) => S::WaitingConfirmation,
            (S::WaitingConfirmation, E::ConfirmationResolved) => S::Running,

            (S::Running | S::WaitingConfirmation, E::Pause) => S::Paused,
            (S::Paused, E::Resume) => S::Running,

            (
                S::Pending | S::Initializing | S::Running | S::Paused | S::WaitingConfirmation,
                E::Cancel,
            ) => S::Cancelled,

            (S::Running, E::Complete) => S::Completed,

            (
                S::Pending | S::Initializing | S::Running | S::Paused | S::WaitingConfirmation,
                E::Fail,
            ) => S::Failed,
            (
                S::Pending | S::Initializing | S::Running | S::Paused | S::WaitingConfirmation,
                E::TimedOut,
            ) => S::Timeout,

            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    /// COMPLETED, CANCELLED, FAILED and TIMEOUT accept no further events.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed | RunStatus::Timeout
        )
    }

    /// States in which a driver task exists and a concurrency slot is held.
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            RunStatus::Initializing
                | RunStatus::Running
                | RunStatus::Paused
                | RunStatus::WaitingConfirmation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Initializing => "INITIALIZING",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::WaitingConfirmation => "WAITING_CONFIRMATION",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Failed => "FAILED",
            RunStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown run status '{}'", s))
    }
}
