//! Persistent records owned by the orchestration engine, plus the read-only
//! catalog rows (sessions, configurations, test cases) it consumes.

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// stored form is a fixed string.
macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(_ if s.eq_ignore_ascii_case($text) => Ok($ty::$variant),)+
                    _ => Err(anyhow::anyhow!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        s
                    )),
                }
            }
        }
    };
}

pub(crate) use string_enum;

pub mod catalog;
pub mod confirmation;
pub mod execution;
pub mod log;
pub mod run;

pub use self::catalog::{AuditSession, Catalog, RunConfiguration, TestCase};
pub use self::confirmation::{
    ConfirmationDecision, ConfirmationFilter, ConfirmationKind, ConfirmationRequest,
    ConfirmationResponse, ConfirmationStatus, ProposedAction,
};
pub use self::execution::{ExecutionOutcome, TestExecutionRecord, TestStatus, Verdict};
pub use self::log::{LogEventType, LogLevel, RunLogEntry};
pub use self::run::{AuditRun, ExecutionMode, RunCounters, RunFilter, RunRequest};
