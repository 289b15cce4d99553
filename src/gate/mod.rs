//! Confirmation gate: human approval for proposed tool calls.
//!
//! A request is persisted first and then awaited through a
//! [`ConfirmationHandle`]. Resolution is a compare-and-set on the stored row,
//! so whichever of respond, expire or withdraw lands first wins and every
//! later attempt sees a conflict. At most one request per run is PENDING.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::journal::RunJournal;
use crate::model::{
    ConfirmationFilter, ConfirmationKind, ConfirmationRequest, ConfirmationResponse,
    ConfirmationStatus, LogEventType, LogLevel, ProposedAction, RunLogEntry,
};
use crate::storage::Store;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("run {0} already has a pending confirmation")]
    AlreadyPending(String),
    #[error("confirmation {0} not found")]
    NotFound(String),
    #[error("confirmation {id} is already {status}")]
    Conflict {
        id: String,
        status: ConfirmationStatus,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What the waiting loop learns once a request is resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Approved {
        responder: Option<String>,
        note: Option<String>,
    },
    Rejected {
        responder: Option<String>,
        note: Option<String>,
    },
    Expired {
        reason: String,
    },
}

impl ConfirmationOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ConfirmationOutcome::Approved { .. })
    }

    fn from_request(request: &ConfirmationRequest) -> Option<Self> {
        match request.status {
            ConfirmationStatus::Pending => None,
            ConfirmationStatus::Approved => Some(ConfirmationOutcome::Approved {
                responder: request.responder.clone(),
                note: request.note.clone(),
            }),
            ConfirmationStatus::Rejected => Some(ConfirmationOutcome::Rejected {
                responder: request.responder.clone(),
                note: request.note.clone(),
            }),
            ConfirmationStatus::Expired => Some(ConfirmationOutcome::Expired {
                reason: request
                    .note
                    .clone()
                    .unwrap_or_else(|| "confirmation expired".to_string()),
            }),
        }
    }
}

/// Awaitable side of a persisted request.
#[derive(Debug)]
pub struct ConfirmationHandle {
    request: ConfirmationRequest,
    rx: oneshot::Receiver<ConfirmationOutcome>,
}

impl ConfirmationHandle {
    pub fn request(&self) -> &ConfirmationRequest {
        &self.request
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    /// Block until the request is approved, rejected, expired or withdrawn.
    pub async fn wait(self) -> ConfirmationOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => ConfirmationOutcome::Expired {
                reason: "confirmation gate shut down".to_string(),
            },
        }
    }
}

pub struct ConfirmationGate {
    store: Store,
    journal: RunJournal,
    default_ttl: Duration,
    waiters: Mutex<HashMap<String, oneshot::Sender<ConfirmationOutcome>>>,
}

impl ConfirmationGate {
    pub fn new(store: Store, journal: RunJournal, default_ttl: Duration) -> Self {
        Self {
            store,
            journal,
            default_ttl,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a PENDING request and return a handle to wait on.
    pub async fn request(
        &self,
        run_id: &str,
        execution_id: Option<&str>,
        kind: ConfirmationKind,
        action: ProposedAction,
        context: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<ConfirmationHandle, GateError> {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(900));

        let request = ConfirmationRequest {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            execution_id: execution_id.map(str::to_string),
            kind,
            action,
            context: context.into(),
            status: ConfirmationStatus::Pending,
            created_at: now,
            expires_at,
            resolved_at: None,
            responder: None,
            note: None,
        };

        // Register the waiter before the row exists so no resolution can slip
        // in between.
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(request.id.clone(), tx);

        match self.store.insert_confirmation(&request) {
            Ok(true) => {}
            Ok(false) => {
                self.waiters().remove(&request.id);
                return Err(GateError::AlreadyPending(run_id.to_string()));
            }
            Err(e) => {
                self.waiters().remove(&request.id);
                return Err(GateError::Storage(e));
            }
        }

        info!(
            run_id,
            confirmation_id = %request.id,
            kind = %kind,
            tool = %request.action.tool,
            "confirmation requested"
        );
        self.journal
            .record(
                RunLogEntry::new(
                    run_id,
                    LogEventType::ConfirmationRequested,
                    format!("{} confirmation requested for '{}'", kind, request.action.tool),
                )
                .with_metadata(json!({
                    "confirmation_id": request.id,
                    "kind": kind,
                    "action": request.action,
                    "expires_at": request.expires_at,
                })),
            )
            .await?;

        Ok(ConfirmationHandle { request, rx })
    }

    /// Apply a human decision. A second resolution is a conflict.
    pub async fn resolve(
        &self,
        id: &str,
        response: ConfirmationResponse,
    ) -> Result<ConfirmationRequest, GateError> {
        let status = response.decision.status();
        self.settle(id, status, response.responder.as_deref(), response.note.as_deref())
            .await
    }

    /// Expire a pending request on behalf of the system (run cancelled, timed
    /// out, or recovered). Returns `false` when it was no longer pending.
    pub async fn withdraw(&self, id: &str, reason: &str) -> Result<bool, GateError> {
        match self
            .settle(id, ConfirmationStatus::Expired, None, Some(reason))
            .await
        {
            Ok(_) => Ok(true),
            Err(GateError::Conflict { .. }) | Err(GateError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Expire the pending request of `run_id`, if any.
    pub async fn expire_stale_for_run(&self, run_id: &str, reason: &str) -> Result<bool, GateError> {
        match self.store.pending_confirmation_for_run(run_id)? {
            Some(request) => self.withdraw(&request.id, reason).await,
            None => Ok(false),
        }
    }

    /// Expire every request past its deadline. Returns how many were expired.
    pub async fn sweep_expired(&self) -> Result<usize, GateError> {
        let overdue = self.store.overdue_confirmations(Utc::now())?;
        let mut expired = 0;
        for request in overdue {
            if self.withdraw(&request.id, "confirmation expired").await? {
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(expired, "expired overdue confirmations");
        }
        Ok(expired)
    }

    pub fn get(&self, id: &str) -> Result<ConfirmationRequest, GateError> {
        self.store
            .get_confirmation(id)?
            .ok_or_else(|| GateError::NotFound(id.to_string()))
    }

    pub fn list(&self, filter: &ConfirmationFilter) -> Result<Vec<ConfirmationRequest>, GateError> {
        Ok(self.store.list_confirmations(filter)?)
    }

    async fn settle(
        &self,
        id: &str,
        status: ConfirmationStatus,
        responder: Option<&str>,
        note: Option<&str>,
    ) -> Result<ConfirmationRequest, GateError> {
        if !self.store.resolve_confirmation(id, status, responder, note)? {
            return match self.store.get_confirmation(id)? {
                Some(current) => Err(GateError::Conflict {
                    id: id.to_string(),
                    status: current.status,
                }),
                None => Err(GateError::NotFound(id.to_string())),
            };
        }

        let request = self.get(id)?;
        if let Some(outcome) = ConfirmationOutcome::from_request(&request) {
            if let Some(tx) = self.waiters().remove(id) {
                let _ = tx.send(outcome);
            }
        }

        let level = match status {
            ConfirmationStatus::Approved => LogLevel::Info,
            _ => LogLevel::Warn,
        };
        info!(
            run_id = %request.run_id,
            confirmation_id = id,
            status = %status,
            responder = responder.unwrap_or("system"),
            "confirmation resolved"
        );
        self.journal
            .record(
                RunLogEntry::new(
                    &request.run_id,
                    LogEventType::ConfirmationResolved,
                    format!("confirmation for '{}' {}", request.action.tool, status),
                )
                .with_level(level)
                .with_metadata(json!({
                    "confirmation_id": id,
                    "status": status,
                    "responder": responder,
                    "note": note,
                })),
            )
            .await?;

        Ok(request)
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ConfirmationOutcome>>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Background task expiring overdue requests every `interval`.
pub async fn run_sweeper(gate: Arc<ConfirmationGate>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = gate.sweep_expired().await {
                    warn!(error = %e, "confirmation sweep failed");
                }
            }
        }
    }
    debug!("confirmation sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConfirmationDecision;
    use crate::run::RunStatus;
    use crate::storage::runs::tests::sample_run;

    fn gate() -> (Arc<ConfirmationGate>, Store) {
        let store = Store::in_memory().unwrap();
        store.insert_run(&sample_run("r1", RunStatus::WaitingConfirmation)).unwrap();
        let journal = RunJournal::new(store.clone());
        let gate = ConfirmationGate::new(store.clone(), journal, Duration::from_secs(60));
        (Arc::new(gate), store)
    }

    fn action(tool: &str) -> ProposedAction {
        ProposedAction {
            tool: tool.to_string(),
            arguments: json!({"id": 1}),
            reasoning: Some("cleanup".into()),
        }
    }

    fn approve(by: &str) -> ConfirmationResponse {
        ConfirmationResponse {
            decision: ConfirmationDecision::Approve,
            responder: Some(by.to_string()),
            note: None,
        }
    }

    #[tokio::test]
    async fn test_approve_unblocks_waiter() {
        let (gate, store) = gate();
        let handle = gate
            .request("r1", None, ConfirmationKind::Destructive, action("delete_user"), "case 2", None)
            .await
            .unwrap();
        let id = handle.id().to_string();

        let waiter = tokio::spawn(handle.wait());
        let resolved = gate.resolve(&id, approve("alice")).await.unwrap();
        assert_eq!(resolved.status, ConfirmationStatus::Approved);

        let outcome = waiter.await.unwrap();
        assert!(outcome.is_approved());

        let logs = store.logs_for_run("r1", None, None).unwrap();
        let kinds: Vec<_> = logs.iter().map(|l| l.event_type).collect();
        assert_eq!(
            kinds,
            vec![LogEventType::ConfirmationRequested, LogEventType::ConfirmationResolved]
        );
    }

    #[tokio::test]
    async fn test_second_resolution_conflicts() {
        let (gate, _) = gate();
        let handle = gate
            .request("r1", None, ConfirmationKind::Destructive, action("drop_table"), "", None)
            .await
            .unwrap();
        let id = handle.id().to_string();

        gate.resolve(&id, approve("alice")).await.unwrap();
        let err = gate
            .resolve(
                &id,
                ConfirmationResponse {
                    decision: ConfirmationDecision::Reject,
                    responder: Some("bob".into()),
                    note: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::Conflict {
                status: ConfirmationStatus::Approved,
                ..
            }
        ));
        assert!(matches!(
            gate.resolve("missing", approve("x")).await,
            Err(GateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_back_to_back_request_is_refused() {
        let (gate, _) = gate();
        let _first = gate
            .request("r1", None, ConfirmationKind::Destructive, action("delete_a"), "", None)
            .await
            .unwrap();
        let second = gate
            .request("r1", None, ConfirmationKind::Destructive, action("delete_b"), "", None)
            .await;
        assert!(matches!(second, Err(GateError::AlreadyPending(_))));
        assert_eq!(
            gate.list(&ConfirmationFilter {
                run_id: Some("r1".into()),
                status: Some(ConfirmationStatus::Pending),
            })
            .unwrap()
            .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_sweep_expires_overdue_with_rejection_equivalent() {
        let (gate, _) = gate();
        let handle = gate
            .request(
                "r1",
                None,
                ConfirmationKind::Irreversible,
                action("reboot"),
                "",
                Some(Duration::from_millis(0)),
            )
            .await
            .unwrap();
        let id = handle.id().to_string();

        assert_eq!(gate.sweep_expired().await.unwrap(), 1);
        let outcome = handle.wait().await;
        assert!(matches!(outcome, ConfirmationOutcome::Expired { .. }));
        assert!(!outcome.is_approved());

        // Late human response loses
        assert!(matches!(
            gate.resolve(&id, approve("alice")).await,
            Err(GateError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_withdraw_and_expire_stale() {
        let (gate, _) = gate();
        let handle = gate
            .request("r1", None, ConfirmationKind::Privileged, action("grant_admin"), "", None)
            .await
            .unwrap();

        assert!(gate.expire_stale_for_run("r1", "run cancelled").await.unwrap());
        assert!(!gate.expire_stale_for_run("r1", "run cancelled").await.unwrap());
        assert_eq!(
            handle.wait().await,
            ConfirmationOutcome::Expired {
                reason: "run cancelled".into()
            }
        );
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_on_shutdown() {
        let (gate, _) = gate();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(gate.clone(), Duration::from_millis(10), shutdown.clone()));

        let handle = gate
            .request(
                "r1",
                None,
                ConfirmationKind::Destructive,
                action("wipe"),
                "",
                Some(Duration::from_millis(5)),
            )
            .await
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap();
        assert!(matches!(outcome, ConfirmationOutcome::Expired { .. }));

        shutdown.cancel();
        task.await.unwrap();
    }
}
