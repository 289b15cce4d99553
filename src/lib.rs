//! auditrun -- orchestration engine for AI-driven audit runs.
//!
//! A run walks the test cases of an audit session with an LLM agent that
//! proposes tool calls against the system under test. Risky calls stop at a
//! human confirmation gate; everything is persisted so runs survive restarts.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod journal;
pub mod llm;
pub mod model;
pub mod queue;
pub mod run;
pub mod storage;
pub mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{EngineConfig, LoggingConfig};
use crate::gate::ConfirmationGate;
use crate::journal::{AuditFile, RunJournal};
use crate::queue::{LlmSource, QueueManager};
use crate::storage::Store;
use crate::transport::RpcClient;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_logging(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}

/// Start the engine: storage, confirmation gate, transport, run queue and the
/// REST control surface. Returns after ctrl-c.
pub async fn serve(config: EngineConfig) -> Result<()> {
    // 1. Storage and journal
    let db_path = &config.server.database_path;
    tracing::info!(db_path = %db_path.display(), "initializing database");
    let store = Store::open(db_path)?;

    let mut journal = RunJournal::new(store.clone());
    if let Some(path) = &config.logging.audit_log_path {
        journal = journal.with_file(AuditFile::open(path).await?);
    }

    // 2. Confirmation gate and its expiry sweeper
    let gate = Arc::new(ConfirmationGate::new(
        store.clone(),
        journal.clone(),
        config.confirmation.default_ttl(),
    ));
    let shutdown = CancellationToken::new();
    tokio::spawn(gate::run_sweeper(
        gate.clone(),
        std::time::Duration::from_secs(config.confirmation.sweep_interval_sec),
        shutdown.clone(),
    ));

    // 3. Transport to the system under test; connects lazily
    let transport = RpcClient::from_config(&config.transport)
        .context("invalid transport configuration")?;
    tracing::info!(endpoint = %config.transport.endpoint, "tool transport configured");

    // 4. Run queue, recovering whatever was in flight
    let (queue, report) = QueueManager::new(
        store,
        gate.clone(),
        Arc::new(transport.clone()),
        LlmSource::FromRunConfig,
        config.clone(),
        journal,
    )
    .start()
    .await?;
    if !report.failed.is_empty() {
        tracing::warn!(failed = ?report.failed, "some runs could not be recovered");
    }

    // 5. API server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let app = api::router(api::state::AppState {
        queue: queue.clone(),
        gate,
    });

    tracing::info!(%addr, "auditrun listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = queue.shutdown().await {
        tracing::warn!(error = %e, "run queue already stopped");
    }
    transport.disconnect().await;
    Ok(())
}
