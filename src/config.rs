//! TOML configuration for the auditrun engine.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working single-node setup. The file path can be overridden
//! with the `AUDITRUN_CONFIG` environment variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::policy::{default_rules, PolicyRule};
use crate::transport::Endpoint;

/// Standard system location checked when no explicit path is given.
const SYSTEM_CONFIG_PATH: &str = "/etc/auditrun/auditrun.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// Try, in order: the `AUDITRUN_CONFIG` environment variable, the system
    /// path, then compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("AUDITRUN_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "AUDITRUN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values that would make the engine unable to make progress.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.queue.max_concurrent_runs > 0,
            "queue.max_concurrent_runs must be at least 1"
        );
        anyhow::ensure!(
            self.execution.default_max_steps > 0,
            "execution.default_max_steps must be at least 1"
        );
        anyhow::ensure!(
            self.confirmation.default_ttl_sec > 0,
            "confirmation.default_ttl_sec must be at least 1"
        );
        anyhow::ensure!(
            self.confirmation.sweep_interval_sec > 0,
            "confirmation.sweep_interval_sec must be at least 1"
        );
        self.transport
            .endpoint
            .parse::<Endpoint>()
            .context("transport.endpoint is not a valid endpoint")?;
        for rule in &self.confirmation.rules {
            rule.glob()
                .with_context(|| format!("confirmation rule pattern {:?} is invalid", rule.tool))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the REST control surface.
    pub bind: String,
    /// SQLite database file.
    pub database_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("data/auditrun.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Runs allowed to hold a slot at once.
    pub max_concurrent_runs: usize,
    /// Default wall-clock budget per run (seconds). 0 disables the budget.
    pub run_timeout_sec: u64,
    /// Capacity of the queue's command channel.
    pub command_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            run_timeout_sec: 4 * 3600,
            command_buffer: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Steps per test case when the run configuration does not set one.
    pub default_max_steps: u32,
    /// Optional wall-clock budget per test case (seconds).
    pub test_case_timeout_sec: Option<u64>,
    /// Repair prompts sent after an unparseable LLM reply.
    pub max_repair_attempts: u32,
    /// Consecutive transient failures tolerated before a test case is BLOCKED.
    pub transport_retry_ceiling: u32,
    /// Rate-limit retries per decision.
    pub llm_max_retries: u32,
    pub llm_call_timeout_sec: u64,
    /// Base delay for exponential backoff between retries.
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_max_steps: 25,
            test_case_timeout_sec: None,
            max_repair_attempts: 2,
            transport_retry_ceiling: 3,
            llm_max_retries: 4,
            llm_call_timeout_sec: 120,
            retry_backoff_ms: 500,
        }
    }
}

impl ExecutionConfig {
    pub fn llm_call_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_call_timeout_sec)
    }

    pub fn test_case_timeout(&self) -> Option<Duration> {
        self.test_case_timeout_sec.map(Duration::from_secs)
    }

    /// Exponential backoff for the given 1-based attempt, capped at 30 s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor).min(30_000))
    }
}

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Seconds a request stays PENDING before it expires.
    pub default_ttl_sec: u64,
    /// Interval of the expiry sweep.
    pub sweep_interval_sec: u64,
    /// Ordered policy table; the first matching rule wins.
    pub rules: Vec<PolicyRule>,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            default_ttl_sec: 900,
            sweep_interval_sec: 5,
            rules: default_rules(),
        }
    }
}

impl ConfirmationConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_sec)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `tcp://host:port` or `unix:///path/to/socket`.
    pub endpoint: String,
    pub call_timeout_sec: u64,
    /// Connection attempts per reconnect cycle.
    pub reconnect_attempts: u32,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:7400".to_string(),
            call_timeout_sec: 60,
            reconnect_attempts: 5,
            reconnect_initial_backoff_ms: 200,
            reconnect_max_backoff_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Optional JSON-lines mirror of every run log entry.
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            audit_log_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
