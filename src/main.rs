use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use auditrun::config::EngineConfig;
use auditrun::model::{
    Catalog, ConfirmationDecision, ConfirmationFilter, ConfirmationStatus, RunFilter,
};
use auditrun::run::RunStatus;
use auditrun::storage::Store;

#[derive(Parser)]
#[command(
    name = "auditrun",
    about = "Orchestration engine for AI-driven audit runs",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults: $AUDITRUN_CONFIG, /etc/auditrun/auditrun.toml)
    #[arg(long, global = true, env = "AUDITRUN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine (run queue + REST API)
    Serve {
        /// Override `server.bind`
        #[arg(long)]
        bind: Option<String>,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Manage the session / configuration / test case catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Inspect audit runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Inspect and answer confirmation requests
    Confirmations {
        #[command(subcommand)]
        action: ConfirmationsAction,
    },
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Import sessions, run configurations and test cases from a TOML file
    Import {
        /// Catalog file
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, newest first
    List {
        /// Only runs in this status (e.g. RUNNING)
        #[arg(long)]
        status: Option<RunStatus>,

        /// Only runs of this session
        #[arg(long)]
        session: Option<String>,

        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Show one run with its execution records
    Show {
        id: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfirmationsAction {
    /// List confirmation requests
    List {
        /// Only requests of this run
        #[arg(long)]
        run: Option<String>,

        /// Include resolved requests
        #[arg(long)]
        all: bool,
    },

    /// Approve or reject a pending request through a running engine
    Respond {
        id: String,

        /// approve or reject
        #[arg(long, value_enum)]
        decision: Decision,

        #[arg(long)]
        note: Option<String>,

        /// Recorded as the responder
        #[arg(long, env = "USER")]
        user: Option<String>,

        /// Base URL of the engine's REST API
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        api: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Decision {
    Approve,
    Reject,
}

impl From<Decision> for ConfirmationDecision {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Approve => ConfirmationDecision::Approve,
            Decision::Reject => ConfirmationDecision::Reject,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::load_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    auditrun::init_logging(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            config.validate()?;
            tracing::info!(bind = %config.server.bind, "starting auditrun engine");
            auditrun::serve(config).await?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!("# configuration OK");
        }
        Commands::Catalog { action } => match action {
            CatalogAction::Import { file } => {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read catalog {}", file.display()))?;
                let catalog: Catalog = toml::from_str(&content)
                    .with_context(|| format!("failed to parse catalog {}", file.display()))?;
                let store = Store::open(&config.server.database_path)?;
                store.import_catalog(&catalog)?;
                println!(
                    "Imported {} sessions, {} configurations, {} test cases.",
                    catalog.sessions.len(),
                    catalog.configs.len(),
                    catalog.test_cases.len()
                );
            }
        },
        Commands::Runs { action } => {
            let store = Store::open(&config.server.database_path)?;
            match action {
                RunsAction::List {
                    status,
                    session,
                    limit,
                } => {
                    let runs = store.list_runs(&RunFilter {
                        status,
                        session_id: session,
                        limit: Some(limit),
                    })?;
                    if runs.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!(
                            "{:<36} | {:<20} | {:<14} | {:<9} | Created",
                            "Run", "Status", "Mode", "Progress"
                        );
                        println!("{:-<36}-|-{:-<20}-|-{:-<14}-|-{:-<9}-|-{:-<20}", "", "", "", "", "");
                        for run in runs {
                            println!(
                                "{:<36} | {:<20} | {:<14} | {:>4}/{:<4} | {}",
                                run.id,
                                run.status,
                                run.mode,
                                run.counters.completed,
                                run.counters.total,
                                run.created_at.format("%Y-%m-%d %H:%M:%S")
                            );
                        }
                    }
                }
                RunsAction::Show { id, json } => {
                    let run = store
                        .get_run(&id)?
                        .with_context(|| format!("run {} not found", id))?;
                    let records = store.executions_for_run(&id)?;
                    if json {
                        let out = serde_json::json!({ "run": run, "executions": records });
                        println!("{}", serde_json::to_string_pretty(&out)?);
                    } else {
                        println!("\n=== Run {} ===", run.id);
                        println!("Status:     {}", run.status);
                        println!("Mode:       {}", run.mode);
                        println!("Session:    {}", run.session_id);
                        println!(
                            "Progress:   {}/{} (passed {}, failed {}, blocked {}, skipped {})",
                            run.counters.completed,
                            run.counters.total,
                            run.counters.passed,
                            run.counters.failed,
                            run.counters.blocked,
                            run.counters.skipped
                        );
                        println!(
                            "Tokens:     {} in / {} out (~${:.4})",
                            run.prompt_tokens, run.completion_tokens, run.estimated_cost_usd
                        );
                        if let Some(reason) = &run.failure_reason {
                            println!("Reason:     {}", reason);
                        }
                        println!();
                        for record in records {
                            println!(
                                "{:>3}. {:<10} {:<8} {}",
                                record.sequence + 1,
                                record.status,
                                record.verdict.map(|v| v.to_string()).unwrap_or_default(),
                                record.reason.unwrap_or_default()
                            );
                        }
                        println!();
                    }
                }
            }
        }
        Commands::Confirmations { action } => match action {
            ConfirmationsAction::List { run, all } => {
                let store = Store::open(&config.server.database_path)?;
                let requests = store.list_confirmations(&ConfirmationFilter {
                    run_id: run,
                    status: if all { None } else { Some(ConfirmationStatus::Pending) },
                })?;
                if requests.is_empty() {
                    println!("No confirmation requests found.");
                }
                for request in requests {
                    println!(
                        "{} [{}] {} -> {} ({})",
                        request.id, request.status, request.kind, request.action.tool, request.context
                    );
                    println!("    arguments: {}", request.action.arguments);
                    if let Some(reasoning) = &request.action.reasoning {
                        println!("    reasoning: {}", reasoning);
                    }
                    println!("    expires:   {}", request.expires_at.to_rfc3339());
                }
            }
            ConfirmationsAction::Respond {
                id,
                decision,
                note,
                user,
                api,
            } => {
                let url = format!(
                    "{}/api/v1/confirmations/{}/respond",
                    api.trim_end_matches('/'),
                    id
                );
                let body = serde_json::json!({
                    "decision": ConfirmationDecision::from(decision),
                    "responder": user,
                    "note": note,
                });
                let response = reqwest::Client::new()
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .with_context(|| format!("failed to reach {}", url))?;
                let status = response.status();
                let payload: serde_json::Value = response.json().await.unwrap_or_default();
                if !status.is_success() {
                    anyhow::bail!(
                        "engine refused the response ({}): {}",
                        status,
                        payload["error"]["message"].as_str().unwrap_or("no details")
                    );
                }
                println!(
                    "Confirmation {} is now {}.",
                    id,
                    payload["data"]["status"].as_str().unwrap_or("resolved")
                );
            }
        },
    }

    Ok(())
}
