//! `stepwise` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve` - start the API server against Postgres.
//! - `migrate` - run pending database migrations.
//! - `validate` - compile a workflow JSON file and print its step order.
//! - `run` - run a workflow JSON file in-process and print the result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::store::{InMemoryStore, PgStore};
use engine::{Engine, EngineConfig, ExecutionStatus, InMemoryTenantRegistry, WorkflowDefinition};
use nodes::NodeCatalog;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "stepwise",
    about = "Multi-tenant workflow automation engine",
    version
)]
struct Cli {
    /// Engine configuration file (JSON). Missing fields keep their defaults.
    #[arg(long, global = true, env = "STEPWISE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080", env = "STEPWISE_BIND")]
        bind: String,
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        #[arg(long, default_value_t = 10)]
        max_connections: u32,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Run a workflow definition once, in memory, and print the execution.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Trigger input as a JSON document.
        #[arg(long)]
        input: Option<String>,
        /// Tenant to run as; a random one when omitted.
        #[arg(long)]
        tenant: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind, database_url, max_connections } => {
            serve(config, &bind, &database_url, max_connections).await
        }
        Command::Migrate { database_url } => {
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("migrations applied successfully");
            Ok(())
        }
        Command::Validate { path } => validate(&config, &path),
        Command::Run { path, input, tenant } => run(config, &path, input.as_deref(), tenant).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

fn read_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).context("invalid workflow JSON")
}

fn local_engine(config: EngineConfig) -> Engine {
    Engine::builder(NodeCatalog::with_builtins(), Arc::new(InMemoryStore::new()))
        .config(config)
        .build()
}

fn validate(config: &EngineConfig, path: &Path) -> anyhow::Result<()> {
    let definition = read_definition(path)?;
    match local_engine(config.clone()).compile_workflow(&definition) {
        Ok(plan) => {
            println!("Workflow is valid. Execution order: {:?}", plan.step_order());
            Ok(())
        }
        Err(e) => {
            eprintln!("Validation failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(
    config: EngineConfig,
    path: &Path,
    input: Option<&str>,
    tenant: Option<Uuid>,
) -> anyhow::Result<()> {
    let definition = read_definition(path)?;
    let input: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("--input is not valid JSON")?,
        None => Value::Null,
    };

    let engine = local_engine(config);
    let plan = engine.compile_workflow(&definition)?;
    let execution_id = engine.start_execution(plan, tenant.unwrap_or_else(Uuid::new_v4), input)?;
    let execution = engine.wait_for_completion(execution_id).await?;

    println!("{}", serde_json::to_string_pretty(&execution)?);
    if execution.status != ExecutionStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve(
    config: EngineConfig,
    bind: &str,
    database_url: &str,
    max_connections: u32,
) -> anyhow::Result<()> {
    let pool = db::pool::create_pool(database_url, max_connections)
        .await
        .context("failed to connect to database")?;
    db::pool::ping(&pool).await.context("database is not reachable")?;

    let tenants = Arc::new(InMemoryTenantRegistry::new(config.default_tenant_limits));
    let count = tenants.refresh_from_db(&pool).await.context("failed to load tenants")?;
    info!(count, "tenant limits loaded");
    let refresher = tenants.clone().spawn_refresh(pool.clone(), config.tenant_refresh_interval());

    let engine = Engine::builder(NodeCatalog::with_builtins(), Arc::new(PgStore::new(pool.clone())))
        .config(config)
        .tenants(tenants)
        .build();

    let rows = db::repository::workflows::list_workflows(&pool)
        .await
        .context("failed to load workflows")?;
    for row in rows {
        let mut definition: WorkflowDefinition = match serde_json::from_value(row.definition) {
            Ok(definition) => definition,
            Err(e) => {
                warn!(workflow_id = %row.id, "skipping unreadable workflow: {e}");
                continue;
            }
        };
        definition.id = row.id;
        definition.version = row.version.max(1) as u32;
        if let Err(e) = engine.register_workflow(definition) {
            warn!(workflow_id = %row.id, "skipping workflow that no longer compiles: {e}");
        }
    }

    info!("starting API server on {bind}");
    let result = api::serve(bind, api::AppState::new(Arc::new(engine), Some(pool))).await;
    refresher.abort();
    result.context("API server failed")
}
