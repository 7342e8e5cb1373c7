use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sluice_client::gitlab::{self, GitlabPlugin, GitlabProjectLookup};
use sluice_client::{HeaderToken, ReqwestTransport};
use sluice_core::client::AsyncClient;
use sluice_core::collector::CollectorConfig;
use sluice_core::compiler::{ConnectionInfo, PlanCompiler};
use sluice_core::models::{Partition, SyncPolicy};
use sluice_core::plan::{Options, PipelinePlan, PipelineTask, ScopeConfig};
use sluice_core::registry::PluginRegistry;
use sluice_core::runner::{TracingTaskReporter, run_task};
use sluice_core::traits::StagingStore;
use sluice_db::{Database, DatabaseConfig, StagingRepository};

/// Uncommitted rows older than this are treated as abandoned.
const ABANDONED_AFTER_HOURS: i64 = 24;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Rate-limited DevOps data collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// GitLab connection shared by every command that talks to the API.
#[derive(Args)]
struct ConnectionArgs {
    /// GitLab REST endpoint, e.g. https://gitlab.com/api/v4
    #[arg(long, env = "GITLAB_ENDPOINT")]
    endpoint: String,

    /// Personal access token (PRIVATE-TOKEN header)
    #[arg(long, env = "GITLAB_TOKEN", hide_env_values = true)]
    token: String,

    /// Connection id used in partition keys and domain ids
    #[arg(long, env = "SLUICE_CONNECTION_ID", default_value_t = 1)]
    connection_id: u64,

    /// HTTP(S) or SOCKS5 proxy for API and clone traffic
    #[arg(long, env = "SLUICE_PROXY")]
    proxy: Option<String>,

    /// Maximum calls in flight
    #[arg(long, env = "API_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "API_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Static request ceiling until the server reports its own limit
    #[arg(long, env = "API_REQUESTS_PER_HOUR")]
    requests_per_hour: Option<u32>,

    /// Statuses treated as empty pages (repeatable)
    #[arg(long = "ignore-status")]
    ignore_statuses: Vec<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a blueprint file into a pipeline plan (JSON on stdout)
    Plan {
        /// Blueprint JSON: {"scopes": [...], "syncPolicy": {...}}
        #[arg(short, long)]
        blueprint: PathBuf,

        /// Print the plan even when some scopes failed to compile
        #[arg(long, default_value_t = false)]
        allow_partial: bool,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Run GitLab collection subtasks for one project into the staging table
    Collect {
        /// GitLab project id
        #[arg(short, long)]
        project_id: u64,

        /// Subtasks to run (comma separated); defaults to every enabled one
        #[arg(short, long, value_delimiter = ',')]
        subtasks: Vec<String>,

        /// Only fetch items updated since the last committed run
        #[arg(long, default_value_t = false)]
        incremental: bool,

        /// Force a full collection even when a cursor is stored
        #[arg(long, default_value_t = false)]
        full_sync: bool,

        /// Ignore items older than this RFC 3339 timestamp
        #[arg(long)]
        time_after: Option<DateTime<Utc>>,

        #[arg(long, default_value_t = 100)]
        page_size: usize,

        /// Retries of a transient page failure
        #[arg(long, default_value_t = 0)]
        retries: u32,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Print the committed rows of one partition as JSON lines
    Rows {
        #[arg(short, long)]
        project_id: u64,

        /// Staging table, e.g. gitlab_api_issues
        #[arg(short, long)]
        table: String,

        #[arg(long, env = "SLUICE_CONNECTION_ID", default_value_t = 1)]
        connection_id: u64,

        /// Number of rows to print
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

/// Blueprint file: the scopes of one GitLab connection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blueprint {
    scopes: Vec<ScopeConfig>,
    #[serde(default)]
    sync_policy: Option<SyncPolicy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sluice=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            blueprint,
            allow_partial,
            connection,
        } => cmd_plan(&blueprint, allow_partial, &connection).await?,
        Commands::Collect {
            project_id,
            subtasks,
            incremental,
            full_sync,
            time_after,
            page_size,
            retries,
            connection,
        } => {
            let policy = SyncPolicy {
                time_after,
                full_sync,
            };
            let config = CollectorConfig::default()
                .with_page_size(page_size)
                .with_incremental(incremental)
                .with_retries(retries, Duration::from_secs(2))
                .with_sync_policy(policy);
            let repo = connect_db().await?;
            cmd_collect(project_id, subtasks, config, &connection, repo).await?;
        }
        Commands::Rows {
            project_id,
            table,
            connection_id,
            limit,
        } => {
            let repo = connect_db().await?;
            cmd_rows(project_id, &table, connection_id, limit, &repo).await?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and run migrations.
async fn connect_db() -> Result<StagingRepository> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db.staging_repo())
}

fn api_client(args: &ConnectionArgs) -> Result<AsyncClient<ReqwestTransport>> {
    let mut config = gitlab::client_config(&args.endpoint)
        .with_concurrency(args.concurrency)
        .with_timeout(Duration::from_secs(args.timeout));
    if let Some(requests) = args.requests_per_hour {
        config = config.with_requests_per_hour(requests);
    }
    for status in &args.ignore_statuses {
        config = config.with_ignore_status(*status);
    }

    let transport = ReqwestTransport::from_config(&config, args.proxy.as_deref())
        .context("Failed to create HTTP client")?;
    AsyncClient::builder(transport, config)
        .with_request_hook(HeaderToken::gitlab(args.token.as_str()))
        .build()
        .context("Invalid client configuration")
}

/// Cancel the token on Ctrl-C so in-flight runs abort cleanly.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, aborting current run");
            trigger.cancel();
        }
    });
    cancel
}

fn read_blueprint(path: &Path) -> Result<Blueprint> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read blueprint file: {}", path.display()))?;
    serde_json::from_str(&raw).context("Invalid blueprint JSON")
}

/// Hand the blueprint's sync policy to every GitLab task.
fn apply_sync_policy(plan: &mut PipelinePlan, policy: &SyncPolicy) -> Result<()> {
    let value = serde_json::to_value(policy)?;
    for stage in &mut plan.0 {
        for task in &mut stage.0 {
            if task.plugin == gitlab::PLUGIN_NAME {
                task.options.insert("syncPolicy".into(), value.clone());
            }
        }
    }
    Ok(())
}

async fn cmd_plan(path: &Path, allow_partial: bool, args: &ConnectionArgs) -> Result<()> {
    let blueprint = read_blueprint(path)?;
    let registry = PluginRegistry::new()
        .with(gitlab::descriptor())
        .map_err(|e| anyhow::anyhow!(e))?;
    let lookup = GitlabProjectLookup::new(api_client(args)?);

    let mut connection = ConnectionInfo::new(args.connection_id, args.token.as_str());
    if let Some(proxy) = &args.proxy {
        connection = connection.with_proxy(proxy.as_str());
    }

    let compiled = PlanCompiler::new(&registry, lookup)
        .compile(
            gitlab::PLUGIN_NAME,
            &gitlab::subtasks::<ReqwestTransport, StagingRepository>(),
            &connection,
            &blueprint.scopes,
        )
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    for failure in &compiled.failures {
        tracing::error!(scope = failure.index, error = %failure.error, "Scope skipped");
    }
    let complete = compiled.is_complete();
    let failed = compiled.failures.len();
    let mut plan = compiled.plan;
    if !complete && !allow_partial {
        anyhow::bail!("{failed} scope(s) failed to compile; rerun with --allow-partial to print the rest");
    }
    if let Some(policy) = &blueprint.sync_policy {
        apply_sync_policy(&mut plan, policy)?;
    }

    tracing::info!(stages = plan.len(), tasks = plan.task_count(), "Plan compiled");
    println!("{}", plan.to_json().map_err(|e| anyhow::anyhow!(e))?);
    Ok(())
}

async fn cmd_collect(
    project_id: u64,
    subtasks: Vec<String>,
    config: CollectorConfig,
    args: &ConnectionArgs,
    repo: StagingRepository,
) -> Result<()> {
    let cutoff = Utc::now() - chrono::Duration::hours(ABANDONED_AFTER_HOURS);
    let discarded = repo
        .discard_abandoned(cutoff)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    if discarded > 0 {
        tracing::info!(discarded, "Discarded rows of abandoned runs");
    }

    let plugin = GitlabPlugin::new(api_client(args)?, repo, config);
    let mut options = Options::new();
    options.insert("connectionId".into(), args.connection_id.into());
    options.insert("projectId".into(), project_id.into());
    let task = PipelineTask::new(gitlab::PLUGIN_NAME, subtasks, options);

    let ran = run_task(&plugin, &task, &cancel_on_ctrl_c(), &TracingTaskReporter)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    println!("{}", serde_json::to_string_pretty(&ran)?);
    Ok(())
}

async fn cmd_rows(
    project_id: u64,
    table: &str,
    connection_id: u64,
    limit: Option<usize>,
    repo: &StagingRepository,
) -> Result<()> {
    let partition = Partition::new(
        connection_id,
        serde_json::json!({ "projectId": project_id }),
        table,
    );
    let rows = repo
        .load_partition(&partition.key())
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if rows.is_empty() {
        tracing::info!(%table, project_id, "No committed rows");
        return Ok(());
    }

    for row in rows.iter().take(limit.unwrap_or(usize::MAX)) {
        let line = serde_json::json!({
            "id": row.id,
            "runId": row.run_id,
            "input": row.input,
            "data": row.payload().map_err(|e| anyhow::anyhow!(e))?,
            "createdAt": row.created_at,
        });
        println!("{line}");
    }
    tracing::info!(rows = rows.len(), "Partition dumped");
    Ok(())
}
