use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use orbitmesh::config::OrbitMeshConfig;
use orbitmesh::rpc_hub::build_config_addr;
use orbitmesh::OrbitMeshContext;
use tracing::info;

#[derive(Parser)]
#[command(name = "orbitmesh", about = "OrbitMesh — distributed agent control plane", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Agent WebSocket port
    #[arg(long, env = "ORBITMESH_PORT")]
    port: Option<u16>,

    /// Data directory for config.toml
    #[arg(long, env = "ORBITMESH_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ORBITMESH_LOG")]
    log: Option<String>,

    /// Optional path to a daily-rolling log file; logs to stdout only if unset.
    #[arg(long, env = "ORBITMESH_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server: agent WebSocket hub + REST API + background loops (default).
    Serve,
    /// Dead-letter queue operator commands.
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Agent registry introspection.
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Job introspection.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead-lettered jobs.
    List,
    /// Mark a dead-lettered job for retry.
    Retry { entry_id: String },
    /// Purge the entire dead-letter queue.
    Purge,
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List registered agents.
    List,
}

#[derive(Subcommand)]
enum JobsAction {
    /// Fetch one job by id.
    Get { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = OrbitMeshConfig::new(args.port, args.data_dir, args.log);
    let _guard = init_tracing(&config.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Dlq { action } => dlq_command(config, action).await,
        Command::Agents { action } => agents_command(config, action).await,
        Command::Jobs { action } => jobs_command(config, action).await,
    }
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file; otherwise stdout only. Returns a
/// `WorkerGuard` that must stay alive for the process lifetime.
///
/// Falls back to stdout-only if the log directory can't be created — never
/// panics on a bad log path.
fn init_tracing(log: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = || {
        tracing_subscriber::EnvFilter::try_new(log).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("orbitmesh.log"));
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
        tracing_subscriber::fmt().with_env_filter(filter()).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();
    Some(guard)
}

/// Build the context and run until `ctrl_c`, then broadcast `shutdown` to
/// every connected agent and stop the background loops (§C.4).
async fn serve(config: OrbitMeshConfig) -> Result<()> {
    let addr = build_config_addr(&config);
    let rest_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.rest_port));
    let ctx = OrbitMeshContext::build(config);
    ctx.spawn_background_tasks();

    let hub = ctx.hub.clone();
    let hub_shutdown = ctx.shutdown_rx();
    let hub_task = tokio::spawn(async move { hub.run(addr, hub_shutdown).await });
    let rest_task = tokio::spawn(orbitmesh::rest::serve(ctx.clone(), rest_addr));

    info!(%addr, %rest_addr, "OrbitMesh server started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    ctx.trigger_shutdown();

    let _ = hub_task.await;
    let _ = rest_task.await;
    info!("OrbitMesh server stopped");
    Ok(())
}

async fn dlq_command(config: OrbitMeshConfig, action: DlqAction) -> Result<()> {
    let ctx = OrbitMeshContext::build(config);
    match action {
        DlqAction::List => {
            let entries = ctx.orchestrator.dead_letter().list().await;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        DlqAction::Retry { entry_id } => {
            let entry = ctx
                .orchestrator
                .dead_letter()
                .get(&entry_id)
                .await
                .context("no such dead-letter entry")?;
            ctx.orchestrator.dead_letter().mark_for_retry(&entry_id).await;
            let result = ctx.orchestrator.resubmit(entry.job.request).await;
            ctx.orchestrator.dead_letter().remove(&entry_id).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        DlqAction::Purge => {
            let count = ctx.orchestrator.dead_letter().purge_all().await;
            println!("purged {count} entries");
        }
    }
    Ok(())
}

async fn agents_command(config: OrbitMeshConfig, action: AgentsAction) -> Result<()> {
    let ctx = OrbitMeshContext::build(config);
    match action {
        AgentsAction::List => {
            let agents = ctx.registry.list().await;
            println!("{}", serde_json::to_string_pretty(&agents)?);
        }
    }
    Ok(())
}

async fn jobs_command(config: OrbitMeshConfig, action: JobsAction) -> Result<()> {
    let ctx = OrbitMeshContext::build(config);
    match action {
        JobsAction::Get { job_id } => {
            let job = ctx.orchestrator.get_job(&job_id).await.context("no such job")?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }
    Ok(())
}
