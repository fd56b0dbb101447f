use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use briareus::config::Config;
use briareus::core::{Capability, TaskGraph};
use briareus::error::RunError;
use briareus::orchestration::{
    AgentHandle, AgentPool, CommandAgent, FilePlanner, RunReport, Supervisor,
};
use briareus::run::{RunId, RunStatus};
use briareus::state::{EventSink, FanoutSink, JsonlSink, RunSnapshot, SnapshotStore, TracingSink};
use briareus::{Error, Result};

/// Briareus - delegates a request to research, code and writing agents
#[derive(Parser, Debug)]
#[command(name = "briareus")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    BRIAREUS_DEBUG=1     Enable debug logging (alternative to --debug)\n    BRIAREUS_LOG=<filter> Full tracing filter directive")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.briareus/briareus.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Print the full run report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a request with a decomposition read from a plan file
    Run {
        /// Plan file (JSON, or TOML with a .toml extension)
        #[arg(long)]
        plan: PathBuf,

        /// The user request
        request: String,
    },

    /// Continue an interrupted run from its last snapshot
    Resume {
        /// Run ID or unique prefix
        run_id: String,
    },

    /// Check a plan file without dispatching anything
    Validate {
        #[arg(long)]
        plan: PathBuf,
    },

    /// Show the stored state of a run
    Show {
        /// Run ID or unique prefix
        run_id: String,
    },

    /// List stored runs
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    briareus::log::init_with_debug(cli.debug);
    info!(debug = briareus::log::is_debug(), "Briareus starting");

    match cli.command {
        Command::Run { plan, request } => run_request(plan, request, cli.json),
        Command::Resume { run_id } => run_resume(&run_id, cli.json),
        Command::Validate { plan } => run_validate(plan),
        Command::Show { run_id } => run_show(&run_id, cli.json),
        Command::List => run_list(),
    }
}

fn run_request(plan: PathBuf, request: String, json: bool) -> Result<()> {
    info!(plan = %plan.display(), request = %request, "Run command");

    let config = Config::load()?;
    let store = SnapshotStore::default_location()?;
    let supervisor = Supervisor::new(&config, build_pool(&config)?).with_sink(build_sink(&store)?);
    let planner = FilePlanner::new(plan);

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        watch_ctrl_c(&supervisor);
        supervisor.run(&request, &planner).await
    });
    print_result(result, json)
}

fn run_resume(run_id: &str, json: bool) -> Result<()> {
    info!(run_id = %run_id, "Resume command");

    let config = Config::load()?;
    let store = SnapshotStore::default_location()?;
    let snapshot = store.load(&resolve_run_id(&store, run_id)?)?;
    let supervisor = Supervisor::new(&config, build_pool(&config)?).with_sink(build_sink(&store)?);

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        watch_ctrl_c(&supervisor);
        supervisor.resume(snapshot).await
    });
    print_result(result, json)
}

fn run_validate(plan: PathBuf) -> Result<()> {
    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;
    let decomposition = rt.block_on(FilePlanner::new(&plan).load())?;
    let graph = TaskGraph::build_with_limit(decomposition, Some(config.max_plan_steps))?;

    println!("Plan OK: {} sub-tasks, {} edges", graph.len(), graph.edge_count());
    println!();
    for task in graph.topological_order() {
        let deps: Vec<String> = graph
            .dependencies(task.id())
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        println!(
            "  {:<16} {:<9} depth {}{}  <- [{}]",
            task.id().to_string(),
            task.capability().to_string(),
            task.depth(),
            if task.is_output_bearing() { " output" } else { "" },
            deps.join(", ")
        );
    }
    Ok(())
}

fn run_show(run_id: &str, json: bool) -> Result<()> {
    let store = SnapshotStore::default_location()?;
    let snapshot = store.load(&resolve_run_id(&store, run_id)?)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    print_snapshot(&snapshot);
    Ok(())
}

fn run_list() -> Result<()> {
    let store = SnapshotStore::default_location()?;
    let ids = store.list()?;
    if ids.is_empty() {
        println!("No runs found in {}", store.dir().display());
        return Ok(());
    }
    for id in ids {
        match store.load(&id) {
            Ok(snapshot) => println!(
                "{}  {:<20} {}",
                id.short(),
                snapshot.run.status().to_string(),
                truncate_string(snapshot.run.request(), 50)
            ),
            Err(err) => println!("{}  unreadable: {}", id.short(), err),
        }
    }
    Ok(())
}

/// One command-backed handle per configured instance, with the configured
/// concurrency limits.
fn build_pool(config: &Config) -> Result<AgentPool> {
    let mut pool = AgentPool::new(config.max_parallel);
    for capability in Capability::ALL {
        if let Some(limit) = config.limits.for_capability(capability) {
            pool = pool.with_limit(capability, limit);
        }
    }
    for agent in &config.agents {
        let command = CommandAgent::new(agent.capability, &agent.command)?;
        if let Err(err) = command.check_available() {
            warn!(error = %err, "Agent binary not on PATH");
        }
        let handle: Arc<dyn AgentHandle> = Arc::new(command);
        for _ in 0..agent.instances {
            pool.register(Arc::clone(&handle));
        }
    }
    if config.agents.is_empty() {
        warn!("No agents configured; every sub-task will fail");
    }
    Ok(pool)
}

fn build_sink(store: &SnapshotStore) -> Result<Arc<dyn EventSink>> {
    let events = JsonlSink::open(&Config::events_path()?)?;
    Ok(Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(events))
            .with(Arc::new(store.clone())),
    ))
}

fn watch_ctrl_c(supervisor: &Supervisor) {
    let cancel = supervisor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });
}

/// Accept a full run id or a unique prefix of one.
fn resolve_run_id(store: &SnapshotStore, input: &str) -> Result<RunId> {
    if let Ok(id) = input.parse::<RunId>() {
        return Ok(id);
    }
    let matches: Vec<RunId> = store
        .list()?
        .into_iter()
        .filter(|id| id.to_string().starts_with(input))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(Error::SnapshotNotFound(input.to_string())),
        _ => Err(Error::Validation(format!(
            "Run id prefix {} is ambiguous ({} matches)",
            input,
            matches.len()
        ))),
    }
}

fn print_result(result: std::result::Result<RunReport, RunError>, json: bool) -> Result<()> {
    match result {
        Ok(report) => {
            print_report(&report, json)?;
            Ok(())
        }
        Err(RunError::Stalled(report)) => {
            print_report(&report, true)?;
            Err(Error::Run(RunError::Stalled(report)))
        }
        Err(err) => Err(err.into()),
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    eprintln!("Run {}: {}", report.run_id.short(), format_status(report.status));
    for failure in report.root_causes() {
        eprintln!(
            "  {} failed after {} attempts: {}",
            failure.subtask,
            failure.attempts.len(),
            failure.reason
        );
    }

    match (&report.output, json) {
        (Some(output), false) => print!("{}", output.body),
        _ => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn print_snapshot(snapshot: &RunSnapshot) {
    println!();
    println!("  ID:       {}", snapshot.run_id());
    println!("  Request:  {}", truncate_string(snapshot.run.request(), 60));
    println!("  Status:   {}", format_status(snapshot.run.status()));
    println!("  Saved:    {}", snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    for task in &snapshot.graph.nodes {
        println!(
            "  {:<16} {:<9} {:<10} {} attempts",
            task.id().to_string(),
            task.routed().to_string(),
            task.state().label(),
            task.attempts().len()
        );
    }
    println!();
}

fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Completed => format!("\x1b[32m{}\x1b[0m", status), // Green
        RunStatus::PartiallyCompleted => format!("\x1b[33m{}\x1b[0m", status), // Yellow
        RunStatus::Aborted => format!("\x1b[31m{}\x1b[0m", status), // Red
        RunStatus::Running => format!("\x1b[34m{}\x1b[0m", status), // Blue
        RunStatus::Planning => format!("\x1b[90m{}\x1b[0m", status), // Gray
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
