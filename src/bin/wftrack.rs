//! wftrack CLI: serve the run tracking API and inspect runs.

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use workflow_tracker::api::{self, AppState};
use workflow_tracker::config::Config;
use workflow_tracker::config::secrets::ExposeSecret;
use workflow_tracker::db::Db;
use workflow_tracker::model::{RunFilter, RunStatus};
use workflow_tracker::steps::StepsRegistry;
use workflow_tracker::store::{MemoryStore, RunStore};
use workflow_tracker::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use workflow_tracker::tracker::{PhaseProgress, StepStatus, StuckWatcher, Tracker, WatchConfig};

#[derive(Parser)]
#[command(name = "wftrack", about = "Run tracking for automation pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API, with the stuck watcher unless disabled
    Serve,
    /// Run one stuck scan and exit
    ScanStuck {
        /// Override TRACKER_STUCK_THRESHOLD_MS
        #[arg(long)]
        threshold_ms: Option<u64>,
    },
    /// Run operations
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by bundle
        #[arg(long)]
        bundle: Option<String>,
        /// Maximum runs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a run and its progress tree
    Show {
        /// External run id
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::ScanStuck { threshold_ms } => cmd_scan_stuck(config, threshold_ms).await,
        Command::Runs { action } => {
            let tracker = open_tracker(&config, true).await?;
            match action {
                RunsAction::List {
                    status,
                    bundle,
                    limit,
                } => cmd_runs_list(&tracker, status, bundle, limit).await,
                RunsAction::Show { run_id } => cmd_runs_show(&tracker, &run_id).await,
            }
        }
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "wftrack".to_string(),
        default_filter: config.log_level.clone(),
    })?)
}

fn load_steps(dir: &Path) -> anyhow::Result<StepsRegistry> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "steps dir not found, every bundle uses the builtin phases");
        return Ok(StepsRegistry::empty());
    }
    let registry = StepsRegistry::load_from_dir(dir)?;
    info!(dir = %dir.display(), bundles = registry.len(), "step definitions loaded");
    Ok(registry)
}

/// Build a tracker over Postgres, or over memory when no database is configured.
async fn open_tracker(config: &Config, require_db: bool) -> anyhow::Result<Tracker> {
    let store: Arc<dyn RunStore> = match config.database_url {
        Some(ref url) => {
            let db = Db::connect(url.expose_secret()).await?;
            db.migrate().await?;
            Arc::new(db)
        }
        None if require_db => anyhow::bail!("DATABASE_URL must be set for this command"),
        None => {
            warn!("DATABASE_URL not set, runs are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let steps = load_steps(&config.steps_dir)?;
    Ok(Tracker::new(store, Arc::new(steps)))
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = telemetry(&config)?;
    let tracker = open_tracker(&config, false).await?;

    let watcher = config.stuck_scan_interval.map(|interval| {
        StuckWatcher::new(
            tracker.clone(),
            WatchConfig {
                interval,
                threshold: config.stuck_threshold,
            },
        )
    });
    if let Some(ref watcher) = watcher {
        let w = watcher.clone();
        tokio::spawn(async move { w.run().await });
    } else {
        info!("stuck watcher disabled, expecting an external scheduler");
    }

    let app = api::router(AppState::new(tracker).with_stuck_threshold(config.stuck_threshold));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "run tracker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await?;

    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    Ok(())
}

async fn cmd_scan_stuck(config: Config, threshold_ms: Option<u64>) -> anyhow::Result<()> {
    let _guard = telemetry(&config)?;
    let tracker = open_tracker(&config, true).await?;
    let threshold = threshold_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or(config.stuck_threshold);

    let report = tracker.detect_and_mark_stuck(threshold).await?;
    println!("{} run(s) marked stuck", report.count());
    for run_id in &report.marked {
        println!("  {run_id}");
    }
    for failure in &report.failures {
        eprintln!("  {} failed: {}", failure.run_id, failure.error);
    }
    if !report.failures.is_empty() {
        anyhow::bail!("{} run(s) could not be updated", report.failures.len());
    }
    Ok(())
}

async fn cmd_runs_list(
    tracker: &Tracker,
    status: Option<String>,
    bundle: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let status: Option<RunStatus> = status.map(|s| s.parse()).transpose()?;
    let list = tracker
        .list_runs(&RunFilter {
            status,
            bundle,
            limit: Some(limit),
            offset: None,
        })
        .await?;

    if list.runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<28}  {:<12}  {:<8}  {:<24}  STARTED",
        "RUN", "BUNDLE", "STATUS", "AT"
    );
    println!("{}", "-".repeat(96));
    for run in &list.runs {
        let at = match (&run.current_phase, &run.current_substep) {
            (Some(phase), Some(substep)) => format!("{phase}/{substep}"),
            _ => "-".to_string(),
        };
        println!(
            "{:<28}  {:<12}  {:<8}  {:<24}  {}",
            run.run_id,
            run.bundle,
            run.status,
            at,
            run.started_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!(
        "\n{} shown, {} running, {} total",
        list.runs.len(),
        list.running_count,
        list.total_count
    );
    Ok(())
}

async fn cmd_runs_show(tracker: &Tracker, run_id: &str) -> anyhow::Result<()> {
    let view = tracker.get_run_with_progress(run_id).await?;
    let run = &view.run;

    println!("Run:       {}", run.run_id);
    println!("Bundle:    {}", run.bundle);
    if let Some(ref workflow) = run.workflow {
        println!("Workflow:  {workflow}");
    }
    println!("Status:    {}", run.status);
    println!("Started:   {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(ended) = run.ended_at {
        println!("Ended:     {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(ms) = run.total_duration_ms {
        println!("Duration:  {:.1}s", ms as f64 / 1000.0);
    }
    println!("Events:    {}", view.events_count);
    println!();

    for phase in &view.phases {
        print_phase(phase);
    }
    Ok(())
}

fn marker(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "[ ]",
        StepStatus::Running => "[>]",
        StepStatus::Success => "[x]",
        StepStatus::Fail => "[!]",
        StepStatus::Stuck => "[?]",
    }
}

fn print_phase(phase: &PhaseProgress) {
    let extra = if phase.declared { "" } else { "  (undeclared)" };
    println!("{} {}{extra}", marker(phase.status), phase.name);
    for step in &phase.substeps {
        let duration = step
            .duration_ms
            .map(|ms| format!("  {:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        let optional = if step.optional { "  (optional)" } else { "" };
        println!("    {} {}{duration}{optional}", marker(step.status), step.name);
        if let Some(ref message) = step.message {
            println!("        {message}");
        }
    }
}
