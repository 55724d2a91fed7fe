use anyhow::Result;
use fable_core::{AppError, OutputFormat, RunSummary, TaskKind};
use fable_scheduler::{ArtifactStore, GenerationRun, TracingStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::http_generator::HttpGenerator;
use crate::project::{determine_project_root, load_config, resolve};
use crate::store::FsArtifactStore;
use crate::task_list::load_tasks;

pub(crate) struct RunArgs {
    pub kind: TaskKind,
    pub tasks: PathBuf,
    pub config: Option<PathBuf>,
    pub workers: Option<usize>,
    pub overwrite: bool,
    pub strict_tiers: bool,
    pub cd: Option<String>,
}

/// Handle `fable run`. Returns the process exit code.
pub(crate) async fn handle_run(args: RunArgs, format: OutputFormat) -> Result<i32> {
    let project_root = determine_project_root(args.cd.as_deref())?;
    let config = load_config(&project_root, args.config.as_deref())?;
    let tasks = load_tasks(&resolve(&project_root, &args.tasks))?;

    let candidates = config.candidates(args.kind);
    if candidates.is_empty() {
        let err = AppError::ConfigurationExhausted {
            kind: args.kind.to_string(),
        };
        warn!("{err}; every task will fail");
    }

    let output_dir = resolve(&project_root, &config.run.output_dir);
    let store = Arc::new(FsArtifactStore::new(output_dir));
    let generator = Arc::new(HttpGenerator::new(
        args.kind,
        &config,
        Arc::clone(&store),
    )?);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling run");
            interrupt.cancel();
        }
    });

    let run = GenerationRun::new(
        args.kind,
        candidates,
        config.capacity_limits(),
        generator,
    )
    .workers(args.workers.unwrap_or(config.run.workers))
    .overwrite(args.overwrite || config.run.overwrite)
    .strict_tiers(args.strict_tiers || config.run.strict_tiers)
    .poll_interval(config.run.poll_interval())
    .progress_interval(config.run.progress_interval())
    .straggler_timeout(config.run.straggler_timeout())
    .cancellation(cancel)
    .store(store as Arc<dyn ArtifactStore>);

    let run = match format {
        OutputFormat::Text => run.status_sink(|line: &str| eprintln!("[fable] {line}")),
        OutputFormat::Json => run.status_sink(TracingStatus),
    };

    info!(kind = %args.kind, tasks = tasks.len(), "Starting generation run");
    let summary = run.run(tasks).await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => print_summary_text(&summary),
    }

    Ok(if summary.has_failures() { 1 } else { 0 })
}

fn print_summary_text(summary: &RunSummary) {
    println!("Run {}", summary.run_id);
    println!(
        "  {} succeeded, {} failed, {} skipped ({:.1}s)",
        summary.success.len(),
        summary.failed.len(),
        summary.skipped.len(),
        (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0
    );
    for (label, keys) in [
        ("failed", &summary.failed),
        ("skipped", &summary.skipped),
    ] {
        if !keys.is_empty() {
            println!("  {label}: {}", keys.join(", "));
        }
    }
}
