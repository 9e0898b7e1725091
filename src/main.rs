//! CLI entry point for the datasync tool.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use datasync::{
    Dispatcher, ExecutionEngine, FetchClient, IndicatifProgress, NoProgress, Planner,
    ProgressSink, RunOutcome, default_extractor, prepare,
};
use tracing::{debug, error, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let Some((annotations_dir, images_dir)) = args.directories() else {
        bail!("nothing to pull: pass --annotations and --images, or --dataset and --release");
    };

    let engine = match args.workers {
        Some(workers) => ExecutionEngine::new(usize::from(workers))?,
        None => ExecutionEngine::with_available_parallelism(),
    };

    let progress: Arc<dyn ProgressSink> = if args.quiet || args.plan_only {
        Arc::new(NoProgress)
    } else {
        Arc::new(IndicatifProgress::new(engine.workers()))
    };

    let api_key = args.api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        warn!("no API key given; only pre-signed URLs will succeed");
    }
    let client = FetchClient::new(api_key).with_progress(Arc::clone(&progress));

    info!(
        annotations = %annotations_dir.display(),
        images = %images_dir.display(),
        "preparing pull"
    );
    let planner = Planner::new(client.clone());
    let pull = prepare(&planner, &annotations_dir, &images_dir, &args.pull_options())
        .await
        .context("failed to prepare pull")?;

    for (path, reason) in &pull.blocked {
        warn!(annotation = %path.display(), %reason, "skipping annotation");
    }

    // Without an extractor only the segment tasks fail; everything else still runs.
    let mut dispatcher = Dispatcher::new(client);
    if pull.plan.requires_frame_extraction() && !args.plan_only {
        match default_extractor() {
            Ok(extractor) => dispatcher = dispatcher.with_extractor(extractor),
            Err(e) => error!(error = %e, "long-video segments will fail"),
        }
    }

    let engine = engine.with_progress(progress);
    let outcome = engine
        .run(
            Arc::new(dispatcher),
            pull.plan,
            !args.plan_only,
            !args.sequential,
        )
        .await?;

    match outcome {
        RunOutcome::Deferred(plan) => {
            let mut stdout = io::stdout().lock();
            for task in &plan {
                writeln!(stdout, "{}", serde_json::to_string(task)?)?;
            }
            info!(tasks = plan.len(), "plan printed");
            Ok(())
        }
        RunOutcome::Completed(report) => {
            for (task, reason) in &report.failures {
                error!(url = %task.url(), %reason, "download failed");
            }
            info!(
                downloaded = report.success_count(),
                failed = report.error_count(),
                skipped_existing = pull.skipped_existing,
                blocked = pull.blocked.len(),
                removed = pull.removed.len(),
                "pull complete"
            );
            let problems = report.error_count() + pull.blocked.len();
            if problems > 0 {
                bail!("{problems} download(s) or annotation(s) failed");
            }
            Ok(())
        }
    }
}
