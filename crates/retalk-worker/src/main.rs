//! `retalk` command-line entry point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use retalk_media::{check_tool, progress_channel, ProgressReceiver};
use retalk_models::ProgressEvent;
use retalk_worker::{init_tracing, PipelineOrchestrator, WorkerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Segmented audio-driven lip-sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-time a video's lip movement to a new audio track
    Convert(ConvertArgs),
    /// Verify that ffmpeg and the synthesis tool can be found
    Check,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Segment length in seconds; 0 processes the inputs whole
    #[arg(long, default_value_t = 0.0)]
    segment_length: f64,
    /// Source video
    #[arg(long)]
    video: PathBuf,
    /// Target audio
    #[arg(long)]
    audio: PathBuf,
    /// Directory for the final output (overrides RETALK_OUTPUT_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Pairs synthesized at once (overrides RETALK_SYNTH_PARALLELISM)
    #[arg(long)]
    parallelism: Option<usize>,
    /// Per-segment synthesis deadline in seconds (overrides RETALK_SYNTH_TIMEOUT_SECS)
    #[arg(long)]
    timeout: Option<u64>,
    /// Print progress events as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env();

    let outcome = match cli.command {
        Commands::Convert(args) => convert(config, args).await,
        Commands::Check => check(&config).await,
    };

    if let Err(e) = outcome {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn convert(mut config: WorkerConfig, args: ConvertArgs) -> anyhow::Result<()> {
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(parallelism) = args.parallelism {
        config.synthesis_parallelism = parallelism;
    }
    if let Some(secs) = args.timeout {
        config.synthesis_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    info!("Config: {:?}", config);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let (progress_tx, progress_rx) = progress_channel(0);
    let printer = tokio::spawn(print_progress(progress_rx, args.json));

    let orchestrator = PipelineOrchestrator::from_config(config)?
        .with_progress(progress_tx)
        .with_cancel(cancel_rx);
    let result = orchestrator
        .convert(args.segment_length, &args.video, &args.audio)
        .await;

    // Closes the progress channel so the printer can finish.
    drop(orchestrator);
    printer.await.ok();

    let output = result?;
    if !args.json {
        println!("{}", output.display());
    }
    Ok(())
}

async fn print_progress(mut rx: ProgressReceiver, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Could not serialize progress event: {}", e),
            }
            continue;
        }
        if let ProgressEvent::SegmentCompleted { index, total, .. } = &event {
            eprintln!(
                "[{:>3}%] segment {}/{} done",
                event.percent().unwrap_or(0),
                index + 1,
                total
            );
        }
    }
}

async fn check(config: &WorkerConfig) -> anyhow::Result<()> {
    println!("retalk check: work_dir={}", config.work_dir.display());

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("cannot create {}", config.work_dir.display()))?;
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("cannot create {}", config.output_dir.display()))?;

    let ffmpeg = check_tool(&config.ffmpeg)?;
    println!("retalk check: ffmpeg at {}", ffmpeg.display());

    let synth = check_tool(&config.synthesis.program)?;
    println!("retalk check: synthesis tool at {}", synth.display());

    config.validate()?;
    println!("retalk check: ok");
    Ok(())
}
