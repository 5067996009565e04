//! hopper CLI: run the drop-folder daemon or poke at one file.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hopper::admission::AdmissionFilter;
use hopper::config::Config;
use hopper::executor::{PipelineDef, PipelineExecutor, WorkExecutor};
use hopper::report::read_status_file;
use hopper::service::Service;
use hopper::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "hopper", about = "Drop-folder file processor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the input folder and process files as they arrive
    Serve {
        /// Override MAX_CONCURRENT
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Override MAX_QUEUE_SIZE
        #[arg(long)]
        max_queue_size: Option<usize>,
    },
    /// Show the status file written by a running daemon
    Status {
        /// Status file path (defaults to STATUS_FILE)
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Run the pipeline once for one file, bypassing the queue
    Run {
        /// File to process
        path: PathBuf,
    },
    /// Check whether a file would be admitted
    Check {
        /// File to check
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            max_concurrent,
            max_queue_size,
        } => cmd_serve(max_concurrent, max_queue_size).await,
        Command::Status { file } => cmd_status(file),
        Command::Run { path } => cmd_run(&path).await,
        Command::Check { path } => cmd_check(&path),
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "hopper".to_string(),
        log_level: config.log_level.clone(),
    })?)
}

fn pipeline_executor(config: &Config) -> anyhow::Result<PipelineExecutor> {
    let def = PipelineDef::load(&config.pipeline_file)?;
    Ok(PipelineExecutor::new(
        def,
        &config.output_folder,
        &config.scratch_folder,
        config.process_timeout,
    ))
}

async fn cmd_serve(
    max_concurrent: Option<usize>,
    max_queue_size: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(n) = max_concurrent {
        config.max_concurrent = n;
    }
    if let Some(n) = max_queue_size {
        config.max_queue_size = n;
    }

    let _guard = telemetry(&config)?;

    let executor = pipeline_executor(&config)?;
    tracing::info!(
        pipeline = %executor.pipeline().name,
        stages = executor.pipeline().stages.len(),
        "pipeline loaded"
    );

    let service = Arc::new(Service::new(config, Arc::new(executor))?);

    let svc = Arc::clone(&service);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        svc.shutdown();
    });

    service.run().await?;
    Ok(())
}

fn cmd_status(file: Option<PathBuf>) -> anyhow::Result<()> {
    let path = match file {
        Some(path) => path,
        None => std::env::var("STATUS_FILE")
            .map(PathBuf::from)
            .context("no --file given and STATUS_FILE is not set")?,
    };
    let status = read_status_file(&path)?;
    let stats = &status.stats;

    println!("State:       {}", status.state);
    println!("Started:     {}", stats.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Uptime:      {}s", stats.uptime_secs);
    println!("Queued:      {} / {}", stats.queue_depth, stats.capacity);
    println!("In flight:   {} / {}", stats.in_flight, stats.concurrency_limit);
    println!("Retrying:    {}", stats.retrying);
    println!("Processed:   {}", stats.processed_total);
    println!("Failed:      {}", stats.failed_total);
    println!("Retried:     {}", stats.retried_total);
    println!("Throughput:  {:.2}/min", stats.throughput_per_minute);

    if status.items.is_empty() {
        return Ok(());
    }

    println!();
    println!("{:<14}  {:<7}  {:<19}  FILE", "STATE", "ATTEMPT", "ENQUEUED");
    println!("{}", "-".repeat(72));
    for item in &status.items {
        let name = item
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| item.path.display().to_string());
        println!(
            "{:<14}  {:<7}  {:<19}  {}",
            item.state.to_string(),
            item.attempt + 1,
            item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            name
        );
    }
    println!("\n{} item(s)", status.items.len());
    Ok(())
}

async fn cmd_run(path: &Path) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = telemetry(&config)?;

    let executor = pipeline_executor(&config)?;
    let completion = executor
        .run(path)
        .await
        .with_context(|| format!("processing {}", path.display()))?;

    match completion.output {
        Some(output) => println!("Output: {}", output.display()),
        None => println!("Done (no output)"),
    }
    Ok(())
}

fn cmd_check(path: &Path) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let filter = AdmissionFilter::new(config.admission_config());

    match filter.check_path(path) {
        Ok(candidate) => {
            println!("Accepted: {} ({} bytes)", path.display(), candidate.size);
            Ok(())
        }
        Err(e) => anyhow::bail!("rejected: {}: {e}", path.display()),
    }
}
