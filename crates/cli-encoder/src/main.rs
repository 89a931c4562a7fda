use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use encoder::{
    config::EncoderConfig,
    ffmpeg::preflight,
    notify::JobOutcome,
    scan::discover_sources,
    status::{JobRecord, StatusStore},
    worker::JobManager,
};
use log::{error, info, warn};
use std::path::{Path, PathBuf};

/// Personal media transcoding pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode one source title in the foreground (Ctrl-C stops it)
    Run {
        source: PathBuf,
    },
    /// Encode every media file under a directory, one title at a time
    Batch {
        dir: PathBuf,
    },
    /// Show job status
    Status {
        job_id: Option<String>,
        /// Print the raw status records
        #[arg(long)]
        json: bool,
    },
    /// Ask a running job to stop
    Stop {
        job_id: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();

    let cfg = EncoderConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Run { source } => run(cfg, &source).await,
        Command::Batch { dir } => batch(cfg, &dir).await,
        Command::Status { job_id, json } => status(&cfg, job_id.as_deref(), json),
        Command::Stop { job_id, reason } => stop(&cfg, &job_id, reason),
    }
}

fn manager(cfg: EncoderConfig) -> Result<JobManager> {
    info!("Output root: {}", cfg.output_root.display());
    info!("Job state dir: {}", cfg.job_state_dir.display());
    JobManager::from_config(cfg).context("Failed to set up job manager")
}

/// Wait for a job, turning Ctrl-C into a stop request. The flag reports
/// whether the user interrupted.
async fn drive(manager: &JobManager, job_id: &str) -> Result<(Option<JobOutcome>, bool)> {
    let wait = manager.wait(job_id);
    tokio::pin!(wait);
    tokio::select! {
        outcome = &mut wait => Ok((outcome, false)),
        _ = tokio::signal::ctrl_c() => {
            warn!("⏹️  Interrupted, stopping job {}", job_id);
            manager
                .stop_job(job_id, Some("interrupted".to_string()))
                .with_context(|| format!("Failed to stop job {}", job_id))?;
            Ok((wait.await, true))
        }
    }
}

async fn run(cfg: EncoderConfig, source: &Path) -> Result<()> {
    if !source.is_file() {
        bail!("Source does not exist: {}", source.display());
    }
    preflight(&cfg).await?;
    let manager = manager(cfg)?;

    let job_id = manager
        .start_job(source)
        .await
        .with_context(|| format!("Failed to start job for {}", source.display()))?;
    println!("{}", job_id);

    let (outcome, _) = drive(&manager, &job_id).await?;
    if let Some(record) = manager.get_status(&job_id)? {
        print_record(&record);
    }
    match outcome {
        Some(JobOutcome::Failed) => bail!("Job {} failed", job_id),
        Some(JobOutcome::Stopped) => bail!("Job {} stopped", job_id),
        Some(_) => Ok(()),
        None => bail!("Job {} did not finish", job_id),
    }
}

async fn batch(cfg: EncoderConfig, dir: &Path) -> Result<()> {
    let sources = discover_sources(dir)?;
    info!("Found {} source(s) under {}", sources.len(), dir.display());
    if sources.is_empty() {
        return Ok(());
    }
    preflight(&cfg).await?;
    let manager = manager(cfg)?;

    let mut failed = 0usize;
    for (i, source) in sources.iter().enumerate() {
        info!("[{}/{}] {}", i + 1, sources.len(), source.display());
        let job_id = match manager.start_job(source).await {
            Ok(id) => id,
            Err(e) => {
                error!("❌ Could not start job for {}: {}", source.display(), e);
                failed += 1;
                continue;
            }
        };
        let (outcome, interrupted) = drive(&manager, &job_id).await?;
        match outcome {
            Some(JobOutcome::Failed) | None => failed += 1,
            Some(outcome) => info!("✅ {}: {}", source.display(), outcome),
        }
        if interrupted {
            warn!("Batch interrupted after {} of {} source(s)", i + 1, sources.len());
            break;
        }
    }

    if failed > 0 {
        bail!("{} of {} source(s) failed", failed, sources.len());
    }
    Ok(())
}

fn status(cfg: &EncoderConfig, job_id: Option<&str>, json: bool) -> Result<()> {
    let store = StatusStore::from_config(cfg);
    let records = match job_id {
        Some(id) => match store.get(id)? {
            Some(record) => vec![record],
            None => bail!("No job with id {}", id),
        },
        None => store.load_all()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No jobs in {}", cfg.job_state_dir.display());
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn stop(cfg: &EncoderConfig, job_id: &str, reason: Option<String>) -> Result<()> {
    let store = StatusStore::from_config(cfg);
    let Some(record) = store.get(job_id)? else {
        bail!("No job with id {}", job_id);
    };
    if record.is_finished() {
        println!("Job {} already finished", job_id);
        return Ok(());
    }
    store
        .write_stop_command(job_id, reason)
        .with_context(|| format!("Failed to write stop command for job {}", job_id))?;
    println!("Stop requested for job {}", job_id);
    Ok(())
}

fn print_record(record: &JobRecord) {
    let state = record
        .outcome
        .map(|o| o.to_string())
        .unwrap_or_else(|| "running".to_string());
    println!(
        "{}  {}  [{}]  {}  (updated {})",
        record.job_id,
        record.filename,
        record.tier,
        state,
        record.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
    for (resolution, res) in &record.resolutions {
        let mut line = format!("    {:<6} {:<20} {:>3}%", resolution, res.stage.to_string(), res.progress);
        if let Some(reason) = &res.reason {
            line.push_str(&format!("  {}", reason));
        }
        println!("{}", line);
        for warning in &res.warnings {
            println!("           ⚠️  {}", warning);
        }
    }
}
