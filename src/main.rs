use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use lava_actions::JobParser;
use lava_config::{DeviceConfig, DispatcherConfig, JobDefinition};
use lava_pipeline::{ChannelNotifier, Job, JobEvent, JobStatus};
use lava_results::{BundleStore, FsBundleStore, LogTail, ResultBundle};

/// Lava - dispatch test jobs to devices over a serial console
#[derive(Parser)]
#[command(name = "lava")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.lava)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Dispatcher configuration (default: <data dir>/dispatcher.yaml)
  #[arg(long, global = true)]
  dispatcher_config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Build the pipeline of a job and report every validation error
  Validate(JobArgs),

  /// Print the pipeline of a job as JSON
  Describe(JobArgs),

  /// Run a job against a device
  Run(JobArgs),

  /// Print the job log, starting at a byte offset
  TailLog {
    job_id: String,

    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Keep polling for new lines
    #[arg(long)]
    follow: bool,
  },
}

#[derive(Args)]
struct JobArgs {
  /// Path to the job definition (YAML)
  job_file: PathBuf,

  /// Path to the device configuration (YAML)
  #[arg(long)]
  device: PathBuf,

  /// Job id (default: a random id)
  #[arg(long)]
  job_id: Option<String>,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".lava"),
  };
  let dispatcher_path = cli
    .dispatcher_config
    .unwrap_or_else(|| data_dir.join("dispatcher.yaml"));
  let dispatcher = DispatcherConfig::load_or_default(&dispatcher_path, &data_dir)
    .context("failed to load dispatcher configuration")?;

  match cli.command {
    Some(Commands::Validate(args)) => {
      init_logging(None)?;
      validate(args, dispatcher)?;
    }
    Some(Commands::Describe(args)) => {
      init_logging(None)?;
      describe(args, dispatcher)?;
    }
    Some(Commands::Run(args)) => {
      run(args, dispatcher)?;
    }
    Some(Commands::TailLog {
      job_id,
      offset,
      follow,
    }) => {
      let store = FsBundleStore::new(&dispatcher.results_dir);
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(tail_log(store.log_path(&job_id), offset, follow))?;
    }
    None => {
      println!("lava - use --help to see available commands");
    }
  }

  Ok(())
}

/// Human output on stderr, plus the JSON-lines job log when a path is
/// given.
fn init_logging(job_log: Option<&Path>) -> Result<()> {
  let file_layer = match job_log {
    Some(path) => {
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
          .with_context(|| format!("failed to create {}", parent.display()))?;
      }
      let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create job log: {}", path.display()))?;
      Some(fmt::layer().json().with_writer(Mutex::new(file)))
    }
    None => None,
  };

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();
  Ok(())
}

fn build_job(args: &JobArgs, dispatcher: DispatcherConfig) -> Result<Job> {
  let definition = JobDefinition::load(&args.job_file)
    .with_context(|| format!("failed to load job file: {}", args.job_file.display()))?;
  let device = DeviceConfig::load(&args.device)
    .with_context(|| format!("failed to load device file: {}", args.device.display()))?;
  let job_id = args
    .job_id
    .clone()
    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

  let job = JobParser::builtin()
    .parse(job_id, definition, device, dispatcher)
    .context("failed to build pipeline")?;
  Ok(job)
}

fn validate(args: JobArgs, dispatcher: DispatcherConfig) -> Result<()> {
  let mut job = build_job(&args, dispatcher)?;
  let errors = job.validate();
  if !errors.is_empty() {
    for error in &errors {
      eprintln!("  {}", error);
    }
    bail!("job {} is invalid ({} errors)", job.id(), errors.len());
  }
  println!("job {} is valid", job.id());
  Ok(())
}

fn describe(args: JobArgs, dispatcher: DispatcherConfig) -> Result<()> {
  let job = build_job(&args, dispatcher)?;
  println!("{}", serde_json::to_string_pretty(&job.describe())?);
  Ok(())
}

fn run(args: JobArgs, dispatcher: DispatcherConfig) -> Result<()> {
  let store = FsBundleStore::new(&dispatcher.results_dir);
  let job = build_job(&args, dispatcher)?;
  init_logging(Some(&store.log_path(job.id())))?;

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run_async(job, store).await })
}

async fn run_async(job: Job, store: FsBundleStore) -> Result<()> {
  let (sender, mut events) = mpsc::unbounded_channel();
  let job = job.with_notifier(Arc::new(ChannelNotifier::new(sender)));

  let printer = tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      if let JobEvent::TestResult { result, .. } = event {
        eprintln!(
          "{}/{}: {}",
          result.suite,
          result.test_case_id,
          result.result.as_str()
        );
      }
    }
  });

  let cancel = CancellationToken::new();
  let on_interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, canceling job");
      on_interrupt.cancel();
    }
  });

  let outcome = job.run(None, cancel).await;
  // The notifier went away with the job, so the printer drains and ends.
  let _ = printer.await;

  let bundle = ResultBundle::from_outcome(&outcome);
  store
    .put(&bundle)
    .await
    .context("failed to store result bundle")?;
  info!(job_id = %outcome.job_id, status = %outcome.status, "bundle_written");

  for error in &outcome.errors {
    eprintln!("error: {}", error);
  }
  println!(
    "{}",
    serde_json::to_string_pretty(&serde_json::json!({
      "job_id": outcome.job_id,
      "status": outcome.status.as_str(),
      "results": bundle.result_count(),
      "duration_ms": bundle.duration_ms,
    }))?
  );

  match outcome.status {
    JobStatus::Pass | JobStatus::Fail => Ok(()),
    status => bail!("job {} {}", outcome.job_id, status),
  }
}

async fn tail_log(path: PathBuf, mut offset: u64, follow: bool) -> Result<()> {
  let tail = LogTail::new(&path);
  let mut stdout = std::io::stdout();
  loop {
    let chunk = tail
      .read_from(offset)
      .await
      .with_context(|| format!("failed to read job log: {}", path.display()))?;
    stdout.write_all(chunk.text.as_bytes())?;
    stdout.flush()?;
    offset = chunk.next_offset;

    if !follow {
      return Ok(());
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
  }
}
