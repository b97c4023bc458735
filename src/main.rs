use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use legend_config::{EngineConfig, StoreConfig};
use legend_orchestrator::{Orchestrator, ResultStatus};
use legend_workflow::EventRecord;

/// Legend - durable analyze → transform runs for comedy scenes
#[derive(Parser)]
#[command(name = "legend")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.legend)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Engine config file (default: <data-dir>/config.json when present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the workflow for a scene and print its result
  Run {
    /// Scene to analyze and remix
    scene_id: String,

    /// Seconds to wait for the result
    #[arg(long, default_value_t = 300)]
    timeout: u64,
  },

  /// Print the recorded history of a run
  History {
    run_id: String,
  },

  /// Print the effective configuration
  Config,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".legend"),
  };
  let config = load_config(cli.config.as_deref(), &data_dir)?;

  match cli.command {
    Some(Commands::Run { scene_id, timeout }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_scene(config, data_dir, scene_id, Duration::from_secs(timeout)))
    }
    Some(Commands::History { run_id }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(print_history(config, run_id))
    }
    Some(Commands::Config) => {
      println!("{}", serde_json::to_string_pretty(&config)?);
      Ok(())
    }
    None => {
      println!("legend - use --help to see available commands");
      Ok(())
    }
  }
}

/// Explicit file, then `<data-dir>/config.json`, then defaults that keep
/// history and manifests under the data directory.
fn load_config(path: Option<&Path>, data_dir: &Path) -> Result<EngineConfig> {
  let default_path = data_dir.join("config.json");
  let path = match path {
    Some(path) => Some(path.to_path_buf()),
    None if default_path.exists() => Some(default_path),
    None => None,
  };

  match path {
    Some(path) => EngineConfig::from_file(&path)
      .with_context(|| format!("failed to load config: {}", path.display())),
    None => {
      let mut config = EngineConfig::default();
      config.store = StoreConfig::Sqlite {
        url: format!("sqlite://{}", data_dir.join("legend.db").display()),
      };
      config.output_dir = data_dir.join("manifests");
      Ok(config)
    }
  }
}

async fn run_scene(
  config: EngineConfig,
  data_dir: PathBuf,
  scene_id: String,
  timeout: Duration,
) -> Result<()> {
  tokio::fs::create_dir_all(&data_dir)
    .await
    .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;

  let orchestrator = std::sync::Arc::new(
    Orchestrator::from_config(config)
      .await
      .context("failed to start orchestrator")?,
  );

  let archived = orchestrator
    .sweep_retention()
    .await
    .context("retention sweep failed")?;
  if archived > 0 {
    info!(archived, "archived_finished_runs");
  }

  let cancel = CancellationToken::new();
  let workers = {
    let orchestrator = orchestrator.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { orchestrator.run(cancel).await })
  };

  let handle = orchestrator
    .client()
    .submit(&scene_id)
    .await
    .context("failed to submit run")?;
  eprintln!("Submitted run: {}", handle.run_id());

  let result = tokio::select! {
    result = handle.result(timeout) => result?,
    _ = tokio::signal::ctrl_c() => {
      warn!(run_id = handle.run_id(), "interrupted");
      handle.cancel().await?;
      handle.result(timeout).await?
    }
  };

  cancel.cancel();
  workers.await.context("worker pool panicked")?;

  println!("{}", serde_json::to_string_pretty(&result)?);

  match result.status {
    ResultStatus::Completed => Ok(()),
    ResultStatus::Failed => bail!("run {} failed", result.run_id),
    ResultStatus::Pending => bail!(
      "run {} still pending after {}s",
      result.run_id,
      timeout.as_secs()
    ),
  }
}

async fn print_history(config: EngineConfig, run_id: String) -> Result<()> {
  let store = legend_store::connect(&config.store)
    .await
    .context("failed to open store")?;

  let history: Vec<EventRecord> = match store.read_history(&run_id).await {
    Err(legend_store::Error::NotFound(_)) => store.read_archived(&run_id).await,
    other => other,
  }
  .with_context(|| format!("failed to read history for run {run_id}"))?;

  if let Some(reason) = store.quarantine_reason(&run_id).await? {
    eprintln!("Run is quarantined: {reason}");
  }
  println!("{}", serde_json::to_string_pretty(&history)?);

  Ok(())
}
