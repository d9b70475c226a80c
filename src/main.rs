use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use spindle_store::{SnapshotStore, SqliteStore};

/// Spindle - inspect persisted workflow runs
#[derive(Parser)]
#[command(name = "spindle")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.spindle)
  #[arg(long, global = true, env = "SPINDLE_DATA_DIR")]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Inspect workflow runs
  Runs {
    #[command(subcommand)]
    action: RunsAction,
  },
}

#[derive(Subcommand)]
enum RunsAction {
  /// List runs of a workflow, most recently updated first
  List {
    workflow_id: String,

    /// Maximum number of runs to print
    #[arg(long)]
    limit: Option<usize>,
  },

  /// Print the full snapshot of one run
  Show { workflow_id: String, run_id: String },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".spindle"),
  };

  match cli.command {
    Some(Commands::Runs { action }) => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async { runs(action, &data_dir).await })?;
    }
    None => {
      println!("spindle - use --help to see available commands");
    }
  }

  Ok(())
}

async fn open_store(data_dir: &Path) -> Result<SqliteStore> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

  let db = data_dir.join("spindle.db");
  debug!(path = %db.display(), "opening_store");
  SqliteStore::connect(&db)
    .await
    .with_context(|| format!("failed to open database: {}", db.display()))
}

async fn runs(action: RunsAction, data_dir: &Path) -> Result<()> {
  let store = open_store(data_dir).await?;

  match action {
    RunsAction::List { workflow_id, limit } => {
      let runs = store
        .list_runs(&workflow_id, limit)
        .await
        .with_context(|| format!("failed to list runs of '{}'", workflow_id))?;
      println!("{}", serde_json::to_string_pretty(&runs)?);
    }
    RunsAction::Show {
      workflow_id,
      run_id,
    } => {
      let snapshot = store
        .load(&workflow_id, &run_id)
        .await
        .with_context(|| format!("failed to load run '{}' of '{}'", run_id, workflow_id))?;
      println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
  }

  Ok(())
}
