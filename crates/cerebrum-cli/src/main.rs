//! `cerebrum`: the batch jobs of a Cerebrum installation.
//!
//! Every subcommand is one job. A job opens the database named in the
//! configuration, does all of its work inside one transaction and rolls
//! that transaction back unless `--commit` is given.
//!
//! ```text
//! cerebrum --commit import-paga --file paga.xml --delete
//! cerebrum --commit process-paga --file paga.xml
//! cerebrum report --format html --output quarantines.html quarantines
//! cerebrum changelog 120-140
//! ```
//!
//! Configuration comes from `cerebrum.toml` (or `--config`), overlaid with
//! `CEREBRUM_*` environment variables, e.g. `CEREBRUM_DATABASE__PATH`.

mod commands;

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use cerebrum_core::store::IdentityStore as _;
use cerebrum_store_sqlite::SqliteStore;
use cerebrum_sync::Settings;
use clap::{Parser, ValueEnum};
use commands::Command;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cerebrum identity management batch jobs")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, global = true, default_value = "cerebrum.toml")]
  config: PathBuf,

  /// Commit the transaction. Without it every change is rolled back.
  #[arg(long, global = true, conflicts_with = "dryrun")]
  commit: bool,

  /// Roll back at the end. This is the default.
  #[arg(long, global = true)]
  dryrun: bool,

  /// Log level used when `RUST_LOG` is not set.
  #[arg(long, global = true, default_value = "info")]
  logger_level: LevelFilter,

  /// Output preset.
  #[arg(long, global = true, value_enum, default_value_t = LoggerPreset::Console)]
  logger_name: LoggerPreset,

  #[command(subcommand)]
  command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LoggerPreset {
  /// Human readable, coloured.
  Console,
  /// Compact lines without colours or targets, for cron mail.
  Cronjob,
}

fn init_logging(level: LevelFilter, preset: LoggerPreset) {
  let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
  let builder = tracing_subscriber::fmt().with_env_filter(filter);
  match preset {
    LoggerPreset::Console => builder.init(),
    LoggerPreset::Cronjob => builder.compact().with_ansi(false).with_target(false).init(),
  }
}

fn load_settings(path: &Path) -> anyhow::Result<Settings> {
  config::Config::builder()
    .add_source(config::File::from(path).required(false))
    .add_source(
      config::Environment::with_prefix("CEREBRUM").prefix_separator("_").separator("__"),
    )
    .build()
    .context("failed to read config file")?
    .try_deserialize()
    .context("failed to deserialise Settings")
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  init_logging(cli.logger_level, cli.logger_name);

  let settings = load_settings(&cli.config)?;
  let commit = cli.commit && !cli.dryrun;
  let today = chrono::Local::now().date_naive();
  let program = cli.command.name();

  let db_path = expand_tilde(&settings.database.path);
  let store = SqliteStore::open(&db_path)
    .await
    .with_context(|| format!("failed to open store at {db_path:?}"))?
    .with_change_program(program);
  info!(job = program, run_id = %store.run_id(), commit, %today, "starting");

  store.begin().await.context("failed to begin transaction")?;
  match commands::run(cli.command, &store, &settings, today).await {
    Ok(deferred) if commit => {
      store.commit().await.context("failed to commit")?;
      info!(job = program, "committed");
      if let Some(file) = deferred {
        if let Err(e) = file.write().await {
          error!(file = %file.path.display(), contents = %file.contents, "could not write file");
          return Err(e);
        }
        info!(file = %file.path.display(), "written");
      }
    }
    Ok(deferred) => {
      store.rollback().await.context("failed to roll back")?;
      if let Some(file) = deferred {
        info!(file = %file.path.display(), "dry run, file not written");
      }
      info!(job = program, "dry run, rolled back");
    }
    Err(e) => {
      error!(job = program, error = %format!("{e:#}"), "job failed, rolling back");
      if let Err(rollback) = store.rollback().await {
        error!(error = %rollback, "rollback failed");
      }
      return Err(e);
    }
  }
  Ok(())
}
