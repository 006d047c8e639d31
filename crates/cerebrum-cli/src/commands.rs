//! One subcommand per batch job.

use std::{
  io::Write as _,
  path::{Path, PathBuf},
};

use anyhow::Context as _;
use cerebrum_core::{
  code::{ExternalIdType, QuarantineType, SourceSystem},
  entity::EntityId,
  range::IdRange,
};
use cerebrum_report::{
  Format, Report,
  reports::{self, ChangeSelection},
};
use cerebrum_source::{ou, paga, sito, sysx};
use cerebrum_store_sqlite::SqliteStore;
use cerebrum_sync::{
  Settings,
  accounts::{paga::process_paga, sito::process_sito, systemx::process_systemx},
  bootstrap,
  import::{ou::import_ous, paga::import_paga, sito as sito_import, sysx::import_systemx},
  ou_groups::sync_ou_groups,
};
use chrono::NaiveDate;
use clap::Subcommand;
use sha2::{Digest, Sha256};
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Create the initial account, group and posix group, and register the
  /// configured spreads.
  Init,

  /// Import organisational units from a `stedkode;name;...` file.
  ImportOu {
    #[arg(long)]
    file:   PathBuf,
    /// Source system recorded on the OU rows.
    #[arg(long, default_value = "PAGA")]
    source: SourceSystem,
  },

  /// Import persons and affiliations from the PAGA XML export.
  ImportPaga {
    #[arg(long)]
    file:   PathBuf,
    /// Remove PAGA affiliations missing from the file once their grace
    /// period has run out.
    #[arg(long)]
    delete: bool,
  },

  /// Create and maintain accounts for the persons in the PAGA export.
  ProcessPaga {
    #[arg(long)]
    file:     PathBuf,
    /// Only process the person with this external id.
    #[arg(long, requires = "id_value")]
    id_type:  Option<ExternalIdType>,
    #[arg(long, requires = "id_type")]
    id_value: Option<String>,
  },

  /// Import units, persons and affiliations from the SITO export.
  ImportSito {
    #[arg(long)]
    persons: PathBuf,
    #[arg(long)]
    units:   PathBuf,
  },

  /// Create and maintain the postfixed accounts of SITO employees.
  ProcessSito {
    #[arg(long)]
    persons: PathBuf,
  },

  /// Import guests from the SYSTEM-X dump.
  ImportSystemx {
    #[arg(long)]
    file: PathBuf,
  },

  /// Create and maintain guest accounts from the SYSTEM-X dump.
  ProcessSystemx {
    #[arg(long)]
    file:          PathBuf,
    /// Where to write the notification list. Defaults to a file named after
    /// the date and the run id in the dump directory.
    #[arg(long)]
    notifications: Option<PathBuf>,
  },

  /// Maintain one group per OU.
  SyncOuGroups,

  /// Write a report to a file or stdout.
  Report {
    #[arg(long, default_value = "csv")]
    format: Format,
    #[arg(long)]
    output: Option<PathBuf>,
    #[command(subcommand)]
    report: ReportKind,
  },

  /// Show change log rows by id (`8`, `3-5`) or for one entity.
  Changelog {
    #[arg(required_unless_present = "subject")]
    range:   Option<String>,
    #[arg(long, conflicts_with = "range")]
    subject: Option<EntityId>,
    #[arg(long, default_value = "csv")]
    format:  Format,
  },
}

#[derive(Subcommand, Debug)]
pub enum ReportKind {
  /// Quarantines in force today.
  Quarantines {
    #[arg(long = "type")]
    quarantine_type: Option<QuarantineType>,
  },
  /// Live accounts of deceased or unaffiliated persons.
  Orphans,
  /// Affiliations the primary account has no account type for.
  MissingAccountTypes,
  /// Affiliations no import has seen for a while.
  StaleAffiliations {
    #[arg(long, default_value_t = 0)]
    years:  i64,
    #[arg(long, default_value_t = 0)]
    months: i64,
    #[arg(long, default_value_t = 0)]
    days:   i64,
  },
  /// Accounts expiring soon.
  Expiring {
    #[arg(long, default_value_t = 30)]
    days: i64,
  },
}

impl Command {
  /// The change program recorded on everything the job changes.
  pub fn name(&self) -> &'static str {
    match self {
      Command::Init => "init",
      Command::ImportOu { .. } => "import-ou",
      Command::ImportPaga { .. } => "import-paga",
      Command::ProcessPaga { .. } => "process-paga",
      Command::ImportSito { .. } => "import-sito",
      Command::ProcessSito { .. } => "process-sito",
      Command::ImportSystemx { .. } => "import-systemx",
      Command::ProcessSystemx { .. } => "process-systemx",
      Command::SyncOuGroups => "sync-ou-groups",
      Command::Report { .. } => "report",
      Command::Changelog { .. } => "changelog",
    }
  }
}

/// A file a job produces that may only be written once its transaction has
/// been committed.
#[derive(Debug)]
pub struct Deferred {
  pub path:     PathBuf,
  pub contents: String,
}

impl Deferred {
  pub async fn write(&self) -> anyhow::Result<()> {
    if let Some(dir) = self.path.parent() {
      tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    tokio::fs::write(&self.path, &self.contents)
      .await
      .with_context(|| format!("failed to write {}", self.path.display()))
  }
}

/// Read a source file and log its size and checksum, so a run can be tied
/// to the exact file it read.
async fn read_source(path: &Path) -> anyhow::Result<String> {
  let bytes =
    tokio::fs::read(path).await.with_context(|| format!("failed to read {}", path.display()))?;
  let digest = hex::encode(Sha256::digest(&bytes));
  info!(file = %path.display(), bytes = bytes.len(), sha256 = %digest, "read source file");
  String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8", path.display()))
}

fn emit(report: &Report, format: Format, output: Option<&Path>) -> anyhow::Result<()> {
  let mut text = report.render(format)?;
  if !text.ends_with('\n') {
    text.push('\n');
  }
  match output {
    Some(path) => {
      std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
      info!(file = %path.display(), rows = report.rows.len(), "report written");
    }
    None => std::io::stdout().lock().write_all(text.as_bytes()).context("failed to write report")?,
  }
  Ok(())
}

pub async fn run(
  command: Command,
  store: &SqliteStore,
  settings: &Settings,
  today: NaiveDate,
) -> anyhow::Result<Option<Deferred>> {
  match command {
    Command::Init => {
      let boot = bootstrap::init(store, settings).await?;
      info!(creator_id = boot.creator_id, posix_group_id = boot.posix_group_id, "initialised");
    }

    Command::ImportOu { file, source } => {
      let input = read_source(&file).await?;
      let records = ou::parse(&input).context("failed to parse OU file")?;
      import_ous(store, records, source).await?;
    }

    Command::ImportPaga { file, delete } => {
      let xml = read_source(&file).await?;
      let persons = paga::parse(&xml).context("failed to parse PAGA file")?;
      import_paga(store, persons, &settings.paga, today, delete).await?;
    }

    Command::ProcessPaga { file, id_type, id_value } => {
      let boot = bootstrap::load(store, settings).await?;
      let xml = read_source(&file).await?;
      let persons = paga::parse(&xml).context("failed to parse PAGA file")?;
      let only = id_type.zip(id_value);
      process_paga(store, persons, settings, boot, today, only.as_ref()).await?;
    }

    Command::ImportSito { persons, units } => {
      let units_xml = read_source(&units).await?;
      let units = sito::parse_units(&units_xml).context("failed to parse SITO units")?;
      sito_import::import_units(store, &units).await?;
      let persons_xml = read_source(&persons).await?;
      let persons =
        sito::parse_persons(&persons_xml, today).context("failed to parse SITO persons")?;
      sito_import::import_persons(store, persons, &settings.sito, today).await?;
    }

    Command::ProcessSito { persons } => {
      let boot = bootstrap::load(store, settings).await?;
      let xml = read_source(&persons).await?;
      let persons = sito::parse_persons(&xml, today).context("failed to parse SITO persons")?;
      process_sito(store, persons, settings, boot, today).await?;
    }

    Command::ImportSystemx { file } => {
      let input = read_source(&file).await?;
      let records = sysx::parse(&input).context("failed to parse SYSTEM-X file")?;
      import_systemx(store, records, &settings.systemx, today).await?;
    }

    Command::ProcessSystemx { file, notifications } => {
      let boot = bootstrap::load(store, settings).await?;
      let input = read_source(&file).await?;
      let records = sysx::parse(&input).context("failed to parse SYSTEM-X file")?;
      let run = process_systemx(store, records, settings, boot, today).await?;
      if run.notifications.is_empty() {
        info!("no notifications");
        return Ok(None);
      }
      let path = notifications.unwrap_or_else(|| {
        let name = format!("systemx-notifications-{today}-{}.json", store.run_id());
        settings.cerebrum.dump_dir.join(name)
      });
      info!(count = run.notifications.len(), file = %path.display(), "notifications queued");
      let contents = serde_json::to_string_pretty(&run.notifications)?;
      return Ok(Some(Deferred { path, contents }));
    }

    Command::SyncOuGroups => {
      let boot = bootstrap::load(store, settings).await?;
      sync_ou_groups(store, boot, today).await?;
    }

    Command::Report { format, output, report } => {
      let report = match report {
        ReportKind::Quarantines { quarantine_type } => {
          reports::quarantines(store, today, quarantine_type).await?
        }
        ReportKind::Orphans => reports::orphans(store, today).await?,
        ReportKind::MissingAccountTypes => reports::missing_account_types(store, today).await?,
        ReportKind::StaleAffiliations { years, months, days } => {
          reports::stale_affiliations(store, today, years, months, days).await?
        }
        ReportKind::Expiring { days } => reports::expiring(store, today, days).await?,
      };
      emit(&report, format, output.as_deref())?;
    }

    Command::Changelog { range, subject, format } => {
      let selection = match (range, subject) {
        (_, Some(id)) => ChangeSelection::Subject(id),
        (Some(range), None) => ChangeSelection::Range(range.parse::<IdRange>()?),
        (None, None) => anyhow::bail!("give a change id range or --subject"),
      };
      let report = reports::changes(store, selection).await?;
      emit(&report, format, None)?;
    }
  }
  Ok(None)
}
