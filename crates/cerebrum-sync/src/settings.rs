//! Site configuration shared by every batch job.
//!
//! Deserialised from `cerebrum.toml` plus `CEREBRUM_*` environment variables
//! by the binary. Every field has a default so a partial file is enough.

use std::{collections::BTreeMap, path::PathBuf};

use cerebrum_core::code::EntityType;
use serde::Deserialize;

fn strings(values: &[&str]) -> Vec<String> { values.iter().map(|s| (*s).to_owned()).collect() }

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub database: DatabaseSettings,
  pub cerebrum: CerebrumSettings,
  pub paga:     PagaSettings,
  pub sito:     SitoSettings,
  pub systemx:  SystemXSettings,
  /// Spread code → the entity type it applies to. Registered by `init`.
  pub spreads:  SpreadTable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
  pub path: PathBuf,
}

impl Default for DatabaseSettings {
  fn default() -> Self { Self { path: PathBuf::from("cerebrum.db") } }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CerebrumSettings {
  pub institution:          u32,
  /// Creator of every account and quarantine the batch jobs make.
  pub initial_account_name: String,
  pub initial_group_name:   String,
  /// Default group of posix users.
  pub posix_group:          String,
  pub default_shell:        String,
  pub uid_start:            u32,
  pub no_mailbox_domain:    String,
  /// Where reports and notification lists land unless given explicitly.
  pub dump_dir:             PathBuf,
}

impl Default for CerebrumSettings {
  fn default() -> Self {
    Self {
      institution:          186,
      initial_account_name: "bootstrap_account".to_owned(),
      initial_group_name:   "bootstrap_group".to_owned(),
      posix_group:          "posixgroup".to_owned(),
      default_shell:        "/bin/bash".to_owned(),
      uid_start:            1000,
      no_mailbox_domain:    "no-mailbox.uit.no".to_owned(),
      dump_dir:             PathBuf::from("dumps"),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PagaSettings {
  /// Positions starting this many days from now already count as active.
  pub early_days:                i64,
  pub grace_period_days:         i64,
  /// Person spreads for employees above `person_spreads_percentage`.
  pub person_spreads:            Vec<String>,
  pub person_spreads_percentage: f64,
  pub account_default_spreads:   Vec<String>,
  /// Stedkode prefixes whose employees get no mailbox.
  pub exchange_filter_sko:       Vec<String>,
  /// Spread given to scientific staff.
  pub scientific_spread:         String,
}

impl Default for PagaSettings {
  fn default() -> Self {
    Self {
      early_days:                14,
      grace_period_days:         14,
      person_spreads:            strings(&["ansatt@ldap"]),
      person_spreads_percentage: 49.0,
      account_default_spreads:   strings(&["AD_account", "people@ldap", "system@ldap"]),
      exchange_filter_sko:       strings(&["99"]),
      scientific_spread:         "cristin@uit".to_owned(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SitoSettings {
  pub grace_period_days:       i64,
  pub account_default_spreads: Vec<String>,
  /// Appended to every SITO username.
  pub username_postfix:        String,
  /// Guid of the top unit.
  pub root_unit:               Option<String>,
}

impl Default for SitoSettings {
  fn default() -> Self {
    Self {
      grace_period_days:       14,
      account_default_spreads: strings(&["AD_account", "people@ldap"]),
      username_postfix:        "-s".to_owned(),
      root_unit:               None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemXSettings {
  pub grace_period_days:   i64,
  /// Stedkoder under the `99` prefix that still qualify for a mailbox.
  pub exchange_sko:        Vec<String>,
  /// OUs starting with this prefix are outside the university proper.
  pub external_sko_prefix: String,
}

impl Default for SystemXSettings {
  fn default() -> Self {
    Self {
      grace_period_days:   0,
      exchange_sko:        strings(&["999510", "999620", "999410", "921000"]),
      external_sko_prefix: "99".to_owned(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct SpreadTable(pub BTreeMap<String, EntityType>);

impl Default for SpreadTable {
  fn default() -> Self {
    let account = [
      "AD_account",
      "exchange_mailbox",
      "people@ldap",
      "system@ldap",
      "cristin@uit",
      "fronter@uit",
    ];
    let mut table: BTreeMap<String, EntityType> = account
      .iter()
      .map(|s| ((*s).to_owned(), EntityType::Account))
      .collect();
    table.insert("ansatt@ldap".to_owned(), EntityType::Person);
    Self(table)
  }
}
