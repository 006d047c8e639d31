//! The reports themselves.
//!
//! Every function reads from the store only and takes `today` explicitly.
//! Rows come out sorted so two runs over the same data produce the same file.

use std::collections::{BTreeMap, BTreeSet};

use cerebrum_core::{
  code::{Affiliation, EntityType, QuarantineType},
  date::{add_days, relative_date},
  range::IdRange,
  entity::{Account, EntityId},
  store::{AffiliationFilter, IdentityStore, primary_accounts},
};
use chrono::NaiveDate;
use tracing::info;

use crate::{Error, Report, Result};

fn finish(report: Report) -> Report {
  info!(report = %report.title, rows = report.rows.len(), "report built");
  report
}

fn date_cell(date: Option<NaiveDate>) -> String { date.map(|d| d.to_string()).unwrap_or_default() }

/// OUs by id, shown by stedkode when they have one.
async fn ou_labels<S: IdentityStore>(store: &S) -> Result<BTreeMap<EntityId, String>> {
  Ok(
    store
      .list_ous()
      .await
      .map_err(Error::store)?
      .into_iter()
      .map(|ou| {
        let label = ou.stedkode.map_or(ou.name, |sko| sko.to_string());
        (ou.ou_id, label)
      })
      .collect(),
  )
}

/// Unexpired accounts owned by persons, grouped by owner.
async fn person_accounts<S: IdentityStore>(
  store: &S,
  today: NaiveDate,
) -> Result<BTreeMap<EntityId, Vec<Account>>> {
  let mut by_owner: BTreeMap<EntityId, Vec<Account>> = BTreeMap::new();
  for account in store.list_accounts(None).await.map_err(Error::store)? {
    if account.owner_type == EntityType::Person && !account.is_expired(today) {
      by_owner.entry(account.owner_id).or_default().push(account);
    }
  }
  Ok(by_owner)
}

// ─── Quarantines ─────────────────────────────────────────────────────────────

/// Quarantines in force on `today`, optionally of one type only.
pub async fn quarantines<S: IdentityStore>(
  store: &S,
  today: NaiveDate,
  only: Option<QuarantineType>,
) -> Result<Report> {
  let mut names: BTreeMap<EntityId, (EntityType, String)> = BTreeMap::new();
  for account in store.list_accounts(None).await.map_err(Error::store)? {
    names.insert(account.account_id, (EntityType::Account, account.name));
  }
  for group in store.list_groups().await.map_err(Error::store)? {
    names.insert(group.group_id, (EntityType::Group, group.name));
  }

  let mut rows = Vec::new();
  for q in store.list_quarantines(None).await.map_err(Error::store)? {
    if !q.is_active(today) || only.is_some_and(|t| t != q.quarantine_type) {
      continue;
    }
    let (entity_type, name) = match names.get(&q.entity_id) {
      Some((t, name)) => (t.to_string(), name.clone()),
      None => {
        let t = store.entity_type(q.entity_id).await.map_err(Error::store)?;
        (t.map(|t| t.to_string()).unwrap_or_default(), String::new())
      }
    };
    rows.push(vec![
      q.entity_id.to_string(),
      entity_type,
      name,
      q.quarantine_type.to_string(),
      q.start_date.to_string(),
      date_cell(q.end_date),
      q.description.unwrap_or_default(),
    ]);
  }
  rows.sort_by(|a, b| (&a[2], &a[3], &a[0]).cmp(&(&b[2], &b[3], &b[0])));

  let title = match only {
    Some(t) => format!("Active quarantines ({t})"),
    None => "Active quarantines".to_owned(),
  };
  let mut report = Report::new(
    title,
    &["entity_id", "entity_type", "name", "quarantine", "start_date", "end_date", "description"],
  );
  report.rows = rows;
  Ok(finish(report))
}

// ─── Orphans ─────────────────────────────────────────────────────────────────

/// Live person-owned accounts whose owner is deceased or has no affiliation
/// left in any source.
pub async fn orphans<S: IdentityStore>(store: &S, today: NaiveDate) -> Result<Report> {
  let deceased: BTreeMap<EntityId, NaiveDate> = store
    .list_persons()
    .await
    .map_err(Error::store)?
    .into_iter()
    .filter_map(|p| p.deceased_date.map(|d| (p.person_id, d)))
    .collect();
  let affiliated: BTreeSet<EntityId> = store
    .list_affiliations(AffiliationFilter::default())
    .await
    .map_err(Error::store)?
    .into_iter()
    .map(|a| a.person_id)
    .collect();

  let mut report =
    Report::new("Orphaned accounts", &["account", "account_id", "owner_id", "reason", "expire_date"]);
  for (owner, accounts) in person_accounts(store, today).await? {
    let reason = match deceased.get(&owner) {
      Some(date) => format!("deceased {date}"),
      None if !affiliated.contains(&owner) => "no affiliation".to_owned(),
      None => continue,
    };
    for account in accounts {
      report.push(vec![
        account.name,
        account.account_id.to_string(),
        owner.to_string(),
        reason.clone(),
        date_cell(account.expire_date),
      ]);
    }
  }
  report.rows.sort();
  Ok(finish(report))
}

// ─── Missing account types ───────────────────────────────────────────────────

/// Persons whose primary account has no account type for one of their
/// affiliations.
pub async fn missing_account_types<S: IdentityStore>(
  store: &S,
  today: NaiveDate,
) -> Result<Report> {
  let ous = ou_labels(store).await?;
  let mut types: BTreeMap<EntityId, BTreeSet<(EntityId, Affiliation)>> = BTreeMap::new();
  for t in store.list_account_types(None).await.map_err(Error::store)? {
    types.entry(t.account_id).or_default().insert((t.ou_id, t.affiliation));
  }
  let names: BTreeMap<EntityId, String> = store
    .list_accounts(None)
    .await
    .map_err(Error::store)?
    .into_iter()
    .map(|a| (a.account_id, a.name))
    .collect();
  let primary = primary_accounts(store, today).await.map_err(Error::store)?;
  let mut wanted: BTreeMap<EntityId, BTreeSet<(EntityId, Affiliation)>> = BTreeMap::new();
  for aff in store.list_affiliations(AffiliationFilter::default()).await.map_err(Error::store)? {
    wanted.entry(aff.person_id).or_default().insert((aff.ou_id, aff.affiliation));
  }

  let mut report = Report::new(
    "Missing account types",
    &["person_id", "account", "ou", "affiliation"],
  );
  for (owner, affiliations) in &wanted {
    let Some(account_id) = primary.get(owner) else { continue };
    let name = names.get(account_id).cloned().unwrap_or_else(|| account_id.to_string());
    let has = types.get(account_id);
    for key in affiliations {
      if has.is_some_and(|h| h.contains(key)) {
        continue;
      }
      let (ou_id, affiliation) = key;
      report.push(vec![
        owner.to_string(),
        name.clone(),
        ous.get(ou_id).cloned().unwrap_or_else(|| ou_id.to_string()),
        affiliation.to_string(),
      ]);
    }
  }
  Ok(finish(report))
}

// ─── Stale affiliations ──────────────────────────────────────────────────────

/// Affiliations no source run has seen since `relative_date(today, years,
/// months, days)`.
pub async fn stale_affiliations<S: IdentityStore>(
  store: &S,
  today: NaiveDate,
  years: i64,
  months: i64,
  days: i64,
) -> Result<Report> {
  let cutoff = relative_date(today, years, months, days)?;
  let ous = ou_labels(store).await?;
  let mut stale: Vec<_> = store
    .list_affiliations(AffiliationFilter::default())
    .await
    .map_err(Error::store)?
    .into_iter()
    .filter(|a| a.last_date < cutoff)
    .collect();
  stale.sort_by_key(|a| (a.last_date, a.person_id, a.ou_id, a.affiliation, a.source));

  let mut report = Report::new(
    format!("Affiliations not seen since {cutoff}"),
    &["person_id", "ou", "affiliation", "status", "source", "last_date"],
  );
  for a in stale {
    report.push(vec![
      a.person_id.to_string(),
      ous.get(&a.ou_id).cloned().unwrap_or_else(|| a.ou_id.to_string()),
      a.affiliation.to_string(),
      a.status.status_str().to_owned(),
      a.source.to_string(),
      a.last_date.to_string(),
    ]);
  }
  Ok(finish(report))
}

// ─── Expiring accounts ───────────────────────────────────────────────────────

/// Live accounts whose expire date falls within the next `days` days.
pub async fn expiring<S: IdentityStore>(store: &S, today: NaiveDate, days: i64) -> Result<Report> {
  let horizon = add_days(today, days)?;
  let mut accounts: Vec<(NaiveDate, Account)> = store
    .list_accounts(None)
    .await
    .map_err(Error::store)?
    .into_iter()
    .filter_map(|a| a.expire_date.map(|d| (d, a)))
    .filter(|(d, _)| today < *d && *d <= horizon)
    .collect();
  accounts.sort_by(|(d1, a1), (d2, a2)| (d1, &a1.name).cmp(&(d2, &a2.name)));

  let mut report = Report::new(
    format!("Accounts expiring by {horizon}"),
    &["account", "account_id", "owner_id", "expire_date", "days_left"],
  );
  for (date, account) in accounts {
    report.push(vec![
      account.name,
      account.account_id.to_string(),
      account.owner_id.to_string(),
      date.to_string(),
      (date - today).num_days().to_string(),
    ]);
  }
  Ok(finish(report))
}

// ─── Change log ──────────────────────────────────────────────────────────────

/// Change log rows, either by id range or for one subject.
#[derive(Debug, Clone, Copy)]
pub enum ChangeSelection {
  Range(IdRange),
  Subject(EntityId),
}

pub async fn changes<S: IdentityStore>(store: &S, selection: ChangeSelection) -> Result<Report> {
  let (title, entries) = match selection {
    ChangeSelection::Range(range) => {
      let title = if range.start == range.end {
        format!("Change {range}")
      } else {
        format!("Changes {range}")
      };
      (title, store.get_changes(range).await.map_err(Error::store)?)
    }
    ChangeSelection::Subject(id) => {
      (format!("Changes to entity {id}"), store.list_changes_for(id).await.map_err(Error::store)?)
    }
  };

  let mut report = Report::new(
    title,
    &["change_id", "recorded_at", "change_program", "change_type", "subject_id", "params", "run_id"],
  );
  for entry in entries {
    report.push(vec![
      entry.change_id.to_string(),
      entry.recorded_at.to_rfc3339(),
      entry.change_program,
      entry.change_type.to_string(),
      entry.subject_id.to_string(),
      entry.params.map(|p| p.to_string()).unwrap_or_default(),
      entry.run_id.to_string(),
    ]);
  }
  Ok(finish(report))
}

#[cfg(test)]
mod tests {
  use cerebrum_core::{
    code::{AffiliationStatus, Gender, SourceSystem},
    entity::{NewAccount, NewAffiliation, NewOu, NewPerson, NewQuarantine, Stedkode},
  };
  use cerebrum_store_sqlite::SqliteStore;

  use super::*;

  fn day(y: i32, m: u32, d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, d).unwrap() }

  fn today() -> NaiveDate { day(2024, 3, 1) }

  struct Fixture {
    store:  SqliteStore,
    kari:   EntityId,
    ola:    EntityId,
    per:    EntityId,
    kar001: EntityId,
    ola001: EntityId,
  }

  async fn person(store: &SqliteStore) -> EntityId {
    store
      .create_person(NewPerson { birth_date: day(1980, 1, 1), gender: Gender::Female })
      .await
      .unwrap()
      .person_id
  }

  async fn account(
    store: &SqliteStore,
    name: &str,
    owner_id: EntityId,
    expire_date: Option<NaiveDate>,
  ) -> EntityId {
    store
      .create_account(NewAccount {
        name: name.into(),
        owner_id,
        creator_id: None,
        expire_date,
        gecos: None,
      })
      .await
      .unwrap()
      .account_id
  }

  async fn affiliate(
    store: &SqliteStore,
    person_id: EntityId,
    ou_id: EntityId,
    status: AffiliationStatus,
    seen: NaiveDate,
  ) {
    let aff = NewAffiliation { person_id, ou_id, status, source: SourceSystem::Paga };
    store.upsert_affiliation(aff, seen).await.unwrap();
  }

  /// Kari: employee and guest researcher, one account typed for the first
  /// only. Ola: no affiliations, account expiring soon. Per: deceased, last
  /// seen over a year ago.
  async fn fixture() -> Fixture {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let ou = store
      .add_ou(NewOu {
        stedkode: Some(Stedkode::new(74, 1, 0)),
        name: "Institutt".into(),
        ..Default::default()
      })
      .await
      .unwrap()
      .ou_id;

    let kari = person(&store).await;
    affiliate(&store, kari, ou, AffiliationStatus::AnsattTekadm, today()).await;
    affiliate(&store, kari, ou, AffiliationStatus::TilknyttetGjesteforsker, today()).await;
    let kar001 = account(&store, "kar001", kari, Some(day(2024, 3, 31))).await;
    store.set_account_type(kar001, ou, Affiliation::Ansatt).await.unwrap();

    let ola = person(&store).await;
    let ola001 = account(&store, "ola001", ola, Some(day(2024, 3, 10))).await;

    let per = person(&store).await;
    affiliate(&store, per, ou, AffiliationStatus::AnsattVitenskapelig, day(2023, 1, 1)).await;
    store.set_deceased(per, Some(day(2024, 1, 15))).await.unwrap();
    account(&store, "per001", per, None).await;
    account(&store, "per002", per, Some(day(2023, 12, 1))).await;

    Fixture { store, kari, ola, per, kar001, ola001 }
  }

  #[tokio::test]
  async fn lists_active_quarantines() {
    let f = fixture().await;
    let quarantine = |entity_id, quarantine_type, start_date| NewQuarantine {
      entity_id,
      quarantine_type,
      creator_id: None,
      description: Some("note".into()),
      start_date,
      end_date: None,
    };
    for (entity_id, quarantine_type, start) in [
      (f.ola001, QuarantineType::Generell, day(2024, 2, 1)),
      (f.kar001, QuarantineType::Tilbud, day(2024, 4, 1)),
      (f.kar001, QuarantineType::Autopassord, day(2024, 1, 1)),
    ] {
      f.store.add_quarantine(quarantine(entity_id, quarantine_type, start)).await.unwrap();
    }

    let report = quarantines(&f.store, today(), None).await.unwrap();
    let rows: Vec<(&str, &str)> =
      report.rows.iter().map(|r| (r[2].as_str(), r[3].as_str())).collect();
    assert_eq!(rows, [("kar001", "autopassord"), ("ola001", "generell")]);
    assert_eq!(report.rows[1][1], "account");

    let report = quarantines(&f.store, today(), Some(QuarantineType::Generell)).await.unwrap();
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.title, "Active quarantines (generell)");
  }

  #[tokio::test]
  async fn finds_orphaned_accounts() {
    let f = fixture().await;
    let report = orphans(&f.store, today()).await.unwrap();
    let rows: Vec<(&str, &str)> =
      report.rows.iter().map(|r| (r[0].as_str(), r[3].as_str())).collect();
    assert_eq!(rows, [("ola001", "no affiliation"), ("per001", "deceased 2024-01-15")]);
    assert!(report.rows.iter().all(|r| r[2] != f.kari.to_string()));
  }

  #[tokio::test]
  async fn finds_missing_account_types() {
    let f = fixture().await;
    let report = missing_account_types(&f.store, today()).await.unwrap();
    // Per's only live account has no types at all.
    assert_eq!(
      report.rows,
      [
        vec![f.kari.to_string(), "kar001".into(), "740100".into(), "TILKNYTTET".into()],
        vec![f.per.to_string(), "per001".into(), "740100".into(), "ANSATT".into()],
      ]
    );
    assert!(report.rows.iter().all(|r| r[0] != f.ola.to_string()));
  }

  #[tokio::test]
  async fn finds_stale_affiliations() {
    let f = fixture().await;
    let report = stale_affiliations(&f.store, today(), 1, 0, 0).await.unwrap();
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0][0], f.per.to_string());
    assert_eq!(report.rows[0][3], "vitenskapelig");
    assert_eq!(report.rows[0][5], "2023-01-01");
    assert_eq!(report.title, "Affiliations not seen since 2023-03-02");

    let report = stale_affiliations(&f.store, today(), 0, 0, 0).await.unwrap();
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0][1], "740100");
  }

  #[tokio::test]
  async fn lists_accounts_expiring_soon() {
    let f = fixture().await;
    let report = expiring(&f.store, today(), 14).await.unwrap();
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0][0], "ola001");
    assert_eq!(report.rows[0][4], "9");

    let report = expiring(&f.store, today(), 30).await.unwrap();
    let names: Vec<&str> = report.rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(names, ["ola001", "kar001"]);
  }

  #[tokio::test]
  async fn out_of_range_windows_are_errors() {
    let f = fixture().await;
    assert!(matches!(
      expiring(&f.store, today(), 99_999_999_999).await,
      Err(Error::Date(_))
    ));
    assert!(matches!(
      stale_affiliations(&f.store, today(), 1_000_000, 0, 0).await,
      Err(Error::Date(_))
    ));
  }

  #[tokio::test]
  async fn lists_changes_by_id_and_subject() {
    let f = fixture().await;
    let all = changes(&f.store, ChangeSelection::Subject(f.ola001)).await.unwrap();
    assert_eq!(all.rows.len(), 1);
    assert_eq!(all.rows[0][4], f.ola001.to_string());

    let id: i64 = all.rows[0][0].parse().unwrap();
    let range = IdRange { start: id, end: id };
    let one = changes(&f.store, ChangeSelection::Range(range)).await.unwrap();
    assert_eq!(one.rows, all.rows);
    assert_eq!(one.title, format!("Change {id}"));

    let past_the_end = IdRange { start: i64::MAX, end: i64::MAX };
    let none = changes(&f.store, ChangeSelection::Range(past_the_end)).await.unwrap();
    assert!(none.rows.is_empty());
  }
}
