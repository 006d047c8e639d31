//! Accounts for SYSTEM-X guests.
//!
//! A guest's account lives exactly as long as the registration says. The
//! spreads come from the registration itself, and an account stays in the
//! `sys_x-approved` quarantine until the registration is approved. New and
//! reactivated accounts produce notifications for the guest and for the
//! person responsible for them; the caller decides how to deliver them.

use std::collections::BTreeSet;

use cerebrum_core::{
  code::{Affiliation, AffiliationStatus, ExternalIdType, QuarantineType, SourceSystem},
  entity::EntityId,
  store::{AffiliationFilter, IdentityStore},
};
use cerebrum_source::sysx::SysXPerson;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
  AccountChange, ApplyContext, Existing, ExistingAccount, ExistingPerson, Selection,
  create_account, load_existing, missing_account_types, missing_spreads, stale_spread_expiry,
  write_changes,
};
use crate::{
  Error, Result, Settings,
  bootstrap::Bootstrap,
  import::{ImportStats, Outcome, sysx::status},
  settings::SystemXSettings,
};

const SOURCE: SourceSystem = SourceSystem::SystemX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
  /// Sent to the guest.
  User,
  /// Sent to the person who registered the guest.
  Responsible,
}

/// A message owed to someone about an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub kind:       NotificationKind,
  pub account_id: EntityId,
  pub account:    String,
  pub recipient:  String,
  pub sys_x_id:   i64,
}

#[derive(Debug, Clone, Default)]
pub struct SystemXRun {
  pub stats:         ImportStats,
  pub notifications: Vec<Notification>,
}

pub async fn process_systemx<S: IdentityStore>(
  store: &S,
  records: Vec<cerebrum_source::Result<SysXPerson>>,
  settings: &Settings,
  bootstrap: Bootstrap,
  today: NaiveDate,
) -> Result<SystemXRun> {
  let selection = Selection {
    id_types:         vec![ExternalIdType::SysXId],
    source:           SOURCE,
    excluded_postfix: Some(settings.sito.username_postfix.clone()),
  };
  let mut existing = load_existing(store, &selection).await?;
  let ctx = ApplyContext { bootstrap, settings: &settings.cerebrum, today };
  let mut run = SystemXRun::default();

  for record in records {
    let record = match record {
      Ok(r) => r,
      Err(e) => {
        run.stats.absorb("system-x", Err(Error::skip(e.to_string())))?;
        continue;
      }
    };
    let result =
      process_guest(store, &mut existing, &record, &settings.systemx, &ctx, &mut run.notifications)
        .await;
    run.stats.absorb(&record.id.to_string(), result)?;
  }

  run.stats.log("process-systemx");
  info!(notifications = run.notifications.len(), "notifications queued");
  Ok(run)
}

/// Whether the guest's OU qualifies for a mailbox. OUs outside the
/// university proper only do when listed.
pub fn could_have_exchange(stedkode: &str, settings: &SystemXSettings) -> bool {
  !stedkode.starts_with(settings.external_sko_prefix.as_str())
    || settings.exchange_sko.iter().any(|s| s == stedkode)
}

/// The spreads a registration asks for, with the old spread names mapped
/// to the current ones.
pub fn desired_spreads(
  record: &SysXPerson,
  status: AffiliationStatus,
  settings: &SystemXSettings,
) -> BTreeSet<String> {
  let mut desired = BTreeSet::from(["system@ldap".to_owned()]);
  if status == AffiliationStatus::ManuellGjestUKonto {
    return desired;
  }
  for spread in &record.spreads {
    match spread.as_str() {
      "ldap@uit" => {
        desired.insert("people@ldap".to_owned());
      }
      "frida@uit" => {
        warn!(sys_x_id = record.id, "renaming old spread frida@uit to cristin@uit");
        desired.insert("cristin@uit".to_owned());
      }
      "AD_account" => {
        desired.insert(spread.clone());
        if could_have_exchange(&record.ou, settings) {
          desired.insert("exchange_mailbox".to_owned());
        }
      }
      other => {
        desired.insert(other.to_owned());
      }
    }
  }
  desired
}

/// Keep the spread codes that are registered. The rest are logged and
/// dropped.
async fn registered_spreads<S: IdentityStore>(
  store: &S,
  desired: BTreeSet<String>,
  sys_x_id: i64,
) -> Result<BTreeSet<String>> {
  let mut known = BTreeSet::new();
  for code in desired {
    if store.spread_entity_type(&code).await.map_err(Error::store)?.is_some() {
      known.insert(code);
    } else {
      warn!(sys_x_id, spread = %code, "unknown spread, ignored");
    }
  }
  Ok(known)
}

async fn process_guest<S: IdentityStore>(
  store: &S,
  existing: &mut Existing,
  record: &SysXPerson,
  settings: &SystemXSettings,
  ctx: &ApplyContext<'_>,
  notifications: &mut Vec<Notification>,
) -> Result<Outcome> {
  let today = ctx.today;
  if record.expire_date < today {
    return Err(Error::skip(format!("expired {}", record.expire_date)));
  }
  let status = status(record)?;
  let person = existing
    .find(ExternalIdType::SysXId, &record.id.to_string())
    .cloned()
    .ok_or_else(|| Error::skip("not imported"))?;
  if person.affiliations.is_empty() {
    return Err(Error::skip("no SYSTEM-X affiliations"));
  }
  let desired =
    registered_spreads(store, desired_spreads(record, status, settings), record.id).await?;

  let mut queued = Vec::new();
  let (account_id, created, was_expired) = match existing.primary_account(&person) {
    Some(a) => (a.account_id, false, a.is_expired(today)),
    None => {
      let id = create_account(store, existing, person.person_id, SOURCE, "", today, ctx).await?;
      queued.push(NotificationKind::User);
      (id, true, false)
    }
  };
  let account = existing
    .account(account_id)
    .ok_or_else(|| Error::skip(format!("account {account_id} is not cached")))?;

  let (mut changes, reactivated) =
    account_changes(&person, account, record, &desired, today, created);
  if reactivated {
    queued.push(NotificationKind::User);
  }

  let address = primary_email(store, &person, account, record, ctx).await?;
  let current = store.get_primary_email(account_id).await.map_err(Error::store)?;
  if !current.is_some_and(|c| c.eq_ignore_ascii_case(&address)) {
    changes.push(AccountChange::PrimaryEmail(address));
  }

  if changes.is_empty() {
    return Ok(Outcome::from_flags(created, false));
  }
  let account_name = account.name.clone();
  debug!(account = %account_name, ?changes, "changes");
  write_changes(store, existing, account_id, &changes, ctx).await?;

  if created || was_expired {
    queued.push(NotificationKind::Responsible);
  }
  for kind in queued {
    let recipient = match kind {
      NotificationKind::User => &record.user_email,
      NotificationKind::Responsible => &record.responsible_email,
    };
    match recipient.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
      Some(recipient) => notifications.push(Notification {
        kind,
        account_id,
        account: account_name.clone(),
        recipient: recipient.to_owned(),
        sys_x_id: record.id,
      }),
      None => info!(account = %account_name, ?kind, "no recipient, notification dropped"),
    }
  }
  Ok(Outcome::from_flags(created, true))
}

/// The changes a registration asks for, and whether they bring an expired
/// account back to life.
pub fn account_changes(
  person: &ExistingPerson,
  account: &ExistingAccount,
  record: &SysXPerson,
  desired: &BTreeSet<String>,
  today: NaiveDate,
  created: bool,
) -> (Vec<AccountChange>, bool) {
  let mut changes = Vec::new();
  if !account.posix {
    changes.push(AccountChange::PromotePosix);
  }

  let current = account.expire_date;
  let (wanted, deceased) = match person.deceased_date {
    Some(d) => (d, current != Some(d)),
    None => (record.expire_date, false),
  };
  let later = wanted > today && current.is_none_or(|c| wanted > c);
  let reactivated = later && current.is_some_and(|c| c < today) && !created;
  if later || deceased {
    changes.push(AccountChange::ExpireDate(wanted));
  }

  changes.extend(missing_account_types(account, &person.affiliations));

  changes.extend(missing_spreads(account, desired));
  changes.extend(stale_spread_expiry(account, desired, wanted));

  let quarantined = account.quarantines.contains(&QuarantineType::SysXApproved);
  if record.approved && quarantined {
    changes.push(AccountChange::QuarantineDel(QuarantineType::SysXApproved));
  } else if !record.approved && !quarantined {
    changes.push(AccountChange::QuarantineAdd {
      quarantine_type: QuarantineType::SysXApproved,
      description:     Some("awaiting approval in SYSTEM-X".to_owned()),
    });
  }
  (changes, reactivated)
}

/// Students keep an address in the no-mailbox domain; other guests get the
/// address they asked for, if any.
async fn primary_email<S: IdentityStore>(
  store: &S,
  person: &ExistingPerson,
  account: &ExistingAccount,
  record: &SysXPerson,
  ctx: &ApplyContext<'_>,
) -> Result<String> {
  let fallback = format!("{}@{}", account.name, ctx.settings.no_mailbox_domain);
  let is_student = !store
    .list_affiliations(AffiliationFilter {
      affiliation: Some(Affiliation::Student),
      ..AffiliationFilter::person(person.person_id)
    })
    .await
    .map_err(Error::store)?
    .is_empty();
  if is_student {
    return Ok(fallback);
  }
  Ok(
    record
      .user_email
      .as_deref()
      .map(str::trim)
      .filter(|e| !e.is_empty())
      .map_or(fallback, str::to_owned),
  )
}

#[cfg(test)]
mod tests {
  use cerebrum_store_sqlite::SqliteStore;

  use super::*;
  use crate::{
    fixtures::{self, day},
    import::sysx::import_systemx,
  };

  fn guest(approved: bool) -> SysXPerson {
    SysXPerson {
      id: 7,
      birth_date: None,
      personnr: None,
      gender: None,
      first_name: "Gjest".into(),
      last_name: "Gjestesen".into(),
      ou: "740100".into(),
      affiliation: "MANUELL".into(),
      affiliation_status: "gjest".into(),
      expire_date: day(2024, 6, 1),
      spreads: vec!["AD_account".into(), "ldap@uit".into(), "frida@uit".into()],
      legal_basis: None,
      contact_info: None,
      responsible_email: Some("boss@uit.no".into()),
      user_email: Some("gjest@example.org".into()),
      national_identity_number: Some("15050550025".into()),
      approved,
    }
  }

  async fn run(store: &SqliteStore, record: SysXPerson, today: NaiveDate) -> SystemXRun {
    let settings = Settings::default();
    let bootstrap = crate::bootstrap::load(store, &settings).await.unwrap();
    process_systemx(store, vec![Ok(record)], &settings, bootstrap, today).await.unwrap()
  }

  #[test]
  fn spreads_follow_the_registration() {
    let settings = SystemXSettings::default();
    let spreads = desired_spreads(&guest(true), AffiliationStatus::ManuellGjest, &settings);
    let expected: BTreeSet<String> =
      ["AD_account", "cristin@uit", "exchange_mailbox", "people@ldap", "system@ldap"]
        .map(String::from)
        .into();
    assert_eq!(spreads, expected);

    let external = SysXPerson { ou: "990100".into(), ..guest(true) };
    assert!(!desired_spreads(&external, AffiliationStatus::ManuellGjest, &settings)
      .contains("exchange_mailbox"));
    let listed = SysXPerson { ou: "999510".into(), ..guest(true) };
    assert!(desired_spreads(&listed, AffiliationStatus::ManuellGjest, &settings)
      .contains("exchange_mailbox"));

    let spreads = desired_spreads(&guest(true), AffiliationStatus::ManuellGjestUKonto, &settings);
    assert_eq!(spreads, BTreeSet::from(["system@ldap".to_owned()]));
  }

  #[tokio::test]
  async fn guests_wait_for_approval() {
    let store = fixtures::store().await;
    fixtures::ou(&store, "740100", None).await;
    let imported = vec![Ok(guest(false))];
    import_systemx(&store, imported, &SystemXSettings::default(), fixtures::today())
      .await
      .unwrap();

    let run1 = run(&store, guest(false), fixtures::today()).await;
    assert_eq!(run1.stats.added, 1);
    let kinds: Vec<NotificationKind> = run1.notifications.iter().map(|n| n.kind).collect();
    assert_eq!(kinds, [NotificationKind::User, NotificationKind::Responsible]);
    assert_eq!(run1.notifications[0].recipient, "gjest@example.org");

    let account_id = run1.notifications[0].account_id;
    let account = store.get_account(account_id).await.unwrap().unwrap();
    assert_eq!(account.expire_date, Some(day(2024, 6, 1)));
    assert_eq!(
      store.get_primary_email(account_id).await.unwrap().as_deref(),
      Some("gjest@example.org")
    );
    let quarantines = store.list_quarantines(Some(account_id)).await.unwrap();
    assert_eq!(quarantines.len(), 1);
    assert_eq!(quarantines[0].quarantine_type, QuarantineType::SysXApproved);

    // Approval lifts the quarantine and sends nothing.
    let run2 = run(&store, guest(true), fixtures::today()).await;
    assert_eq!(run2.stats.updated, 1);
    assert!(run2.notifications.is_empty());
    assert!(store.list_quarantines(Some(account_id)).await.unwrap().is_empty());

    let run3 = run(&store, guest(true), fixtures::today()).await;
    assert_eq!(run3.stats.unchanged, 1);
  }

  #[tokio::test]
  async fn extended_registration_reactivates_the_account() {
    let store = fixtures::store().await;
    fixtures::ou(&store, "740100", None).await;
    let imported = vec![Ok(guest(true))];
    import_systemx(&store, imported, &SystemXSettings::default(), fixtures::today())
      .await
      .unwrap();
    let first = run(&store, guest(true), fixtures::today()).await;
    let account_id = first.notifications[0].account_id;

    // The account lapsed on 2024-02-01; the registration now runs to June.
    store.set_account_expire(account_id, Some(day(2024, 2, 1))).await.unwrap();
    let again = run(&store, guest(true), fixtures::today()).await;
    let kinds: Vec<NotificationKind> = again.notifications.iter().map(|n| n.kind).collect();
    assert_eq!(kinds, [NotificationKind::User, NotificationKind::Responsible]);
    let account = store.get_account(account_id).await.unwrap().unwrap();
    assert_eq!(account.expire_date, Some(day(2024, 6, 1)));
  }

  #[tokio::test]
  async fn unknown_spread_does_not_stop_the_batch() {
    let store = fixtures::store().await;
    fixtures::ou(&store, "740100", None).await;
    let typo = SysXPerson { spreads: vec!["typo@uit".into(), "AD_account".into()], ..guest(true) };
    let other = SysXPerson {
      id: 8,
      birth_date: Some(day(1990, 1, 1)),
      gender: Some("M".into()),
      first_name: "Annen".into(),
      national_identity_number: None,
      user_email: Some("annen@example.org".into()),
      ..guest(true)
    };
    let records = || vec![Ok(typo.clone()), Ok(other.clone())];
    import_systemx(&store, records(), &SystemXSettings::default(), fixtures::today())
      .await
      .unwrap();

    let settings = Settings::default();
    let bootstrap = crate::bootstrap::load(&store, &settings).await.unwrap();
    let run = process_systemx(&store, records(), &settings, bootstrap, fixtures::today())
      .await
      .unwrap();
    assert_eq!(run.stats.added, 2);

    let first = run.notifications[0].account_id;
    let spreads: Vec<String> =
      store.list_spreads(Some(first)).await.unwrap().into_iter().map(|s| s.spread).collect();
    assert!(spreads.contains(&"AD_account".to_owned()));
    assert!(!spreads.contains(&"typo@uit".to_owned()));
  }
}
