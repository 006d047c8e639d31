//! Account maintenance.
//!
//! The account jobs read the same source files as the imports, but only to
//! decide which persons should have an account and what it should look
//! like. The persons and their accounts are loaded up front into an
//! [`Existing`] cache. For each source person the job computes a list of
//! [`AccountChange`]s and hands it to [`apply_changes`], which is the only
//! place account state is written.

pub mod paga;
pub mod sito;
pub mod systemx;

use std::collections::{BTreeMap, BTreeSet};

use cerebrum_core::{
  code::{Affiliation, ExternalIdType, NameVariant, QuarantineType, SourceSystem},
  entity::{
    AccountType, EntityId, NewAccount, NewQuarantine, Ou, PersonAffiliation, PosixUser,
    pick_primary,
  },
  store::{AffiliationFilter, ExternalIdFilter, IdentityStore},
};
use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::{Error, Result, bootstrap::Bootstrap, password, settings::CerebrumSettings, uname};

// ─── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingAccount {
  pub account_id:    EntityId,
  pub name:          String,
  pub owner_id:      EntityId,
  pub expire_date:   Option<NaiveDate>,
  pub posix:         bool,
  /// Spread → its expire date.
  pub spreads:       BTreeMap<String, Option<NaiveDate>>,
  pub quarantines:   BTreeSet<QuarantineType>,
  pub account_types: Vec<AccountType>,
}

impl ExistingAccount {
  fn new(account_id: EntityId, name: String, owner_id: EntityId) -> Self {
    Self {
      account_id,
      name,
      owner_id,
      expire_date: None,
      posix: false,
      spreads: BTreeMap::new(),
      quarantines: BTreeSet::new(),
      account_types: Vec::new(),
    }
  }

  pub fn has_account_type(&self, ou_id: EntityId, affiliation: Affiliation) -> bool {
    self.account_types.iter().any(|t| t.ou_id == ou_id && t.affiliation == affiliation)
  }

  pub fn has_affiliation(&self, affiliation: Affiliation) -> bool {
    self.account_types.iter().any(|t| t.affiliation == affiliation)
  }

  pub fn is_expired(&self, today: NaiveDate) -> bool {
    self.expire_date.is_some_and(|d| d <= today)
  }

  fn best_priority(&self) -> Option<i32> { self.account_types.iter().map(|t| t.priority).min() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingPerson {
  pub person_id:     EntityId,
  pub deceased_date: Option<NaiveDate>,
  /// Affiliations from the selection's source only.
  pub affiliations:  Vec<PersonAffiliation>,
  pub accounts:      Vec<EntityId>,
}

/// Which persons an account job cares about.
#[derive(Debug, Clone)]
pub struct Selection {
  /// Ids the source identifies persons by, registered by `source`. A person
  /// can be found by any of them.
  pub id_types:         Vec<ExternalIdType>,
  pub source:           SourceSystem,
  /// Accounts with this name suffix belong to another job.
  pub excluded_postfix: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Existing {
  by_external_id: BTreeMap<(ExternalIdType, String), EntityId>,
  persons:        BTreeMap<EntityId, ExistingPerson>,
  accounts:       BTreeMap<EntityId, ExistingAccount>,
  ous:            BTreeMap<EntityId, Ou>,
}

impl Existing {
  pub fn find(&self, id_type: ExternalIdType, value: &str) -> Option<&ExistingPerson> {
    let person_id = self.by_external_id.get(&(id_type, value.to_owned()))?;
    self.persons.get(person_id)
  }

  pub fn person(&self, person_id: EntityId) -> Option<&ExistingPerson> {
    self.persons.get(&person_id)
  }

  pub fn account(&self, account_id: EntityId) -> Option<&ExistingAccount> {
    self.accounts.get(&account_id)
  }

  pub fn accounts_of<'a>(
    &'a self,
    person: &'a ExistingPerson,
  ) -> impl Iterator<Item = &'a ExistingAccount> + 'a {
    person.accounts.iter().filter_map(|id| self.accounts.get(id))
  }

  /// The person's primary account by [`pick_primary`]. Expired accounts
  /// are candidates too, so a returning person gets their old account back.
  pub fn primary_account<'a>(
    &'a self,
    person: &'a ExistingPerson,
  ) -> Option<&'a ExistingAccount> {
    let id = pick_primary(self.accounts_of(person).map(|a| (a.account_id, a.best_priority())))?;
    self.account(id)
  }

  pub fn ou(&self, ou_id: EntityId) -> Option<&Ou> { self.ous.get(&ou_id) }

  pub fn persons(&self) -> impl Iterator<Item = &ExistingPerson> { self.persons.values() }

  fn insert_account(&mut self, account: ExistingAccount) {
    if let Some(person) = self.persons.get_mut(&account.owner_id) {
      person.accounts.push(account.account_id);
    }
    self.accounts.insert(account.account_id, account);
  }

  fn account_mut(&mut self, account_id: EntityId) -> Option<&mut ExistingAccount> {
    self.accounts.get_mut(&account_id)
  }
}

/// Load the persons `selection` names and every account they own.
pub async fn load_existing<S: IdentityStore>(store: &S, selection: &Selection) -> Result<Existing> {
  let mut existing = Existing::default();

  let ids = store
    .list_external_ids(ExternalIdFilter { source: Some(selection.source), ..Default::default() })
    .await
    .map_err(Error::store)?;
  for id in ids {
    if selection.id_types.contains(&id.id_type) {
      existing.by_external_id.insert((id.id_type, id.value), id.entity_id);
    }
  }

  let wanted: BTreeSet<EntityId> = existing.by_external_id.values().copied().collect();
  for person in store.list_persons().await.map_err(Error::store)? {
    if wanted.contains(&person.person_id) {
      existing.persons.insert(person.person_id, ExistingPerson {
        person_id:     person.person_id,
        deceased_date: person.deceased_date,
        affiliations:  Vec::new(),
        accounts:      Vec::new(),
      });
    }
  }

  let affiliations = store
    .list_affiliations(AffiliationFilter::source(selection.source))
    .await
    .map_err(Error::store)?;
  for aff in affiliations {
    if let Some(person) = existing.persons.get_mut(&aff.person_id) {
      person.affiliations.push(aff);
    }
  }

  for account in store.list_accounts(None).await.map_err(Error::store)? {
    if !existing.persons.contains_key(&account.owner_id) {
      continue;
    }
    if let Some(postfix) = &selection.excluded_postfix
      && account.name.ends_with(postfix.as_str())
    {
      continue;
    }
    let mut cached = ExistingAccount::new(account.account_id, account.name, account.owner_id);
    cached.expire_date = account.expire_date;
    existing.insert_account(cached);
  }

  for t in store.list_account_types(None).await.map_err(Error::store)? {
    if let Some(a) = existing.account_mut(t.account_id) {
      a.account_types.push(t);
    }
  }
  for s in store.list_spreads(None).await.map_err(Error::store)? {
    if let Some(a) = existing.account_mut(s.entity_id) {
      a.spreads.insert(s.spread, s.expire_date);
    }
  }
  for q in store.list_quarantines(None).await.map_err(Error::store)? {
    if let Some(a) = existing.account_mut(q.entity_id) {
      a.quarantines.insert(q.quarantine_type);
    }
  }
  for p in store.list_posix_users().await.map_err(Error::store)? {
    if let Some(a) = existing.account_mut(p.account_id) {
      a.posix = true;
    }
  }

  existing.ous = store
    .list_ous()
    .await
    .map_err(Error::store)?
    .into_iter()
    .map(|ou| (ou.ou_id, ou))
    .collect();

  info!(
    source = %selection.source,
    persons = existing.persons.len(),
    accounts = existing.accounts.len(),
    "loaded existing persons and accounts"
  );
  Ok(existing)
}

// ─── Changes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountChange {
  SpreadsAdd(Vec<String>),
  SpreadExpire { spreads: Vec<String>, expire_date: NaiveDate },
  QuarantineAdd { quarantine_type: QuarantineType, description: Option<String> },
  QuarantineDel(QuarantineType),
  SetAccountType { ou_id: EntityId, affiliation: Affiliation },
  Gecos(String),
  ExpireDate(NaiveDate),
  /// Applied after everything else.
  PromotePosix,
  PrimaryEmail(String),
}

/// What [`apply_changes`] needs besides the changes themselves.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
  pub bootstrap: Bootstrap,
  pub settings:  &'a CerebrumSettings,
  pub today:     NaiveDate,
}

/// Write `changes` to the store and mirror them in the cached account.
pub async fn apply_changes<S: IdentityStore>(
  store: &S,
  account: &mut ExistingAccount,
  changes: &[AccountChange],
  ctx: &ApplyContext<'_>,
) -> Result<()> {
  let account_id = account.account_id;
  let mut promote_posix = false;

  for change in changes {
    debug!(account_id, ?change, "applying");
    match change {
      AccountChange::SpreadsAdd(spreads) => {
        for spread in spreads {
          store.add_spread(account_id, spread).await.map_err(Error::store)?;
          account.spreads.entry(spread.clone()).or_insert(None);
        }
      }
      AccountChange::SpreadExpire { spreads, expire_date } => {
        for spread in spreads {
          store
            .set_spread_expire(account_id, spread, Some(*expire_date))
            .await
            .map_err(Error::store)?;
          if let Some(date) = account.spreads.get_mut(spread) {
            *date = Some(*expire_date);
          }
        }
      }
      AccountChange::QuarantineAdd { quarantine_type, description } => {
        store
          .add_quarantine(NewQuarantine {
            entity_id:       account_id,
            quarantine_type: *quarantine_type,
            creator_id:      Some(ctx.bootstrap.creator_id),
            description:     description.clone(),
            start_date:      ctx.today,
            end_date:        None,
          })
          .await
          .map_err(Error::store)?;
        account.quarantines.insert(*quarantine_type);
      }
      AccountChange::QuarantineDel(quarantine_type) if !quarantine_type.is_auto() => {
        warn!(account_id, %quarantine_type, "not lifting a manual quarantine");
      }
      AccountChange::QuarantineDel(quarantine_type) => {
        store.delete_quarantine(account_id, *quarantine_type).await.map_err(Error::store)?;
        account.quarantines.remove(quarantine_type);
      }
      AccountChange::SetAccountType { ou_id, affiliation } => {
        let t = store
          .set_account_type(account_id, *ou_id, *affiliation)
          .await
          .map_err(Error::store)?;
        if !account.has_account_type(*ou_id, *affiliation) {
          account.account_types.push(t);
        }
      }
      AccountChange::Gecos(gecos) => {
        store.set_account_gecos(account_id, Some(gecos.clone())).await.map_err(Error::store)?;
      }
      AccountChange::ExpireDate(date) => {
        store.set_account_expire(account_id, Some(*date)).await.map_err(Error::store)?;
        account.expire_date = Some(*date);
      }
      AccountChange::PromotePosix => promote_posix = true,
      AccountChange::PrimaryEmail(address) => {
        store.set_primary_email(account_id, address).await.map_err(Error::store)?;
      }
    }
  }

  if promote_posix && !account.posix {
    let uid = store.free_uid(ctx.settings.uid_start).await.map_err(Error::store)?;
    store
      .add_posix_user(PosixUser {
        account_id,
        uid,
        gid_group: ctx.bootstrap.posix_group_id,
        shell: ctx.settings.default_shell.clone(),
      })
      .await
      .map_err(Error::store)?;
    account.posix = true;
    info!(account = %account.name, uid, "promoted to posix");
  }

  info!(account = %account.name, account_id, changes = changes.len(), "account changes written");
  Ok(())
}

// ─── Shared rules ────────────────────────────────────────────────────────────

/// The expire date to write, if any. `wanted` is the date the source asks
/// for (the deceased date for a deceased person). A later date always
/// wins; a deceased person's date wins regardless.
pub(crate) fn expire_change(
  current: Option<NaiveDate>,
  wanted: NaiveDate,
  deceased: bool,
) -> Option<NaiveDate> {
  match current {
    None => Some(wanted),
    Some(current) if wanted > current => Some(wanted),
    Some(current) if deceased && wanted != current => Some(wanted),
    Some(_) => None,
  }
}

/// `SetAccountType` for each affiliation the account has no type for.
pub(crate) fn missing_account_types<'a>(
  account: &ExistingAccount,
  affiliations: impl IntoIterator<Item = &'a PersonAffiliation>,
) -> Vec<AccountChange> {
  let mut seen = BTreeSet::new();
  affiliations
    .into_iter()
    .filter(|a| !account.has_account_type(a.ou_id, a.affiliation))
    .filter(|a| seen.insert((a.ou_id, a.affiliation)))
    .map(|a| AccountChange::SetAccountType { ou_id: a.ou_id, affiliation: a.affiliation })
    .collect()
}

/// `SpreadsAdd` for the spreads in `desired` the account lacks.
pub(crate) fn missing_spreads(
  account: &ExistingAccount,
  desired: &BTreeSet<String>,
) -> Option<AccountChange> {
  let to_add: Vec<String> =
    desired.iter().filter(|s| !account.spreads.contains_key(*s)).cloned().collect();
  (!to_add.is_empty()).then_some(AccountChange::SpreadsAdd(to_add))
}

/// `SpreadExpire` for the spreads in `desired` not already expiring on
/// `expire_date`. Spreads about to be added count as having no date.
pub(crate) fn stale_spread_expiry(
  account: &ExistingAccount,
  desired: &BTreeSet<String>,
  expire_date: NaiveDate,
) -> Option<AccountChange> {
  let spreads: Vec<String> = desired
    .iter()
    .filter(|s| account.spreads.get(*s) != Some(&Some(expire_date)))
    .cloned()
    .collect();
  (!spreads.is_empty()).then_some(AccountChange::SpreadExpire { spreads, expire_date })
}

/// The first and last name to build a username from. Names from `source`
/// are preferred, then cached names, then any.
async fn account_names<S: IdentityStore>(
  store: &S,
  person_id: EntityId,
  source: SourceSystem,
) -> Result<(String, String)> {
  let names = store.list_names(person_id).await.map_err(Error::store)?;
  let pick = |variant: NameVariant| {
    [Some(source), Some(SourceSystem::Cached), None].into_iter().find_map(|from| {
      names
        .iter()
        .find(|n| n.variant == variant && from.is_none_or(|s| n.source == s))
        .map(|n| n.name.clone())
    })
  };

  match (pick(NameVariant::First), pick(NameVariant::Last), pick(NameVariant::Full)) {
    (Some(first), Some(last), _) => Ok((first, last)),
    (first, None, Some(full)) => {
      let last = full.rsplit(' ').next().unwrap_or_default().to_owned();
      Ok((first.unwrap_or_default(), last))
    }
    _ => Err(Error::skip(format!("person {person_id} has no names"))),
  }
}

/// Create an account for `person_id` and add it to the cache.
pub(crate) async fn create_account<S: IdentityStore>(
  store: &S,
  existing: &mut Existing,
  person_id: EntityId,
  source: SourceSystem,
  postfix: &str,
  expire_date: NaiveDate,
  ctx: &ApplyContext<'_>,
) -> Result<EntityId> {
  let (first, last) = account_names(store, person_id, source).await?;
  let name = uname::suggest_uname(store, &first, &last, postfix).await?;
  let account = store
    .create_account(NewAccount {
      name:        name.clone(),
      owner_id:    person_id,
      creator_id:  Some(ctx.bootstrap.creator_id),
      expire_date: Some(expire_date),
      gecos:       Some(uname::gecos(&first, &last)),
    })
    .await
    .map_err(Error::store)?;
  let hash = password::hash(&password::generate())?;
  store.set_password_hash(account.account_id, hash).await.map_err(Error::store)?;
  info!(account = %name, person_id, "created account");

  let mut cached = ExistingAccount::new(account.account_id, name, person_id);
  cached.expire_date = account.expire_date;
  existing.insert_account(cached);
  Ok(account.account_id)
}

/// Apply `changes` to a cached account.
pub(crate) async fn write_changes<S: IdentityStore>(
  store: &S,
  existing: &mut Existing,
  account_id: EntityId,
  changes: &[AccountChange],
  ctx: &ApplyContext<'_>,
) -> Result<()> {
  let account = existing
    .account_mut(account_id)
    .ok_or_else(|| Error::skip(format!("account {account_id} is not cached")))?;
  apply_changes(store, account, changes, ctx).await
}

#[cfg(test)]
mod tests {
  use cerebrum_core::{
    code::{AffiliationStatus, Gender},
    entity::{NewAffiliation, NewPerson},
  };
  use cerebrum_store_sqlite::SqliteStore;

  use super::*;
  use crate::{
    Settings, bootstrap,
    fixtures::{self, day},
  };

  #[test]
  fn later_or_deceased_dates_win() {
    let d = |n| day(2024, 3, n);
    assert_eq!(expire_change(None, d(5), false), Some(d(5)));
    assert_eq!(expire_change(Some(d(1)), d(5), false), Some(d(5)));
    assert_eq!(expire_change(Some(d(9)), d(5), false), None);
    assert_eq!(expire_change(Some(d(9)), d(5), true), Some(d(5)));
    assert_eq!(expire_change(Some(d(5)), d(5), true), None);
  }

  async fn person_with_names(store: &SqliteStore, fnr: &str) -> EntityId {
    let p = store
      .create_person(NewPerson { birth_date: day(1980, 1, 1), gender: Gender::Female })
      .await
      .unwrap()
      .person_id;
    store
      .set_names(p, SourceSystem::Paga, vec![
        (NameVariant::First, "Kari".into()),
        (NameVariant::Last, "Nordmann".into()),
      ])
      .await
      .unwrap();
    store
      .set_external_ids(p, SourceSystem::Paga, vec![(ExternalIdType::Fodselsnr, fnr.into())])
      .await
      .unwrap();
    p
  }

  fn selection() -> Selection {
    Selection {
      id_types:         vec![ExternalIdType::Fodselsnr],
      source:           SourceSystem::Paga,
      excluded_postfix: Some("-s".into()),
    }
  }

  #[tokio::test]
  async fn creates_and_changes_an_account() {
    let store = fixtures::store().await;
    let settings = Settings::default();
    let boot = bootstrap::load(&store, &settings).await.unwrap();
    let ctx =
      ApplyContext { bootstrap: boot, settings: &settings.cerebrum, today: fixtures::today() };
    let ou = fixtures::ou(&store, "740100", None).await;
    let p = person_with_names(&store, "01018012452").await;
    store
      .upsert_affiliation(
        NewAffiliation {
          person_id: p,
          ou_id:     ou,
          status:    AffiliationStatus::AnsattTekadm,
          source:    SourceSystem::Paga,
        },
        fixtures::today(),
      )
      .await
      .unwrap();

    let mut existing = load_existing(&store, &selection()).await.unwrap();
    let person = existing.find(ExternalIdType::Fodselsnr, "01018012452").unwrap().clone();
    assert_eq!(person.affiliations.len(), 1);
    assert!(existing.primary_account(&person).is_none());

    let id =
      create_account(&store, &mut existing, p, SourceSystem::Paga, "", day(2024, 3, 31), &ctx)
        .await
        .unwrap();
    let changes = vec![
      AccountChange::PromotePosix,
      AccountChange::SpreadsAdd(vec!["AD_account".into()]),
      AccountChange::SpreadExpire {
        spreads:     vec!["AD_account".into()],
        expire_date: day(2024, 4, 1),
      },
      AccountChange::SetAccountType { ou_id: ou, affiliation: Affiliation::Ansatt },
      AccountChange::QuarantineAdd { quarantine_type: QuarantineType::Tilbud, description: None },
    ];
    write_changes(&store, &mut existing, id, &changes, &ctx).await.unwrap();

    let account = store.get_account(id).await.unwrap().unwrap();
    assert_eq!(account.name, "kar001");
    assert_eq!(account.gecos.as_deref(), Some("Kari Nordmann"));
    let spreads = store.list_spreads(Some(id)).await.unwrap();
    assert_eq!(spreads.len(), 1);
    assert_eq!(spreads[0].expire_date, Some(day(2024, 4, 1)));
    let posix = store.list_posix_users().await.unwrap();
    assert_eq!(posix.len(), 1);
    assert_eq!(
      (posix[0].uid, posix[0].gid_group),
      (settings.cerebrum.uid_start, boot.posix_group_id)
    );

    // The cache saw the same changes as the store.
    let reloaded = load_existing(&store, &selection()).await.unwrap();
    assert_eq!(reloaded.account(id), existing.account(id));
    let person = reloaded.person(p).unwrap();
    assert_eq!(reloaded.primary_account(person).map(|a| a.account_id), Some(id));
  }

  #[tokio::test]
  async fn only_automatic_quarantines_are_lifted() {
    let store = fixtures::store().await;
    let settings = Settings::default();
    let boot = bootstrap::load(&store, &settings).await.unwrap();
    let ctx =
      ApplyContext { bootstrap: boot, settings: &settings.cerebrum, today: fixtures::today() };
    let p = person_with_names(&store, "01018012452").await;
    let mut existing = load_existing(&store, &selection()).await.unwrap();
    let id =
      create_account(&store, &mut existing, p, SourceSystem::Paga, "", day(2024, 3, 31), &ctx)
        .await
        .unwrap();

    let added = [QuarantineType::Generell, QuarantineType::Tilbud]
      .map(|quarantine_type| AccountChange::QuarantineAdd { quarantine_type, description: None });
    write_changes(&store, &mut existing, id, &added, &ctx).await.unwrap();
    let lifted =
      [QuarantineType::Generell, QuarantineType::Tilbud].map(AccountChange::QuarantineDel);
    write_changes(&store, &mut existing, id, &lifted, &ctx).await.unwrap();

    let left: Vec<QuarantineType> = store
      .list_quarantines(Some(id))
      .await
      .unwrap()
      .into_iter()
      .map(|q| q.quarantine_type)
      .collect();
    assert_eq!(left, [QuarantineType::Generell]);
    let cached = existing.account(id).unwrap();
    assert_eq!(cached.quarantines.iter().copied().collect::<Vec<_>>(), [QuarantineType::Generell]);
  }

  #[tokio::test]
  async fn excluded_postfix_hides_accounts() {
    let store = fixtures::store().await;
    let p = person_with_names(&store, "01018012452").await;
    for name in ["kar001", "kar001-s"] {
      store
        .create_account(NewAccount {
          name:        name.into(),
          owner_id:    p,
          creator_id:  None,
          expire_date: None,
          gecos:       None,
        })
        .await
        .unwrap();
    }
    let existing = load_existing(&store, &selection()).await.unwrap();
    let person = existing.person(p).unwrap();
    let names: Vec<&str> = existing.accounts_of(person).map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["kar001"]);
  }
}
