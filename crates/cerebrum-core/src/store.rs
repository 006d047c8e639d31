//! The `IdentityStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g.
//! `cerebrum-store-sqlite`). The batch jobs in `cerebrum-sync` and the
//! reports in `cerebrum-report` depend on this abstraction, not on any
//! concrete backend.
//!
//! Every call that changes something appends a row to the change log;
//! refreshing an affiliation's `last_date` does not. Calls that replace a
//! set of rows (`set_names`, `set_external_ids`, ...) return whether anything
//! actually changed, so callers can tell an update from a no-op.

use std::{collections::BTreeMap, future::Future};

use chrono::NaiveDate;

use crate::{
  code::{
    AddressType, Affiliation, EntityType, ExternalIdType, NameVariant, QuarantineType,
    SourceSystem,
  },
  entity::{
    Account, AccountType, Address, AddressFields, ChangeLogEntry, ContactInfo, EntityId,
    EntitySpread, ExternalId, Group, GroupMember, NewAccount, NewAffiliation, NewContact,
    NewGroup, NewOu, NewPerson, NewQuarantine, Ou, Person, PersonAffiliation, PersonName,
    PosixUser, Quarantine, Stedkode, pick_primary,
  },
  range::IdRange,
};

// ─── Query types ─────────────────────────────────────────────────────────────

/// Parameters for [`IdentityStore::list_affiliations`]. Empty fields match
/// everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffiliationFilter {
  pub person_id:   Option<EntityId>,
  pub ou_id:       Option<EntityId>,
  pub affiliation: Option<Affiliation>,
  pub source:      Option<SourceSystem>,
}

impl AffiliationFilter {
  pub fn source(source: SourceSystem) -> Self {
    Self { source: Some(source), ..Self::default() }
  }

  pub fn person(person_id: EntityId) -> Self {
    Self { person_id: Some(person_id), ..Self::default() }
  }
}

/// Parameters for [`IdentityStore::list_external_ids`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalIdFilter {
  pub entity_id: Option<EntityId>,
  pub id_type:   Option<ExternalIdType>,
  pub source:    Option<SourceSystem>,
}

/// What [`IdentityStore::upsert_affiliation`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
  Inserted,
  /// The status changed.
  Updated,
  /// Only `last_date` was touched.
  Unchanged,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a Cerebrum database.
///
/// A batch job opens one store, calls [`begin`](IdentityStore::begin), does
/// its work and ends with either [`commit`](IdentityStore::commit) or
/// [`rollback`](IdentityStore::rollback).
///
/// All methods return `Send` futures.
pub trait IdentityStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Transactions ──────────────────────────────────────────────────────

  fn begin(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

  fn commit(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

  fn rollback(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

  /// The type of any entity, or `None` if the id is unknown.
  fn entity_type(
    &self,
    entity_id: EntityId,
  ) -> impl Future<Output = Result<Option<EntityType>, Self::Error>> + Send;

  // ── Organisational units ──────────────────────────────────────────────

  fn add_ou(&self, ou: NewOu) -> impl Future<Output = Result<Ou, Self::Error>> + Send;

  /// Overwrite name, acronym, stedkode and parent. Returns whether anything
  /// changed.
  fn update_ou(
    &self,
    ou_id: EntityId,
    ou: NewOu,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn set_ou_expire(
    &self,
    ou_id: EntityId,
    expire_date: Option<NaiveDate>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  fn get_ou(&self, ou_id: EntityId)
  -> impl Future<Output = Result<Option<Ou>, Self::Error>> + Send;

  fn find_ou_by_stedkode(
    &self,
    stedkode: Stedkode,
  ) -> impl Future<Output = Result<Option<Ou>, Self::Error>> + Send;

  fn list_ous(&self) -> impl Future<Output = Result<Vec<Ou>, Self::Error>> + Send;

  // ── Persons ───────────────────────────────────────────────────────────

  fn create_person(
    &self,
    person: NewPerson,
  ) -> impl Future<Output = Result<Person, Self::Error>> + Send;

  /// Overwrite birth date and gender. Returns whether anything changed.
  fn update_person(
    &self,
    person_id: EntityId,
    person: NewPerson,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn set_deceased(
    &self,
    person_id: EntityId,
    deceased_date: Option<NaiveDate>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  fn get_person(
    &self,
    person_id: EntityId,
  ) -> impl Future<Output = Result<Option<Person>, Self::Error>> + Send;

  fn list_persons(&self) -> impl Future<Output = Result<Vec<Person>, Self::Error>> + Send;

  /// Replace every name `source` has given this person.
  fn set_names(
    &self,
    person_id: EntityId,
    source: SourceSystem,
    names: Vec<(NameVariant, String)>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn list_names(
    &self,
    person_id: EntityId,
  ) -> impl Future<Output = Result<Vec<PersonName>, Self::Error>> + Send;

  // ── External ids, contact info, addresses ────────────────────────────

  /// Replace every external id `source` has given this entity.
  fn set_external_ids(
    &self,
    entity_id: EntityId,
    source: SourceSystem,
    ids: Vec<(ExternalIdType, String)>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  /// The entity carrying this external id from any source.
  fn find_by_external_id(
    &self,
    id_type: ExternalIdType,
    value: &str,
  ) -> impl Future<Output = Result<Option<EntityId>, Self::Error>> + Send;

  fn list_external_ids(
    &self,
    filter: ExternalIdFilter,
  ) -> impl Future<Output = Result<Vec<ExternalId>, Self::Error>> + Send;

  /// Replace every contact row `source` has given this entity.
  fn set_contact_info(
    &self,
    entity_id: EntityId,
    source: SourceSystem,
    contacts: Vec<NewContact>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn list_contact_info(
    &self,
    entity_id: EntityId,
  ) -> impl Future<Output = Result<Vec<ContactInfo>, Self::Error>> + Send;

  /// Replace every address `source` has given this entity.
  fn set_addresses(
    &self,
    entity_id: EntityId,
    source: SourceSystem,
    addresses: Vec<(AddressType, AddressFields)>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn list_addresses(
    &self,
    entity_id: EntityId,
  ) -> impl Future<Output = Result<Vec<Address>, Self::Error>> + Send;

  // ── Affiliations ──────────────────────────────────────────────────────

  /// Insert the affiliation or update its status, and in both cases set
  /// `last_date` to `today`.
  fn upsert_affiliation(
    &self,
    affiliation: NewAffiliation,
    today: NaiveDate,
  ) -> impl Future<Output = Result<Upsert, Self::Error>> + Send;

  fn list_affiliations(
    &self,
    filter: AffiliationFilter,
  ) -> impl Future<Output = Result<Vec<PersonAffiliation>, Self::Error>> + Send;

  /// Delete one source's affiliation row. Account types pointing at the
  /// affiliation go with it once no source provides it any more.
  fn delete_affiliation(
    &self,
    person_id: EntityId,
    ou_id: EntityId,
    affiliation: Affiliation,
    source: SourceSystem,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  // ── Spreads ───────────────────────────────────────────────────────────

  /// Make a spread code known, for entities of one type. Idempotent.
  fn register_spread(
    &self,
    code: &str,
    entity_type: EntityType,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  fn spread_entity_type(
    &self,
    code: &str,
  ) -> impl Future<Output = Result<Option<EntityType>, Self::Error>> + Send;

  /// Returns `false` if the entity already had the spread.
  fn add_spread(
    &self,
    entity_id: EntityId,
    spread: &str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn delete_spread(
    &self,
    entity_id: EntityId,
    spread: &str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn set_spread_expire(
    &self,
    entity_id: EntityId,
    spread: &str,
    expire_date: Option<NaiveDate>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  /// Spreads of one entity, or of every entity when `entity_id` is `None`.
  fn list_spreads(
    &self,
    entity_id: Option<EntityId>,
  ) -> impl Future<Output = Result<Vec<EntitySpread>, Self::Error>> + Send;

  // ── Accounts ──────────────────────────────────────────────────────────

  /// Create an account owned by a person or a group. Fails if the name is
  /// taken.
  fn create_account(
    &self,
    account: NewAccount,
  ) -> impl Future<Output = Result<Account, Self::Error>> + Send;

  fn get_account(
    &self,
    account_id: EntityId,
  ) -> impl Future<Output = Result<Option<Account>, Self::Error>> + Send;

  fn find_account_by_name(
    &self,
    name: &str,
  ) -> impl Future<Output = Result<Option<Account>, Self::Error>> + Send;

  /// Accounts of one owner, or all accounts when `owner_id` is `None`.
  /// Expired accounts are included.
  fn list_accounts(
    &self,
    owner_id: Option<EntityId>,
  ) -> impl Future<Output = Result<Vec<Account>, Self::Error>> + Send;

  fn set_account_expire(
    &self,
    account_id: EntityId,
    expire_date: Option<NaiveDate>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  fn set_account_gecos(
    &self,
    account_id: EntityId,
    gecos: Option<String>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  fn set_password_hash(
    &self,
    account_id: EntityId,
    hash: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  /// Account types of one account, or of every account.
  fn list_account_types(
    &self,
    account_id: Option<EntityId>,
  ) -> impl Future<Output = Result<Vec<AccountType>, Self::Error>> + Send;

  /// Attach one of the owner's affiliations to the account. The owner must
  /// have the affiliation. New types get a priority one above the owner's
  /// current highest.
  fn set_account_type(
    &self,
    account_id: EntityId,
    ou_id: EntityId,
    affiliation: Affiliation,
  ) -> impl Future<Output = Result<AccountType, Self::Error>> + Send;

  fn delete_account_type(
    &self,
    account_id: EntityId,
    ou_id: EntityId,
    affiliation: Affiliation,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  // ── Posix ─────────────────────────────────────────────────────────────

  fn list_posix_users(&self) -> impl Future<Output = Result<Vec<PosixUser>, Self::Error>> + Send;

  /// The lowest uid at or above `start` that is above every uid in use.
  fn free_uid(&self, start: u32) -> impl Future<Output = Result<u32, Self::Error>> + Send;

  fn add_posix_user(
    &self,
    user: PosixUser,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  // ── Quarantines ───────────────────────────────────────────────────────

  /// Returns `false` if the entity already had a quarantine of that type.
  fn add_quarantine(
    &self,
    quarantine: NewQuarantine,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn delete_quarantine(
    &self,
    entity_id: EntityId,
    quarantine_type: QuarantineType,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  /// Quarantines of one entity, or of every entity.
  fn list_quarantines(
    &self,
    entity_id: Option<EntityId>,
  ) -> impl Future<Output = Result<Vec<Quarantine>, Self::Error>> + Send;

  // ── Groups ────────────────────────────────────────────────────────────

  fn create_group(
    &self,
    group: NewGroup,
  ) -> impl Future<Output = Result<Group, Self::Error>> + Send;

  fn find_group_by_name(
    &self,
    name: &str,
  ) -> impl Future<Output = Result<Option<Group>, Self::Error>> + Send;

  fn list_groups(&self) -> impl Future<Output = Result<Vec<Group>, Self::Error>> + Send;

  fn set_group_expire(
    &self,
    group_id: EntityId,
    expire_date: Option<NaiveDate>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  /// Returns `false` if the entity already was a member.
  fn add_member(
    &self,
    group_id: EntityId,
    member_id: EntityId,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn remove_member(
    &self,
    group_id: EntityId,
    member_id: EntityId,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  fn list_members(
    &self,
    group_id: EntityId,
  ) -> impl Future<Output = Result<Vec<GroupMember>, Self::Error>> + Send;

  // ── Email ─────────────────────────────────────────────────────────────

  fn get_primary_email(
    &self,
    account_id: EntityId,
  ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send;

  /// Returns whether the address changed.
  fn set_primary_email(
    &self,
    account_id: EntityId,
    address: &str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  // ── Change log ────────────────────────────────────────────────────────

  /// Change log rows whose ids fall in `range`, in id order. Unknown ids
  /// are skipped.
  fn get_changes(
    &self,
    range: IdRange,
  ) -> impl Future<Output = Result<Vec<ChangeLogEntry>, Self::Error>> + Send;

  /// Every change made to one entity, in id order.
  fn list_changes_for(
    &self,
    subject_id: EntityId,
  ) -> impl Future<Output = Result<Vec<ChangeLogEntry>, Self::Error>> + Send;
}

// ─── Derived queries ─────────────────────────────────────────────────────────

/// Each person's primary account among their unexpired accounts, keyed by
/// person.
pub async fn primary_accounts<S: IdentityStore>(
  store: &S,
  today: NaiveDate,
) -> Result<BTreeMap<EntityId, EntityId>, S::Error> {
  let mut candidates: BTreeMap<EntityId, (EntityId, Option<i32>)> = BTreeMap::new();
  for account in store.list_accounts(None).await? {
    if account.owner_type == EntityType::Person && !account.is_expired(today) {
      candidates.insert(account.account_id, (account.owner_id, None));
    }
  }
  for t in store.list_account_types(None).await? {
    if let Some((_, best)) = candidates.get_mut(&t.account_id) {
      *best = Some(best.map_or(t.priority, |b| b.min(t.priority)));
    }
  }

  let mut by_owner: BTreeMap<EntityId, Vec<(EntityId, Option<i32>)>> = BTreeMap::new();
  for (account_id, (owner, best)) in candidates {
    by_owner.entry(owner).or_default().push((account_id, best));
  }
  Ok(
    by_owner
      .into_iter()
      .filter_map(|(owner, accounts)| pick_primary(accounts).map(|a| (owner, a)))
      .collect(),
  )
}
