//! Accounts for SITO employees.
//!
//! SITO staff get a separate account whose name carries the SITO postfix,
//! so a person employed by both the university and SITO ends up with two.

use std::collections::BTreeSet;

use cerebrum_core::{
  code::{Affiliation, ExternalIdType, QuarantineType, SourceSystem},
  date::default_expire_date,
  entity::EntityId,
  store::IdentityStore,
};
use cerebrum_source::sito::SitoPerson;
use chrono::NaiveDate;
use tracing::debug;

use super::{
  AccountChange, ApplyContext, Existing, ExistingAccount, ExistingPerson, Selection,
  create_account, expire_change, load_existing, missing_account_types, missing_spreads,
  stale_spread_expiry, write_changes,
};
use crate::{
  Error, Result, Settings,
  bootstrap::Bootstrap,
  import::{ImportStats, Outcome},
  settings::SitoSettings,
};

const SOURCE: SourceSystem = SourceSystem::Sito;

pub async fn process_sito<S: IdentityStore>(
  store: &S,
  persons: Vec<cerebrum_source::Result<SitoPerson>>,
  settings: &Settings,
  bootstrap: Bootstrap,
  today: NaiveDate,
) -> Result<ImportStats> {
  let selection = Selection {
    id_types:         vec![ExternalIdType::SitoAnsattnr],
    source:           SOURCE,
    excluded_postfix: None,
  };
  let mut existing = load_existing(store, &selection).await?;
  let ctx = ApplyContext { bootstrap, settings: &settings.cerebrum, today };
  let mut stats = ImportStats::default();

  for person in persons {
    let person = match person {
      Ok(p) => p,
      Err(e) => {
        stats.absorb("sito", Err(Error::skip(e.to_string())))?;
        continue;
      }
    };
    let result = if person.deactivated {
      Err(Error::skip("deactivated"))
    } else {
      process_person(store, &mut existing, &person.employee_number, &settings.sito, &ctx).await
    };
    stats.absorb(&person.employee_number, result)?;
  }

  stats.log("process-sito");
  Ok(stats)
}

/// The person's SITO account: the one typed with a SITO affiliation, else
/// the one named with the postfix.
pub fn sito_account<'a>(
  existing: &'a Existing,
  person: &ExistingPerson,
  postfix: &str,
) -> Option<&'a ExistingAccount> {
  let mut accounts = person.accounts.iter().filter_map(|id| existing.account(*id));
  accounts
    .clone()
    .find(|a| a.has_affiliation(Affiliation::Sito))
    .or_else(|| accounts.find(|a| a.name.ends_with(postfix)))
}

async fn process_person<S: IdentityStore>(
  store: &S,
  existing: &mut Existing,
  employee_number: &str,
  settings: &SitoSettings,
  ctx: &ApplyContext<'_>,
) -> Result<Outcome> {
  let person = existing
    .find(ExternalIdType::SitoAnsattnr, employee_number)
    .cloned()
    .ok_or_else(|| Error::skip("not imported"))?;
  let wanted = person.deceased_date.unwrap_or_else(|| default_expire_date(ctx.today));

  let found: Option<EntityId> =
    sito_account(existing, &person, &settings.username_postfix).map(|a| a.account_id);
  let (account_id, created) = match found {
    Some(id) => (id, false),
    None => {
      let postfix = settings.username_postfix.as_str();
      let id = create_account(store, existing, person.person_id, SOURCE, postfix, wanted, ctx)
        .await?;
      (id, true)
    }
  };
  let account = existing
    .account(account_id)
    .ok_or_else(|| Error::skip(format!("account {account_id} is not cached")))?;

  let changes = account_changes(&person, account, settings, ctx.today);
  if !changes.is_empty() {
    debug!(account = %account.name, ?changes, "changes");
    write_changes(store, existing, account_id, &changes, ctx).await?;
  }
  Ok(Outcome::from_flags(created, !changes.is_empty()))
}

pub fn account_changes(
  person: &ExistingPerson,
  account: &ExistingAccount,
  settings: &SitoSettings,
  today: NaiveDate,
) -> Vec<AccountChange> {
  let mut changes = Vec::new();
  if !account.posix {
    changes.push(AccountChange::PromotePosix);
  }

  let wanted = person.deceased_date.unwrap_or_else(|| default_expire_date(today));
  if let Some(date) = expire_change(account.expire_date, wanted, person.deceased_date.is_some()) {
    changes.push(AccountChange::ExpireDate(date));
  }

  // SITO units have no stedkode; every affiliation is typed.
  changes.extend(missing_account_types(account, &person.affiliations));

  if !person.affiliations.is_empty() {
    let mut desired: BTreeSet<String> = settings.account_default_spreads.iter().cloned().collect();
    desired.insert("exchange_mailbox".to_owned());
    changes.extend(missing_spreads(account, &desired));
    changes.extend(stale_spread_expiry(account, &desired, wanted));
  }

  if account.quarantines.contains(&QuarantineType::Tilbud) {
    changes.push(AccountChange::QuarantineDel(QuarantineType::Tilbud));
  }
  changes
}
