//! Accounts for PAGA employees.
//!
//! Every employee in the export gets one university account. The account
//! follows the person's PAGA affiliations: it is kept alive a month past
//! each run, typed with the affiliations at real stedkoder, and given the
//! default spreads. Accounts ending with the SITO postfix are left alone.

use std::collections::BTreeSet;

use cerebrum_core::{
  code::{AffiliationStatus, ExternalIdType, QuarantineType, SourceSystem},
  date::default_expire_date,
  entity::EntityId,
  fnr,
  store::IdentityStore,
};
use cerebrum_source::paga::PagaPerson;
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
  import::{ImportStats, Outcome, paga::passport_id},
  settings::PagaSettings,
};

const SOURCE: SourceSystem = SourceSystem::Paga;

/// How a PAGA record is looked up: the national id unless it is missing or
/// a placeholder, else the passport number.
pub fn identifier(p: &PagaPerson) -> Result<(ExternalIdType, String)> {
  let national_id = p.national_id.trim();
  if !national_id.is_empty() && !fnr::is_placeholder(national_id) {
    return Ok((ExternalIdType::Fodselsnr, national_id.to_owned()));
  }
  passport_id(p)
    .map(|id| (ExternalIdType::PassNumber, id))
    .ok_or_else(|| Error::skip("no national id and no usable passport"))
}

/// Create and maintain accounts for the persons in a PAGA export. With
/// `only`, every other person is ignored.
pub async fn process_paga<S: IdentityStore>(
  store: &S,
  persons: Vec<cerebrum_source::Result<PagaPerson>>,
  settings: &Settings,
  bootstrap: Bootstrap,
  today: NaiveDate,
  only: Option<&(ExternalIdType, String)>,
) -> Result<ImportStats> {
  let selection = Selection {
    id_types:         vec![ExternalIdType::Fodselsnr, ExternalIdType::PassNumber],
    source:           SOURCE,
    excluded_postfix: Some(settings.sito.username_postfix.clone()),
  };
  let mut existing = load_existing(store, &selection).await?;
  let ctx = ApplyContext { bootstrap, settings: &settings.cerebrum, today };
  let mut stats = ImportStats::default();

  for person in persons {
    let person = match person {
      Ok(p) => p,
      Err(e) => {
        stats.absorb("paga", Err(Error::skip(e.to_string())))?;
        continue;
      }
    };
    let key = match identifier(&person) {
      Ok(key) => key,
      Err(e) => {
        stats.absorb(&person.employee_number, Err(e))?;
        continue;
      }
    };
    if only.is_some_and(|wanted| *wanted != key) {
      continue;
    }
    let result = process_person(store, &mut existing, &key, &settings.paga, &ctx).await;
    stats.absorb(&person.employee_number, result)?;
  }

  stats.log("process-paga");
  Ok(stats)
}

async fn process_person<S: IdentityStore>(
  store: &S,
  existing: &mut Existing,
  (id_type, value): &(ExternalIdType, String),
  settings: &PagaSettings,
  ctx: &ApplyContext<'_>,
) -> Result<Outcome> {
  let person = existing
    .find(*id_type, value)
    .cloned()
    .ok_or_else(|| Error::skip(format!("{id_type} {value} not imported")))?;
  let wanted = person.deceased_date.unwrap_or_else(|| default_expire_date(ctx.today));

  let (account_id, created) = match existing.primary_account(&person) {
    Some(a) => (a.account_id, false),
    None => {
      let id = create_account(store, existing, person.person_id, SOURCE, "", wanted, ctx).await?;
      (id, true)
    }
  };
  let account = existing
    .account(account_id)
    .ok_or_else(|| Error::skip(format!("account {account_id} is not cached")))?;

  let changes = account_changes(existing, &person, account, settings, ctx.today);
  if !changes.is_empty() {
    debug!(account = %account.name, ?changes, "changes");
    write_changes(store, existing, account_id, &changes, ctx).await?;
  }
  Ok(Outcome::from_flags(created, !changes.is_empty()))
}

/// What has to change for `account` to match the person's PAGA data.
pub fn account_changes(
  existing: &Existing,
  person: &ExistingPerson,
  account: &ExistingAccount,
  settings: &PagaSettings,
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

  // Only affiliations at OUs with a stedkode become account types.
  let stedkode_of = |ou_id: EntityId| existing.ou(ou_id).and_then(|ou| ou.stedkode);
  let mut typed_ous: Vec<EntityId> = account.account_types.iter().map(|t| t.ou_id).collect();
  for change in missing_account_types(
    account,
    person.affiliations.iter().filter(|a| stedkode_of(a.ou_id).is_some()),
  ) {
    if let AccountChange::SetAccountType { ou_id, .. } = &change {
      typed_ous.push(*ou_id);
    }
    changes.push(change);
  }

  if !person.affiliations.is_empty() {
    let mut desired: BTreeSet<String> = settings.account_default_spreads.iter().cloned().collect();
    let has_mailbox_ou = typed_ous.into_iter().filter_map(stedkode_of).any(|sko| {
      let sko = sko.to_string();
      !settings.exchange_filter_sko.iter().any(|prefix| sko.starts_with(prefix.as_str()))
    });
    if has_mailbox_ou {
      desired.insert("exchange_mailbox".to_owned());
    }
    if person.affiliations.iter().any(|a| a.status == AffiliationStatus::AnsattVitenskapelig) {
      desired.insert(settings.scientific_spread.clone());
    }
    changes.extend(missing_spreads(account, &desired));
    changes.extend(stale_spread_expiry(account, &desired, wanted));
  }

  if account.quarantines.contains(&QuarantineType::Tilbud) {
    changes.push(AccountChange::QuarantineDel(QuarantineType::Tilbud));
  }
  changes
}

#[cfg(test)]
mod tests {
  use cerebrum_core::{code::Affiliation, entity::NewQuarantine};
  use cerebrum_store_sqlite::SqliteStore;

  use super::*;
  use crate::{
    fixtures::{self, day},
    import::paga::import_paga,
  };

  const XML: &str = r#"<data>
    <person ansattnr="1001" fnr="01018012452" fornavn="Kari" etternavn="Nordmann"
        fodselsdato="1980-01-01" kjonn="F">
      <tils dato_fra="2020-01-01" stillingsandel="100" tittel="professor"
        tjenesteforhold="F" hovedkategori="VIT" fakultetnr_utgift="74"
        instituttnr_utgift="1" gruppenr_utgift="0"/>
    </person>
    <person ansattnr="1002" fnr="01018012371" fornavn="Ola" etternavn="Nordmann"
        fodselsdato="1980-01-01" kjonn="M">
      <tils dato_fra="2020-01-01" stillingsandel="100" tittel="konsulent"
        tjenesteforhold="F" hovedkategori="ADM" fakultetnr_utgift="99"
        instituttnr_utgift="1" gruppenr_utgift="0"/>
    </person>
  </data>"#;

  async fn run(store: &SqliteStore, only: Option<&(ExternalIdType, String)>) -> ImportStats {
    let settings = Settings::default();
    let bootstrap = crate::bootstrap::load(store, &settings).await.unwrap();
    let persons = cerebrum_source::paga::parse(XML).unwrap();
    process_paga(store, persons, &settings, bootstrap, fixtures::today(), only).await.unwrap()
  }

  async fn fnr_owner(store: &SqliteStore, fnr: &str) -> EntityId {
    store.find_by_external_id(ExternalIdType::Fodselsnr, fnr).await.unwrap().unwrap()
  }

  #[test]
  fn placeholder_falls_back_to_passport() {
    let p = PagaPerson {
      national_id: "01018000000".into(),
      id_document_type: Some("passnummer".into()),
      id_document_number: Some("X123".into()),
      country: Some("SE".into()),
      ..PagaPerson::default()
    };
    assert_eq!(identifier(&p).unwrap(), (ExternalIdType::PassNumber, "SE-X123".to_owned()));
    let nothing = PagaPerson { country: None, ..p };
    assert!(matches!(identifier(&nothing), Err(Error::Skip(_))));
  }

  #[tokio::test]
  async fn employees_get_one_typed_account() {
    let store = fixtures::store().await;
    let ou = fixtures::ou(&store, "740100", None).await;
    fixtures::ou(&store, "990100", None).await;
    let persons = cerebrum_source::paga::parse(XML).unwrap();
    import_paga(&store, persons, &PagaSettings::default(), fixtures::today(), false).await.unwrap();

    let stats = run(&store, None).await;
    assert_eq!((stats.added, stats.skipped), (2, 0));

    let kari = fnr_owner(&store, "01018012452").await;
    let accounts = store.list_accounts(Some(kari)).await.unwrap();
    assert_eq!(accounts.len(), 1);
    let account = &accounts[0];
    assert_eq!(account.name, "kar001");
    assert_eq!(account.expire_date, Some(day(2024, 3, 31)));

    let types = store.list_account_types(Some(account.account_id)).await.unwrap();
    assert_eq!(types.len(), 1);
    assert_eq!((types[0].ou_id, types[0].affiliation), (ou, Affiliation::Ansatt));

    let spreads: BTreeSet<String> = store
      .list_spreads(Some(account.account_id))
      .await
      .unwrap()
      .into_iter()
      .map(|s| s.spread)
      .collect();
    let expected: BTreeSet<String> =
      ["AD_account", "cristin@uit", "exchange_mailbox", "people@ldap", "system@ldap"]
        .map(String::from)
        .into();
    assert_eq!(spreads, expected);

    // Employees at a filtered stedkode get no mailbox and, as
    // administrative staff, no research spread.
    let ola = fnr_owner(&store, "01018012371").await;
    let ola_account = &store.list_accounts(Some(ola)).await.unwrap()[0];
    let spreads: Vec<String> = store
      .list_spreads(Some(ola_account.account_id))
      .await
      .unwrap()
      .into_iter()
      .map(|s| s.spread)
      .collect();
    assert!(!spreads.contains(&"exchange_mailbox".to_owned()));
    assert!(!spreads.contains(&"cristin@uit".to_owned()));

    // Nothing left to do on the next run.
    let stats = run(&store, None).await;
    assert_eq!((stats.added, stats.updated, stats.unchanged), (0, 0, 2));
  }

  #[tokio::test]
  async fn single_person_mode_and_unknown_persons() {
    let store = fixtures::store().await;
    fixtures::ou(&store, "740100", None).await;

    // Nobody was imported, so everybody is skipped.
    let stats = run(&store, None).await;
    assert_eq!(stats.skipped, 2);

    let persons = cerebrum_source::paga::parse(XML).unwrap();
    import_paga(&store, persons, &PagaSettings::default(), fixtures::today(), false).await.unwrap();
    let only = (ExternalIdType::Fodselsnr, "01018012452".to_owned());
    let stats = run(&store, Some(&only)).await;
    assert_eq!((stats.added, stats.skipped), (1, 0));
    let ola = fnr_owner(&store, "01018012371").await;
    assert!(store.list_accounts(Some(ola)).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn deceased_persons_expire_and_offers_are_lifted() {
    let store = fixtures::store().await;
    fixtures::ou(&store, "740100", None).await;
    let persons = cerebrum_source::paga::parse(XML).unwrap();
    import_paga(&store, persons, &PagaSettings::default(), fixtures::today(), false).await.unwrap();
    run(&store, None).await;

    let kari = fnr_owner(&store, "01018012452").await;
    let account_id = store.list_accounts(Some(kari)).await.unwrap()[0].account_id;
    store.set_deceased(kari, Some(day(2024, 2, 20))).await.unwrap();
    store
      .add_quarantine(NewQuarantine {
        entity_id:       account_id,
        quarantine_type: QuarantineType::Tilbud,
        creator_id:      None,
        description:     None,
        start_date:      day(2024, 2, 1),
        end_date:        None,
      })
      .await
      .unwrap();

    let stats = run(&store, None).await;
    assert_eq!(stats.updated, 1);
    let account = store.get_account(account_id).await.unwrap().unwrap();
    assert_eq!(account.expire_date, Some(day(2024, 2, 20)));
    assert!(store.list_quarantines(Some(account_id)).await.unwrap().is_empty());
  }
}
