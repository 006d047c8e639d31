//! SYSTEM-X guest import.
//!
//! Guests are matched by their SYSTEM-X id, falling back to the national id.
//! Each record carries one affiliation at one stedkode. Records whose expire
//! date has passed are ignored, so their affiliations age out through the
//! sweep.

use cerebrum_core::{
  code::{
    Affiliation, AffiliationStatus, ExternalIdType, Gender, NameVariant, SourceSystem, parse_code,
  },
  entity::{AffiliationKey, NewAffiliation, NewPerson, Stedkode},
  fnr,
  store::{IdentityStore, Upsert},
};
use cerebrum_source::sysx::SysXPerson;
use chrono::NaiveDate;
use tracing::info;

use super::{ImportStats, OuCache, Outcome, load_affiliation_keys, remove_old_affiliations};
use crate::{Error, Result, settings::SystemXSettings};

const SOURCE: SourceSystem = SourceSystem::SystemX;

/// The record's national id, when it is a valid one.
pub(crate) fn national_id(p: &SysXPerson) -> Option<&str> {
  p.national_identity_number
    .as_deref()
    .map(str::trim)
    .filter(|f| fnr::validate(f).is_ok())
}

/// The affiliation status a record asks for.
pub(crate) fn status(p: &SysXPerson) -> Result<AffiliationStatus> {
  let affiliation: Affiliation = parse_code("affiliation", &p.affiliation.to_ascii_uppercase())
    .map_err(|e| Error::skip(e.to_string()))?;
  AffiliationStatus::from_parts(affiliation, &p.affiliation_status)
    .map_err(|e| Error::skip(e.to_string()))
}

pub async fn import_systemx<S: IdentityStore>(
  store: &S,
  records: Vec<cerebrum_source::Result<SysXPerson>>,
  settings: &SystemXSettings,
  today: NaiveDate,
) -> Result<ImportStats> {
  let mut stats = ImportStats::default();
  let mut sweep = load_affiliation_keys(store, SOURCE).await?;
  let mut ous = OuCache::new(today);

  for record in records {
    let record = match record {
      Ok(r) => r,
      Err(e) => {
        stats.absorb("system-x", Err(Error::skip(e.to_string())))?;
        continue;
      }
    };
    let result = import_person(store, &mut ous, &record, today).await;
    if let Ok((_, Some(key))) = &result {
      sweep.mark(key);
    }
    stats.absorb(&record.id.to_string(), result.map(|(outcome, _)| outcome))?;
  }

  stats.sweep = remove_old_affiliations(
    store,
    SOURCE,
    sweep.into_remaining(),
    settings.grace_period_days,
    today,
    &[],
  )
  .await?;
  stats.log("import-systemx");
  Ok(stats)
}

async fn import_person<S: IdentityStore>(
  store: &S,
  ous: &mut OuCache,
  p: &SysXPerson,
  today: NaiveDate,
) -> Result<(Outcome, Option<AffiliationKey>)> {
  if p.expire_date < today {
    return Err(Error::skip(format!("expired {}", p.expire_date)));
  }
  let status = status(p)?;
  let stedkode: Stedkode =
    p.ou.parse().map_err(|e: cerebrum_core::Error| Error::skip(e.to_string()))?;
  let fnr = national_id(p);
  let sys_x_id = p.id.to_string();

  let birth_date = match (p.birth_date, fnr) {
    (Some(born), _) => born,
    (None, Some(f)) => fnr::birth_date(f)?,
    (None, None) => return Err(Error::skip("no birth date")),
  };
  let gender = match (p.gender.as_deref(), fnr) {
    (Some("M"), _) => Gender::Male,
    (Some("F"), _) => Gender::Female,
    (_, Some(f)) => fnr::gender(f)?,
    _ => Gender::Unknown,
  };

  let mut found = store
    .find_by_external_id(ExternalIdType::SysXId, &sys_x_id)
    .await
    .map_err(Error::store)?;
  if found.is_none()
    && let Some(f) = fnr
  {
    found = store.find_by_external_id(ExternalIdType::Fodselsnr, f).await.map_err(Error::store)?;
  }

  let new = NewPerson { birth_date, gender };
  let (person_id, created, mut changed) = match found {
    Some(person_id) => {
      let changed = store.update_person(person_id, new).await.map_err(Error::store)?;
      (person_id, false, changed)
    }
    None => {
      let person = store.create_person(new).await.map_err(Error::store)?;
      info!(sys_x_id = p.id, person_id = person.person_id, "created person");
      (person.person_id, true, false)
    }
  };

  let first = p.first_name.trim();
  let last = p.last_name.trim();
  let names = vec![
    (NameVariant::First, first.to_owned()),
    (NameVariant::Last, last.to_owned()),
    (NameVariant::Full, format!("{first} {last}")),
  ];
  changed |= store.set_names(person_id, SOURCE, names).await.map_err(Error::store)?;

  let mut ids = vec![(ExternalIdType::SysXId, sys_x_id)];
  if let Some(f) = fnr {
    ids.push((ExternalIdType::Fodselsnr, f.to_owned()));
  }
  changed |= store.set_external_ids(person_id, SOURCE, ids).await.map_err(Error::store)?;

  let mut key = None;
  if let Some(ou) = ous.get(store, stedkode).await? {
    let new = NewAffiliation { person_id, ou_id: ou.ou_id, status, source: SOURCE };
    key = Some(new.key());
    let upsert = store.upsert_affiliation(new, today).await.map_err(Error::store)?;
    changed |= upsert != Upsert::Unchanged;
  }

  Ok((Outcome::from_flags(created, changed), key))
}

#[cfg(test)]
mod tests {
  use cerebrum_core::store::AffiliationFilter;

  use super::*;
  use crate::fixtures::{self, day};

  fn guest(id: i64, expire: NaiveDate) -> SysXPerson {
    SysXPerson {
      id,
      birth_date: None,
      personnr: None,
      gender: None,
      first_name: "Gjest".into(),
      last_name: "Gjestesen".into(),
      ou: "740100".into(),
      affiliation: "MANUELL".into(),
      affiliation_status: "gjest".into(),
      expire_date: expire,
      spreads: vec!["AD_account".into()],
      legal_basis: None,
      contact_info: None,
      responsible_email: Some("boss@uit.no".into()),
      user_email: None,
      national_identity_number: Some("15050550025".into()),
      approved: true,
    }
  }

  #[tokio::test]
  async fn imports_guest_and_skips_expired_records() {
    let store = fixtures::store().await;
    let ou = fixtures::ou(&store, "740100", None).await;
    let records = vec![
      Ok(guest(7, day(2024, 6, 1))),
      Ok(SysXPerson { national_identity_number: None, ..guest(8, day(2024, 2, 1)) }),
      Ok(SysXPerson { affiliation_status: "nonsense".into(), ..guest(9, day(2024, 6, 1)) }),
    ];
    let stats =
      import_systemx(&store, records, &SystemXSettings::default(), fixtures::today()).await.unwrap();
    assert_eq!((stats.added, stats.skipped), (1, 2));

    let person_id =
      store.find_by_external_id(ExternalIdType::SysXId, "7").await.unwrap().unwrap();
    let person = store.get_person(person_id).await.unwrap().unwrap();
    assert_eq!(person.birth_date, day(2005, 5, 15));
    assert_eq!(person.gender, Gender::Female);

    let affs = store.list_affiliations(AffiliationFilter::person(person_id)).await.unwrap();
    assert_eq!(affs.len(), 1);
    assert_eq!((affs[0].ou_id, affs[0].status), (ou, AffiliationStatus::ManuellGjest));

    // Once the record expires the affiliation goes with the next run.
    let records = vec![Ok(guest(7, day(2024, 3, 1)))];
    let stats =
      import_systemx(&store, records, &SystemXSettings::default(), day(2024, 3, 2)).await.unwrap();
    assert_eq!((stats.skipped, stats.sweep.deleted), (1, 1));
  }
}
