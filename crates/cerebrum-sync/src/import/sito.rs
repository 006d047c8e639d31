//! SITO unit and person import.
//!
//! Units become OUs without a stedkode, identified by their guid
//! (`SITO_OU`). Persons get one `SITO/sito` affiliation per unit they work
//! in. Affiliations SITO no longer reports are always swept.

use std::collections::BTreeMap;

use cerebrum_core::{
  code::{AffiliationStatus, ContactType, ExternalIdType, Gender, NameVariant, SourceSystem},
  entity::{AffiliationKey, EntityId, NewAffiliation, NewContact, NewOu, NewPerson},
  fnr,
  store::{IdentityStore, Upsert},
};
use cerebrum_source::sito::{SitoPerson, SitoUnit};
use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use super::{ImportStats, Outcome, load_affiliation_keys, remove_old_affiliations};
use crate::{Error, Result, settings::SitoSettings};

const SOURCE: SourceSystem = SourceSystem::Sito;

// ─── Units ───────────────────────────────────────────────────────────────────

/// Create or rename an OU per active unit, then link each to its parent.
///
/// A unit whose parent is not in the export becomes a root. A parent that
/// is in the export but has no OU (it is deactivated) leaves the link as it
/// was.
pub async fn import_units<S: IdentityStore>(store: &S, units: &[SitoUnit]) -> Result<ImportStats> {
  let mut stats = ImportStats::default();
  let mut ids: BTreeMap<&str, EntityId> = BTreeMap::new();

  for unit in units {
    if unit.deactivated {
      debug!(unit = %unit.guid, "ignoring deactivated unit");
      continue;
    }
    let (ou_id, outcome) = upsert_unit(store, unit).await?;
    stats.record(outcome);
    ids.insert(unit.guid.as_str(), ou_id);
  }

  for unit in units.iter().filter(|u| !u.deactivated) {
    let Some(&ou_id) = ids.get(unit.guid.as_str()) else { continue };
    let listed = unit.parent.as_deref().filter(|p| units.iter().any(|u| u.guid == *p));
    let parent_id = match listed {
      None => None,
      Some(guid) => match store
        .find_by_external_id(ExternalIdType::SitoOu, guid)
        .await
        .map_err(Error::store)?
      {
        Some(id) => Some(id),
        None => continue,
      },
    };
    let Some(ou) = store.get_ou(ou_id).await.map_err(Error::store)? else { continue };
    if ou.parent_id != parent_id {
      store
        .update_ou(ou_id, NewOu {
          stedkode: ou.stedkode,
          name: ou.name,
          acronym: ou.acronym,
          parent_id,
        })
        .await
        .map_err(Error::store)?;
    }
  }

  stats.log("import-sito-units");
  Ok(stats)
}

async fn upsert_unit<S: IdentityStore>(store: &S, unit: &SitoUnit) -> Result<(EntityId, Outcome)> {
  let found = store
    .find_by_external_id(ExternalIdType::SitoOu, &unit.guid)
    .await
    .map_err(Error::store)?;

  let (ou_id, created, mut changed) = match found {
    Some(ou_id) => {
      let current = store.get_ou(ou_id).await.map_err(Error::store)?;
      let changed = store
        .update_ou(ou_id, NewOu {
          stedkode:  None,
          name:      unit.name.clone(),
          acronym:   Some(unit.name.clone()),
          parent_id: current.and_then(|ou| ou.parent_id),
        })
        .await
        .map_err(Error::store)?;
      (ou_id, false, changed)
    }
    None => {
      let ou = store
        .add_ou(NewOu {
          stedkode:  None,
          name:      unit.name.clone(),
          acronym:   Some(unit.name.clone()),
          parent_id: None,
        })
        .await
        .map_err(Error::store)?;
      info!(unit = %unit.guid, ou_id = ou.ou_id, name = %unit.name, "created OU");
      (ou.ou_id, true, false)
    }
  };

  changed |= store
    .set_external_ids(ou_id, SOURCE, vec![(ExternalIdType::SitoOu, unit.guid.clone())])
    .await
    .map_err(Error::store)?;
  Ok((ou_id, Outcome::from_flags(created, changed)))
}

// ─── Persons ─────────────────────────────────────────────────────────────────

/// Birth date and gender reconciled from the ssn and the separate fields.
fn identity(p: &SitoPerson) -> Result<(Option<&str>, NaiveDate, Gender)> {
  let ssn = p.ssn.as_deref().map(str::trim).filter(|s| fnr::validate(s).is_ok());

  let gender = match (ssn, p.gender.as_deref()) {
    (Some(s), _) => fnr::gender(s)?,
    (None, Some("Female")) => Gender::Female,
    (None, Some("Male")) => Gender::Male,
    (None, other) => {
      warn!(employee = %p.employee_number, gender = ?other, "unknown gender");
      Gender::Unknown
    }
  };

  let birth_date = match (ssn, p.birth_date) {
    (Some(s), Some(born)) => {
      let from_ssn = fnr::birth_date(s)?;
      if born != from_ssn {
        return Err(Error::skip(format!(
          "birth date {born} does not match ssn ({from_ssn})"
        )));
      }
      born
    }
    (Some(s), None) => {
      warn!(employee = %p.employee_number, "no birth date, using the ssn");
      fnr::birth_date(s)?
    }
    (None, Some(born)) => born,
    (None, None) => return Err(Error::skip("missing ssn and birth date")),
  };

  Ok((ssn, birth_date, gender))
}

/// Import a SITO person export. Affiliations not seen are swept with the
/// SITO grace period.
pub async fn import_persons<S: IdentityStore>(
  store: &S,
  persons: Vec<cerebrum_source::Result<SitoPerson>>,
  settings: &SitoSettings,
  today: NaiveDate,
) -> Result<ImportStats> {
  let mut stats = ImportStats::default();
  let mut sweep = load_affiliation_keys(store, SOURCE).await?;

  for person in persons {
    let person = match person {
      Ok(p) => p,
      Err(e) => {
        stats.absorb("sito", Err(Error::skip(e.to_string())))?;
        continue;
      }
    };
    let result = import_person(store, &person, today).await;
    if let Ok((_, keys)) = &result {
      for key in keys {
        sweep.mark(key);
      }
    }
    stats.absorb(&person.employee_number, result.map(|(outcome, _)| outcome))?;
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
  stats.log("import-sito");
  Ok(stats)
}

async fn import_person<S: IdentityStore>(
  store: &S,
  p: &SitoPerson,
  today: NaiveDate,
) -> Result<(Outcome, Vec<AffiliationKey>)> {
  if p.deactivated {
    return Err(Error::skip("deactivated"));
  }
  if p.units.is_empty() {
    return Err(Error::skip("no current employment"));
  }
  let (ssn, birth_date, gender) = identity(p)?;
  if p.first_name.trim().is_empty() {
    return Err(Error::skip("missing first name"));
  }
  if p.last_name.trim().is_empty() {
    return Err(Error::skip("missing last name"));
  }

  let mut found = store
    .find_by_external_id(ExternalIdType::SitoAnsattnr, &p.employee_number)
    .await
    .map_err(Error::store)?;
  if found.is_none()
    && let Some(s) = ssn
  {
    found = store.find_by_external_id(ExternalIdType::Fodselsnr, s).await.map_err(Error::store)?;
  }

  let new = NewPerson { birth_date, gender };
  let (person_id, created, mut changed) = match found {
    Some(person_id) => {
      let changed = store.update_person(person_id, new).await.map_err(Error::store)?;
      (person_id, false, changed)
    }
    None => {
      let person = store.create_person(new).await.map_err(Error::store)?;
      info!(employee = %p.employee_number, person_id = person.person_id, "created person");
      (person.person_id, true, false)
    }
  };

  let first = match &p.middle_name {
    Some(middle) => format!("{} {}", p.first_name.trim(), middle.trim()),
    None => p.first_name.trim().to_owned(),
  };
  let mut names = vec![
    (NameVariant::First, first),
    (NameVariant::Last, p.last_name.trim().to_owned()),
  ];
  if let Some(title) = &p.title {
    names.push((NameVariant::WorkTitle, title.clone()));
  }
  changed |= store.set_names(person_id, SOURCE, names).await.map_err(Error::store)?;

  let mut ids = vec![(ExternalIdType::SitoAnsattnr, p.employee_number.clone())];
  if let Some(s) = ssn {
    ids.push((ExternalIdType::Fodselsnr, s.to_owned()));
  }
  changed |= store.set_external_ids(person_id, SOURCE, ids).await.map_err(Error::store)?;

  let mut keys = Vec::new();
  for guid in &p.units {
    let Some(ou_id) = unit_ou(store, guid, today).await? else { continue };
    let new = NewAffiliation {
      person_id,
      ou_id,
      status: AffiliationStatus::SitoAnsatt,
      source: SOURCE,
    };
    if keys.contains(&new.key()) {
      continue;
    }
    keys.push(new.key());
    let upsert = store.upsert_affiliation(new, today).await.map_err(Error::store)?;
    changed |= upsert != Upsert::Unchanged;
  }

  let mut next: BTreeMap<ContactType, u32> = BTreeMap::new();
  let contacts = p
    .phones
    .iter()
    .map(|(contact_type, number)| {
      let slot = next.entry(*contact_type).or_default();
      let preference = *slot;
      *slot += 1;
      NewContact { contact_type: *contact_type, preference, value: number.clone() }
    })
    .collect();
  changed |= store.set_contact_info(person_id, SOURCE, contacts).await.map_err(Error::store)?;

  Ok((Outcome::from_flags(created, changed), keys))
}

/// The live OU for a unit guid.
async fn unit_ou<S: IdentityStore>(
  store: &S,
  guid: &str,
  today: NaiveDate,
) -> Result<Option<EntityId>> {
  let Some(ou_id) =
    store.find_by_external_id(ExternalIdType::SitoOu, guid).await.map_err(Error::store)?
  else {
    error!(unit = guid, "person registered to an unknown unit");
    return Ok(None);
  };
  let expired = store
    .get_ou(ou_id)
    .await
    .map_err(Error::store)?
    .is_none_or(|ou| ou.expire_date.is_some_and(|d| d <= today));
  if expired {
    error!(unit = guid, ou_id, "person registered to an expired unit");
    return Ok(None);
  }
  Ok(Some(ou_id))
}

#[cfg(test)]
mod tests {
  use cerebrum_core::store::AffiliationFilter;
  use cerebrum_store_sqlite::SqliteStore;

  use super::*;
  use crate::fixtures::{self, day};

  fn unit(guid: &str, parent: Option<&str>, deactivated: bool) -> SitoUnit {
    SitoUnit {
      guid: guid.to_owned(),
      name: format!("Unit {guid}"),
      deactivated,
      parent: parent.map(str::to_owned),
    }
  }

  fn kari(units: &[&str]) -> SitoPerson {
    SitoPerson {
      employee_number: "5001".into(),
      deactivated:     false,
      ssn:             Some("01018012452".into()),
      gender:          Some("Female".into()),
      birth_date:      Some(day(1980, 1, 1)),
      first_name:      "Kari".into(),
      middle_name:     Some("Anne".into()),
      last_name:       "Nordmann".into(),
      email:           None,
      phones:          vec![
        (ContactType::Mobile, "90000000".into()),
        (ContactType::Mobile, "90000001".into()),
      ],
      units:           units.iter().map(|u| (*u).to_owned()).collect(),
      title:           Some("Kokk".into()),
    }
  }

  async fn sito_ou(store: &SqliteStore, guid: &str) -> Option<EntityId> {
    store.find_by_external_id(ExternalIdType::SitoOu, guid).await.unwrap()
  }

  #[tokio::test]
  async fn units_link_to_listed_parents() {
    let store = fixtures::store().await;
    let units = [
      unit("kantina", Some("root"), false),
      unit("root", None, false),
      unit("orphan", Some("elsewhere"), false),
      unit("closed", Some("root"), true),
    ];
    let stats = import_units(&store, &units).await.unwrap();
    assert_eq!(stats.added, 3);

    let root = sito_ou(&store, "root").await.unwrap();
    let kantina = store.get_ou(sito_ou(&store, "kantina").await.unwrap()).await.unwrap().unwrap();
    assert_eq!(kantina.parent_id, Some(root));
    assert_eq!(kantina.acronym.as_deref(), Some("Unit kantina"));
    let orphan = store.get_ou(sito_ou(&store, "orphan").await.unwrap()).await.unwrap().unwrap();
    assert_eq!(orphan.parent_id, None);
    assert!(sito_ou(&store, "closed").await.is_none());

    let stats = import_units(&store, &units).await.unwrap();
    assert_eq!((stats.added, stats.unchanged), (0, 3));
  }

  #[test]
  fn identity_reconciliation() {
    let person = kari(&["u"]);
    let (ssn, born, gender) = identity(&person).unwrap();
    assert_eq!((ssn, born, gender), (Some("01018012452"), day(1980, 1, 1), Gender::Female));

    let mismatch = SitoPerson { birth_date: Some(day(1980, 1, 2)), ..kari(&["u"]) };
    assert!(matches!(identity(&mismatch), Err(Error::Skip(_))));

    let no_ssn = SitoPerson { ssn: Some("123".into()), gender: None, ..kari(&["u"]) };
    let (ssn, born, gender) = identity(&no_ssn).unwrap();
    assert_eq!((ssn, born, gender), (None, day(1980, 1, 1), Gender::Unknown));

    let nothing = SitoPerson { ssn: None, birth_date: None, ..kari(&["u"]) };
    assert!(matches!(identity(&nothing), Err(Error::Skip(_))));
  }

  #[tokio::test]
  async fn persons_get_one_affiliation_per_unit() {
    let store = fixtures::store().await;
    import_units(&store, &[unit("root", None, false), unit("kantina", Some("root"), false)])
      .await
      .unwrap();

    let persons = vec![
      Ok(kari(&["kantina", "root", "unknown"])),
      Ok(SitoPerson { employee_number: "5002".into(), deactivated: true, ..kari(&["root"]) }),
    ];
    let stats =
      import_persons(&store, persons, &SitoSettings::default(), fixtures::today()).await.unwrap();
    assert_eq!((stats.added, stats.skipped), (1, 1));

    let person_id = store
      .find_by_external_id(ExternalIdType::SitoAnsattnr, "5001")
      .await
      .unwrap()
      .unwrap();
    let affs = store.list_affiliations(AffiliationFilter::person(person_id)).await.unwrap();
    assert_eq!(affs.len(), 2);
    assert!(affs.iter().all(|a| a.status == AffiliationStatus::SitoAnsatt));

    let names = store.list_names(person_id).await.unwrap();
    assert!(names.iter().any(|n| n.variant == NameVariant::First && n.name == "Kari Anne"));
    let prefs: Vec<u32> =
      store.list_contact_info(person_id).await.unwrap().iter().map(|c| c.preference).collect();
    assert_eq!(prefs, [0, 1]);

    // The person leaves the kantina; the row survives the grace period.
    let persons = vec![Ok(kari(&["root"]))];
    let later = day(2024, 3, 10);
    let stats = import_persons(&store, persons, &SitoSettings::default(), later).await.unwrap();
    assert_eq!((stats.sweep.deleted, stats.sweep.kept), (0, 1));
    let persons = vec![Ok(kari(&["root"]))];
    let stats =
      import_persons(&store, persons, &SitoSettings::default(), day(2024, 3, 16)).await.unwrap();
    assert_eq!(stats.sweep.deleted, 1);
  }
}
