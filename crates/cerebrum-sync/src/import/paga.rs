//! PAGA person import.
//!
//! One pass over the export: each `<person>` is validated, matched to a
//! person by employee number, national id or passport, and given the names,
//! ids, affiliations, contact info and addresses PAGA reports. With
//! `delete` the affiliations PAGA stopped reporting are swept afterwards.

use std::collections::BTreeMap;

use cerebrum_core::{
  code::{
    AddressType, Affiliation, AffiliationStatus, ContactType, ExternalIdType, Gender,
    NameVariant, SourceSystem,
  },
  date::parse_date,
  entity::{AddressFields, AffiliationKey, EntityId, NewAffiliation, NewContact, NewPerson},
  fnr,
  store::{AffiliationFilter, IdentityStore, Upsert},
};
use cerebrum_source::paga::{Communication, Employment, PagaPerson, WorkPhone};
use chrono::NaiveDate;
use tracing::{debug, info, warn};

use super::{ImportStats, OuCache, Outcome, load_affiliation_keys, remove_old_affiliations};
use crate::{Error, Result, diff::MarkAndSweep, settings::PagaSettings};

const SOURCE: SourceSystem = SourceSystem::Paga;

/// Import a parsed PAGA export.
pub async fn import_paga<S: IdentityStore>(
  store: &S,
  persons: Vec<cerebrum_source::Result<PagaPerson>>,
  settings: &PagaSettings,
  today: NaiveDate,
  delete: bool,
) -> Result<ImportStats> {
  let mut stats = ImportStats::default();
  let mut sweep = if delete { Some(load_affiliation_keys(store, SOURCE).await?) } else { None };
  let mut job = PersonImport { store, settings, today, ous: OuCache::new(today) };

  for person in persons {
    let person = match person {
      Ok(p) => p,
      Err(e) => {
        stats.absorb("paga", Err(Error::skip(e.to_string())))?;
        continue;
      }
    };
    let result = job.import(&person, sweep.as_mut()).await;
    stats.absorb(&person.employee_number, result)?;
  }

  if let Some(sweep) = sweep {
    stats.sweep = remove_old_affiliations(
      store,
      SOURCE,
      sweep.into_remaining(),
      settings.grace_period_days,
      today,
      &settings.person_spreads,
    )
    .await?;
  }

  stats.log("import-paga");
  Ok(stats)
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// The identifiers of one record, checked against each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Identity {
  pub employee_number: String,
  /// Empty numbers are dropped; placeholders are kept.
  pub fnr:             Option<String>,
  /// `CC-number`.
  pub passport:        Option<String>,
  pub birth_date:      NaiveDate,
  pub gender:          Gender,
}

impl Identity {
  /// The national id, unless it is a placeholder.
  pub fn real_fnr(&self) -> Option<&str> {
    self.fnr.as_deref().filter(|f| !fnr::is_placeholder(f))
  }
}

/// A passport number qualified with its issuing country.
pub(crate) fn passport_id(p: &PagaPerson) -> Option<String> {
  let kind = p.id_document_type.as_deref()?;
  let number = p.id_document_number.as_deref()?;
  let country = p.country.as_deref()?;
  let known = country.len() == 2 && country.bytes().all(|b| b.is_ascii_alphabetic());
  (kind.eq_ignore_ascii_case("passnummer") && known)
    .then(|| format!("{}-{}", country.to_ascii_uppercase(), number))
}

pub(crate) fn validate(p: &PagaPerson, today: NaiveDate) -> Result<Identity> {
  let employee_number = p
    .employee_number
    .trim()
    .parse::<u64>()
    .map_err(|_| Error::skip(format!("invalid ansattnr {:?}", p.employee_number)))?
    .to_string();

  let birth_date = parse_date(&p.birth_date)
    .map_err(|e| Error::skip(format!("invalid birth date: {e}")))?;
  let gender = if p.gender == "M" { Gender::Male } else { Gender::Female };

  let national_id = p.national_id.trim();
  if !national_id.is_empty() && !fnr::is_placeholder(national_id) {
    fnr::validate(national_id).map_err(|e| Error::skip(e.to_string()))?;
    let from_fnr = fnr::gender(national_id)?;
    if from_fnr != gender {
      return Err(Error::skip(format!(
        "gender {gender} does not match national id ({from_fnr})"
      )));
    }
    let born = fnr::birth_date(national_id)?;
    if !fnr::birthdates_match(birth_date, born, today) {
      return Err(Error::skip(format!(
        "birth date {birth_date} does not match national id ({born})"
      )));
    }
  }

  if p.first_name.trim().is_empty() || p.last_name.trim().is_empty() {
    return Err(Error::skip("missing names"));
  }

  Ok(Identity {
    employee_number,
    fnr: (!national_id.is_empty()).then(|| national_id.to_owned()),
    passport: passport_id(p),
    birth_date,
    gender,
  })
}

// ─── Derived data ────────────────────────────────────────────────────────────

fn employment_status(e: &Employment) -> Option<AffiliationStatus> {
  if e.service_type == "T" && e.share == 0.0 {
    return Some(AffiliationStatus::AnsattTimelonnet);
  }
  match e.main_category.as_str() {
    "TEKN" | "ADM" => Some(AffiliationStatus::AnsattTekadm),
    "VIT" => Some(AffiliationStatus::AnsattVitenskapelig),
    other => {
      warn!(category = other, "unknown main category");
      None
    }
  }
}

/// Title of the largest position. A `professor II` position counts a fifth
/// of its share.
fn work_title<'a>(active: &[&'a Employment]) -> Option<&'a str> {
  let mut best: Option<(f64, &str)> = None;
  for e in active {
    let share = if e.title == "professor II" { e.share / 5.0 } else { e.share };
    if best.is_none_or(|(top, _)| top < share) {
      best = Some((share, e.title.as_str()));
    }
  }
  best.map(|(_, title)| title).filter(|t| !t.is_empty())
}

/// Summed share of the active positions in a known category.
fn total_share(active: &[&Employment]) -> f64 {
  active
    .iter()
    .filter(|e| matches!(e.main_category.as_str(), "TEKN" | "ADM" | "VIT"))
    .map(|e| e.share)
    .sum()
}

fn non_zero(value: &Option<String>) -> Option<&str> {
  value.as_deref().filter(|v| v.trim_start_matches('0').trim() != "")
}

fn contacts(phones: &[WorkPhone], comms: &[Communication]) -> Vec<NewContact> {
  let mut found: Vec<(ContactType, String)> = Vec::new();
  for t in phones {
    if let Some(number) = non_zero(&t.number) {
      found.push((ContactType::Phone, number.to_owned()));
    }
    if let Some(line) = non_zero(&t.line) {
      let area = t.area_code.as_deref().unwrap_or_default();
      found.push((ContactType::Phone, format!("{area}{line:0>5}")));
    }
  }
  for k in comms {
    let contact_type = match k.kind.as_str() {
      "ARBTLF" | "EKSTRA TLF" | "JOBBTLFUTL" => ContactType::Phone,
      "FAX" | "FAXUTLAND" => ContactType::Fax,
      _ => continue,
    };
    if let Some(value) = k.value.as_ref().or(k.phone.as_ref()) {
      found.push((contact_type, value.clone()));
    }
  }

  let mut next: BTreeMap<ContactType, u32> = BTreeMap::new();
  found
    .into_iter()
    .map(|(contact_type, value)| {
      let slot = next.entry(contact_type).or_default();
      let preference = *slot;
      *slot += 1;
      NewContact { contact_type, preference, value }
    })
    .collect()
}

// ─── Per person ──────────────────────────────────────────────────────────────

struct PersonImport<'a, S> {
  store:    &'a S,
  settings: &'a PagaSettings,
  today:    NaiveDate,
  ous:      OuCache,
}

impl<S: IdentityStore> PersonImport<'_, S> {
  async fn find(&self, id: &Identity) -> Result<Option<EntityId>> {
    let mut lookups = vec![(ExternalIdType::PagaAnsattnr, id.employee_number.as_str())];
    if let Some(f) = id.real_fnr() {
      lookups.push((ExternalIdType::Fodselsnr, f));
    }
    if let Some(pass) = id.passport.as_deref() {
      lookups.push((ExternalIdType::PassNumber, pass));
    }
    for (id_type, value) in lookups {
      if let Some(found) =
        self.store.find_by_external_id(id_type, value).await.map_err(Error::store)?
      {
        return Ok(Some(found));
      }
    }
    Ok(None)
  }

  async fn import(
    &mut self,
    p: &PagaPerson,
    mut sweep: Option<&mut MarkAndSweep<AffiliationKey>>,
  ) -> Result<Outcome> {
    let store = self.store;
    let id = validate(p, self.today)?;
    debug!(paga_id = %id.employee_number, "processing");

    let new = NewPerson { birth_date: id.birth_date, gender: id.gender };
    let (person_id, created, mut changed) = match self.find(&id).await? {
      Some(person_id) => {
        let changed = store.update_person(person_id, new).await.map_err(Error::store)?;
        (person_id, false, changed)
      }
      None => {
        let person = store.create_person(new).await.map_err(Error::store)?;
        info!(paga_id = %id.employee_number, person_id = person.person_id, "created person");
        (person.person_id, true, false)
      }
    };

    let active: Vec<&Employment> = p
      .employments
      .iter()
      .filter(|e| e.is_active(self.today, self.settings.early_days))
      .collect();

    // Names and ids.
    let mut names = vec![
      (NameVariant::First, p.first_name.trim().to_owned()),
      (NameVariant::Last, p.last_name.trim().to_owned()),
      (NameVariant::Full, format!("{} {}", p.first_name.trim(), p.last_name.trim())),
    ];
    if let Some(title) = &p.personal_title {
      names.push((NameVariant::PersonalTitle, title.clone()));
    }
    if let Some(title) = work_title(&active) {
      names.push((NameVariant::WorkTitle, title.to_owned()));
    }
    changed |= store.set_names(person_id, SOURCE, names).await.map_err(Error::store)?;

    let mut ids = vec![(ExternalIdType::PagaAnsattnr, id.employee_number.clone())];
    if let Some(f) = &id.fnr {
      ids.push((ExternalIdType::Fodselsnr, f.clone()));
    }
    if let Some(pass) = &id.passport {
      ids.push((ExternalIdType::PassNumber, pass.clone()));
    }
    changed |= store.set_external_ids(person_id, SOURCE, ids).await.map_err(Error::store)?;

    // Affiliations; the first position at an OU decides the status.
    let mut affiliations: BTreeMap<EntityId, AffiliationStatus> = BTreeMap::new();
    for e in &active {
      let Some(status) = employment_status(e) else { continue };
      let Some(ou) = self.ous.get(store, e.stedkode).await? else { continue };
      affiliations.entry(ou.ou_id).or_insert(status);
    }
    for entry in p.guest_entries.iter().filter(|g| g.is_active(self.today, self.settings.early_days)) {
      debug!(paga_id = %id.employee_number, guest_type = %entry.guest_type, "guest entries are not imported");
    }

    for (ou_id, status) in affiliations {
      let new = NewAffiliation { person_id, ou_id, status, source: SOURCE };
      if let Some(sweep) = sweep.as_deref_mut() {
        sweep.mark(&new.key());
      }
      let upsert = store.upsert_affiliation(new, self.today).await.map_err(Error::store)?;
      changed |= upsert != Upsert::Unchanged;
    }

    // Contact info and addresses.
    changed |= store
      .set_contact_info(person_id, SOURCE, contacts(&p.work_phones, &p.communications))
      .await
      .map_err(Error::store)?;

    let mut addresses = Vec::new();
    if let Some(sko) = p.payslip_stedkode
      && let Some(ou) = self.ous.get(store, sko).await?
    {
      addresses.extend(ou.street.map(|a| (AddressType::Street, a)));
      addresses.extend(ou.post.map(|a| (AddressType::Post, a)));
    }
    if let Some(location) = &p.location {
      addresses.push((AddressType::Location, AddressFields {
        address_text: Some(location.clone()),
        ..AddressFields::default()
      }));
    }
    if p.address.is_some() || p.postal_number.is_some() || p.city.is_some() {
      addresses.push((AddressType::PrivatePost, AddressFields {
        address_text: p.address.clone(),
        postal_number: p.postal_number.clone(),
        city: p.city.clone(),
        ..AddressFields::default()
      }));
    }
    changed |= store.set_addresses(person_id, SOURCE, addresses).await.map_err(Error::store)?;

    changed |= self.set_person_spreads(person_id, total_share(&active)).await?;

    Ok(Outcome::from_flags(created, changed))
  }

  /// Employees above the configured share get the person spreads; everyone
  /// else loses them.
  async fn set_person_spreads(&self, person_id: EntityId, share: f64) -> Result<bool> {
    let store = self.store;
    let is_employee = !store
      .list_affiliations(AffiliationFilter {
        affiliation: Some(Affiliation::Ansatt),
        ..AffiliationFilter::person(person_id)
      })
      .await
      .map_err(Error::store)?
      .is_empty();

    let mut changed = false;
    for spread in &self.settings.person_spreads {
      changed |= if is_employee && share > self.settings.person_spreads_percentage {
        store.add_spread(person_id, spread).await.map_err(Error::store)?
      } else {
        store.delete_spread(person_id, spread).await.map_err(Error::store)?
      };
    }
    Ok(changed)
  }
}

#[cfg(test)]
mod tests {
  use cerebrum_core::store::ExternalIdFilter;

  use super::*;
  use crate::fixtures::{self, day};

  fn person(attrs: &str, records: &str) -> String {
    format!("<data><person {attrs}>{records}</person></data>")
  }

  const KARI: &str = r#"ansattnr="1001" fnr="01018012452" fornavn="Kari" etternavn="Nordmann"
    fodselsdato="1980-01-01" kjonn="F" lokasjon="A123""#;

  fn tils(from: &str, to: Option<&str>, share: &str, category: &str, sko: (u8, u8)) -> String {
    let to = to.map(|t| format!(r#"dato_til="{t}""#)).unwrap_or_default();
    format!(
      r#"<tils dato_fra="{from}" {to} stillingsandel="{share}" tittel="rådgiver"
        tjenesteforhold="F" hovedkategori="{category}" fakultetnr_utgift="{}"
        instituttnr_utgift="{}" gruppenr_utgift="0"/>"#,
      sko.0, sko.1
    )
  }

  async fn run(
    store: &cerebrum_store_sqlite::SqliteStore,
    xml: &str,
    today: NaiveDate,
    delete: bool,
  ) -> ImportStats {
    let persons = cerebrum_source::paga::parse(xml).unwrap();
    import_paga(store, persons, &PagaSettings::default(), today, delete).await.unwrap()
  }

  #[test]
  fn validation_rejects_inconsistent_records() {
    let today = fixtures::today();
    let base = PagaPerson {
      employee_number: "1001".into(),
      national_id: "01018012452".into(),
      birth_date: "1980-01-01".into(),
      gender: "F".into(),
      first_name: "Kari".into(),
      last_name: "Nordmann".into(),
      ..PagaPerson::default()
    };
    let id = validate(&base, today).unwrap();
    assert_eq!(id.real_fnr(), Some("01018012452"));

    let skip = |p: PagaPerson| matches!(validate(&p, today), Err(Error::Skip(_)));
    assert!(skip(PagaPerson { employee_number: "x1".into(), ..base.clone() }));
    assert!(skip(PagaPerson { gender: "M".into(), ..base.clone() }));
    assert!(skip(PagaPerson { birth_date: "1981-01-01".into(), ..base.clone() }));
    assert!(skip(PagaPerson { national_id: "01018012453".into(), ..base.clone() }));
    assert!(skip(PagaPerson { last_name: " ".into(), ..base.clone() }));

    // A placeholder is not checked against the birth date.
    let foreign = PagaPerson {
      national_id: "02028000000".into(),
      id_document_type: Some("passnummer".into()),
      id_document_number: Some("X123".into()),
      country: Some("se".into()),
      ..base
    };
    let id = validate(&foreign, today).unwrap();
    assert_eq!(id.real_fnr(), None);
    assert_eq!(id.passport.as_deref(), Some("SE-X123"));
  }

  #[test]
  fn title_and_share() {
    let e = |title: &str, share: f64, category: &str| Employment {
      from:          day(2020, 1, 1),
      to:            None,
      share,
      title:         title.to_owned(),
      service_type:  "F".to_owned(),
      main_category: category.to_owned(),
      stedkode:      "740100".parse().unwrap(),
    };
    let prof = e("professor II", 100.0, "VIT");
    let adv = e("rådgiver", 30.0, "ADM");
    let other = e("vaktmester", 40.0, "???");
    assert_eq!(work_title(&[&prof, &adv]), Some("rådgiver"));
    assert_eq!(total_share(&[&prof, &adv, &other]), 130.0);
  }

  #[test]
  fn contact_preferences_count_per_type() {
    let phones = [WorkPhone {
      number:    Some("0".into()),
      area_code: Some("776".into()),
      line:      Some("4400".into()),
    }];
    let comms = [
      Communication { kind: "ARBTLF".into(), value: Some("77644000".into()), phone: None },
      Communication { kind: "FAX".into(), value: None, phone: Some("77645000".into()) },
      Communication { kind: "EPOST".into(), value: Some("x@y".into()), phone: None },
    ];
    let found = contacts(&phones, &comms);
    let as_tuples: Vec<(ContactType, u32, &str)> =
      found.iter().map(|c| (c.contact_type, c.preference, c.value.as_str())).collect();
    assert_eq!(as_tuples, [
      (ContactType::Phone, 0, "77604400"),
      (ContactType::Phone, 1, "77644000"),
      (ContactType::Fax, 0, "77645000"),
    ]);
  }

  #[tokio::test]
  async fn open_ended_position_gives_one_affiliation() {
    let store = fixtures::store().await;
    let ou = fixtures::ou(&store, "740100", None).await;
    let xml = person(KARI, &tils("2020-01-01", None, "100", "VIT", (74, 1)));

    let stats = run(&store, &xml, fixtures::today(), false).await;
    assert_eq!((stats.added, stats.skipped), (1, 0));

    let person_id = store
      .find_by_external_id(ExternalIdType::PagaAnsattnr, "1001")
      .await
      .unwrap()
      .unwrap();
    let affs = store.list_affiliations(AffiliationFilter::person(person_id)).await.unwrap();
    assert_eq!(affs.len(), 1);
    assert_eq!(affs[0].ou_id, ou);
    assert_eq!(affs[0].status, AffiliationStatus::AnsattVitenskapelig);
    assert_eq!(affs[0].last_date, fixtures::today());

    // Full-time employees get the person spread.
    let spreads = store.list_spreads(Some(person_id)).await.unwrap();
    assert_eq!(spreads.len(), 1);
    assert_eq!(spreads[0].spread, "ansatt@ldap");

    // Found again by national id; nothing changes on a second run.
    let stats = run(&store, &xml, fixtures::today(), false).await;
    assert_eq!((stats.added, stats.unchanged), (0, 1));
    let ids = store
      .list_external_ids(ExternalIdFilter { entity_id: Some(person_id), ..Default::default() })
      .await
      .unwrap();
    assert_eq!(ids.len(), 2);
  }

  #[tokio::test]
  async fn delete_sweeps_only_past_the_grace_period() {
    let store = fixtures::store().await;
    let a = fixtures::ou(&store, "740100", None).await;
    let b = fixtures::ou(&store, "740200", None).await;
    let c = fixtures::ou(&store, "740300", None).await;

    // First run on 2024-02-01 reports all three OUs.
    let all = [(74, 1), (74, 2), (74, 3)]
      .into_iter()
      .map(|sko| tils("2020-01-01", None, "30", "ADM", sko))
      .collect::<String>();
    run(&store, &person(KARI, &all), day(2024, 2, 1), true).await;

    // On 2024-02-10 only A and B; on 2024-03-01 only A.
    let ab = [(74, 1), (74, 2)]
      .into_iter()
      .map(|sko| tils("2020-01-01", None, "30", "ADM", sko))
      .collect::<String>();
    run(&store, &person(KARI, &ab), day(2024, 2, 10), true).await;
    let stats = run(
      &store,
      &person(KARI, &tils("2020-01-01", None, "30", "ADM", (74, 1))),
      day(2024, 2, 20),
      true,
    )
    .await;

    // C was last seen 2024-02-01, 19 days ago: gone. B was last seen
    // 2024-02-10, 10 days ago: kept unchanged.
    assert_eq!((stats.sweep.deleted, stats.sweep.kept), (1, 1));
    let rows = store.list_affiliations(AffiliationFilter::source(SOURCE)).await.unwrap();
    let seen: BTreeMap<EntityId, NaiveDate> = rows.iter().map(|r| (r.ou_id, r.last_date)).collect();
    assert_eq!(seen, BTreeMap::from([(a, day(2024, 2, 20)), (b, day(2024, 2, 10))]));
    assert!(!seen.contains_key(&c));

    // Part-time: the person spread is gone.
    let person_id = rows[0].person_id;
    assert!(store.list_spreads(Some(person_id)).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn unknown_stedkode_gives_no_affiliation() {
    let store = fixtures::store().await;
    let xml = person(KARI, &tils("2020-01-01", Some("2030-01-01"), "100", "ADM", (99, 9)));
    let stats = run(&store, &xml, fixtures::today(), false).await;
    assert_eq!(stats.added, 1);
    assert!(store.list_affiliations(AffiliationFilter::source(SOURCE)).await.unwrap().is_empty());
  }
}
