//! The PAGA HR export.
//!
//! ```xml
//! <data>
//!   <person ansattnr="1234" fnr="..." fornavn="Kari" etternavn="Nordmann"
//!           fodselsdato="1980-01-01" kjonn="F" lokasjon="A123" ...>
//!     <tils dato_fra="2020-01-01" stillingsandel="100" hovedkategori="VIT"
//!           fakultetnr_utgift="74" instituttnr_utgift="1" gruppenr_utgift="0" .../>
//!     <gjest .../> <permisjon .../> <arbtlf .../> <komm .../>
//!   </person>
//! </data>
//! ```
//!
//! Person-level identifiers are kept as the raw strings the file carries;
//! the importer decides what is valid. Child records are typed here, and a
//! malformed child record makes the whole person an error.

use std::collections::HashMap;

use cerebrum_core::{
  date::{entry_is_active, parse_date},
  entity::Stedkode,
};
use chrono::NaiveDate;
use quick_xml::events::Event;
use tracing::debug;

use crate::{Error, Result, xml::attributes};

type Attrs = HashMap<String, String>;

// ─── Records ─────────────────────────────────────────────────────────────────

/// One `<person>` element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PagaPerson {
  /// `ansattnr`; the PAGA primary key.
  pub employee_number:    String,
  /// `fnr`; may be empty or a `DDMMYY00000` placeholder.
  pub national_id:        String,
  /// `fodselsdato`, `YYYY-MM-DD`.
  pub birth_date:         String,
  /// `kjonn`, `M` or `F`.
  pub gender:             String,
  pub first_name:         String,
  pub last_name:          String,
  pub personal_title:     Option<String>,
  /// `lokasjon`; room / building code.
  pub location:           Option<String>,
  pub address:            Option<String>,
  pub postal_number:      Option<String>,
  pub city:               Option<String>,
  /// `edag_id_type`, e.g. `passnummer`.
  pub id_document_type:   Option<String>,
  pub id_document_number: Option<String>,
  pub country:            Option<String>,
  /// The OU printed on the pay slip.
  pub payslip_stedkode:   Option<Stedkode>,
  pub employments:        Vec<Employment>,
  pub guest_entries:      Vec<GuestEntry>,
  pub leaves:             Vec<Leave>,
  pub work_phones:        Vec<WorkPhone>,
  pub communications:     Vec<Communication>,
}

/// `<tils>`: one position.
#[derive(Debug, Clone, PartialEq)]
pub struct Employment {
  pub from:          NaiveDate,
  pub to:            Option<NaiveDate>,
  /// `stillingsandel`, percent of a full position.
  pub share:         f64,
  pub title:         String,
  /// `tjenesteforhold`; `T` for hourly paid.
  pub service_type:  String,
  /// `hovedkategori`: `TEKN`, `ADM` or `VIT`.
  pub main_category: String,
  /// The OU paying for the position.
  pub stedkode:      Stedkode,
}

/// `<gjest>`.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestEntry {
  pub from:       NaiveDate,
  pub to:         Option<NaiveDate>,
  pub guest_type: String,
  pub stedkode:   Option<Stedkode>,
}

/// `<permisjon>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Leave {
  pub from:  NaiveDate,
  pub to:    Option<NaiveDate>,
  pub code:  String,
  pub share: Option<f64>,
}

/// `<arbtlf>`: a switchboard number and an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPhone {
  pub number:    Option<String>,
  pub area_code: Option<String>,
  pub line:      Option<String>,
}

/// `<komm>`: a typed communication channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Communication {
  /// `kommtypekode`, e.g. `ARBTLF`, `FAX`.
  pub kind:  String,
  pub value: Option<String>,
  pub phone: Option<String>,
}

impl Employment {
  pub fn is_active(&self, today: NaiveDate, early_days: i64) -> bool {
    entry_is_active(today, self.from, self.to, early_days)
  }
}

impl GuestEntry {
  pub fn is_active(&self, today: NaiveDate, early_days: i64) -> bool {
    entry_is_active(today, self.from, self.to, early_days)
  }
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Pending {
  person:         Attrs,
  employments:    Vec<Attrs>,
  guest_entries:  Vec<Attrs>,
  leaves:         Vec<Attrs>,
  work_phones:    Vec<Attrs>,
  communications: Vec<Attrs>,
}

/// Parse a PAGA export. The outer error is for documents that are not
/// well-formed; each person gets its own result.
pub fn parse(xml: &str) -> Result<Vec<Result<PagaPerson>>> {
  let mut reader = quick_xml::Reader::from_str(xml);
  reader.config_mut().trim_text(true);

  let mut persons = Vec::new();
  let mut pending: Option<Pending> = None;

  loop {
    let (e, closed) = match reader.read_event()? {
      Event::Start(e) => (e, false),
      Event::Empty(e) => (e, true),
      Event::End(e) => {
        if e.local_name().as_ref() == b"person" {
          if let Some(p) = pending.take() {
            persons.push(build_person(p));
          }
        }
        continue;
      }
      Event::Eof => break,
      _ => continue,
    };

    let local = e.local_name();
    if local.as_ref() == b"person" {
      let p = Pending {
        person: attributes(&e)?,
        ..Pending::default()
      };
      if closed {
        persons.push(build_person(p));
      } else {
        pending = Some(p);
      }
      continue;
    }

    let Some(p) = pending.as_mut() else { continue };
    let list = match local.as_ref() {
      b"tils" => &mut p.employments,
      b"gjest" => &mut p.guest_entries,
      b"permisjon" => &mut p.leaves,
      b"arbtlf" => &mut p.work_phones,
      b"komm" => &mut p.communications,
      _ => continue,
    };
    list.push(attributes(&e)?);
  }

  debug!(count = persons.len(), "parsed PAGA export");
  Ok(persons)
}

fn opt(attrs: &Attrs, key: &str) -> Option<String> {
  attrs
    .get(key)
    .map(|v| v.trim())
    .filter(|v| !v.is_empty())
    .map(str::to_owned)
}

fn text(attrs: &Attrs, key: &str) -> String { opt(attrs, key).unwrap_or_default() }

fn required<'a>(
  attrs: &'a Attrs,
  element: &'static str,
  attribute: &'static str,
) -> Result<&'a str> {
  attrs
    .get(attribute)
    .map(|v| v.trim())
    .filter(|v| !v.is_empty())
    .ok_or(Error::MissingAttribute { element, attribute })
}

fn date(attrs: &Attrs, element: &'static str, attribute: &'static str) -> Result<NaiveDate> {
  Ok(parse_date(required(attrs, element, attribute)?)?)
}

/// An end date that does not parse is treated as open-ended.
fn end_date(attrs: &Attrs) -> Option<NaiveDate> {
  attrs.get("dato_til").and_then(|v| parse_date(v).ok())
}

fn number(value: &str, field: &'static str) -> Result<f64> {
  value
    .trim()
    .replace(',', ".")
    .parse()
    .map_err(|_| Error::InvalidValue { field, value: value.to_owned() })
}

fn stedkode(attrs: &Attrs, prefix: [&'static str; 3], element: &'static str) -> Result<Stedkode> {
  Ok(Stedkode::from_parts(
    required(attrs, element, prefix[0])?,
    required(attrs, element, prefix[1])?,
    required(attrs, element, prefix[2])?,
  )?)
}

fn build_person(p: Pending) -> Result<PagaPerson> {
  let a = &p.person;

  let payslip_stedkode = if a.contains_key("fakultetnr_for_lonnsslip") {
    Some(stedkode(
      a,
      [
        "fakultetnr_for_lonnsslip",
        "instituttnr_for_lonnsslip",
        "gruppenr_for_lonnsslip",
      ],
      "person",
    )?)
  } else {
    None
  };

  let employments = p
    .employments
    .iter()
    .map(|t| {
      Ok(Employment {
        from:          date(t, "tils", "dato_fra")?,
        to:            end_date(t),
        share:         number(required(t, "tils", "stillingsandel")?, "stillingsandel")?,
        title:         text(t, "tittel"),
        service_type:  text(t, "tjenesteforhold"),
        main_category: text(t, "hovedkategori"),
        stedkode:      stedkode(
          t,
          ["fakultetnr_utgift", "instituttnr_utgift", "gruppenr_utgift"],
          "tils",
        )?,
      })
    })
    .collect::<Result<Vec<_>>>()?;

  let guest_entries = p
    .guest_entries
    .iter()
    .map(|g| {
      let stedkode = if g.contains_key("fakultetnr") {
        Some(stedkode(g, ["fakultetnr", "instituttnr", "gruppenr"], "gjest")?)
      } else {
        None
      };
      Ok(GuestEntry {
        from: date(g, "gjest", "dato_fra")?,
        to: end_date(g),
        guest_type: text(g, "gjestetypekode"),
        stedkode,
      })
    })
    .collect::<Result<Vec<_>>>()?;

  let leaves = p
    .leaves
    .iter()
    .map(|l| {
      Ok(Leave {
        from:  date(l, "permisjon", "dato_fra")?,
        to:    end_date(l),
        code:  text(l, "permisjonskode"),
        share: opt(l, "andel_permisjon")
          .map(|v| number(&v, "andel_permisjon"))
          .transpose()?,
      })
    })
    .collect::<Result<Vec<_>>>()?;

  let work_phones = p
    .work_phones
    .iter()
    .map(|t| WorkPhone {
      number:    opt(t, "telefonnr"),
      area_code: opt(t, "innvalgnr"),
      line:      opt(t, "linjenr"),
    })
    .collect();

  let communications = p
    .communications
    .iter()
    .map(|k| Communication {
      kind:  text(k, "kommtypekode"),
      value: opt(k, "kommnrverdi"),
      phone: opt(k, "telefonnr"),
    })
    .collect();

  Ok(PagaPerson {
    employee_number: required(a, "person", "ansattnr")?.to_owned(),
    national_id: text(a, "fnr"),
    birth_date: text(a, "fodselsdato"),
    gender: text(a, "kjonn"),
    first_name: text(a, "fornavn"),
    last_name: text(a, "etternavn"),
    personal_title: opt(a, "tittel_personlig"),
    location: opt(a, "lokasjon"),
    address: opt(a, "adresse"),
    postal_number: opt(a, "postnr"),
    city: opt(a, "poststed"),
    id_document_type: opt(a, "edag_id_type"),
    id_document_number: opt(a, "edag_id_nr"),
    country: opt(a, "country"),
    payslip_stedkode,
    employments,
    guest_entries,
    leaves,
    work_phones,
    communications,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  const DOC: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<data>
  <person ansattnr="1001" fnr="01018012452" fornavn="Kari" etternavn="Nordmann"
          fodselsdato="1980-01-01" kjonn="F" lokasjon="A123" tittel_personlig="dr."
          fakultetnr_for_lonnsslip="74" instituttnr_for_lonnsslip="10" gruppenr_for_lonnsslip="0">
    <tils dato_fra="2020-01-01" stillingsandel="80,5" tittel="rådgiver" tjenesteforhold="F"
          hovedkategori="ADM" fakultetnr_utgift="74" instituttnr_utgift="10" gruppenr_utgift="0"/>
    <tils dato_fra="2021-01-01" dato_til="" stillingsandel="20" tittel="professor II"
          tjenesteforhold="F" hovedkategori="VIT" fakultetnr_utgift="74" instituttnr_utgift="20"
          gruppenr_utgift="0"/>
    <komm kommtypekode="ARBTLF" kommnrverdi="77644000"/>
    <arbtlf telefonnr="0" innvalgnr="776" linjenr="44000"/>
  </person>
  <person ansattnr="1002" fornavn="Ola" etternavn="Nordmann">
    <tils stillingsandel="100" hovedkategori="ADM"/>
  </person>
  <person ansattnr="1003" fnr="" fornavn="Per" etternavn="Utlending" edag_id_type="passnummer"
          edag_id_nr="X123" country="SE"/>
</data>"#;

  #[test]
  fn parses_persons_and_records() {
    let persons = parse(DOC).unwrap();
    assert_eq!(persons.len(), 3);

    let kari = persons[0].as_ref().unwrap();
    assert_eq!(kari.employee_number, "1001");
    assert_eq!(kari.payslip_stedkode.unwrap().to_string(), "741000");
    assert_eq!(kari.personal_title.as_deref(), Some("dr."));
    assert_eq!(kari.employments.len(), 2);
    assert_eq!(kari.employments[0].share, 80.5);
    assert_eq!(kari.employments[0].title, "rådgiver");
    assert_eq!(kari.employments[1].to, None);
    assert_eq!(kari.employments[1].stedkode.to_string(), "742000");
    assert_eq!(kari.communications[0].value.as_deref(), Some("77644000"));
    assert_eq!(kari.work_phones[0].line.as_deref(), Some("44000"));
  }

  #[test]
  fn malformed_record_fails_only_its_person() {
    let persons = parse(DOC).unwrap();
    assert!(matches!(
      persons[1],
      Err(Error::MissingAttribute { element: "tils", attribute: "dato_fra" })
    ));
    let per = persons[2].as_ref().unwrap();
    assert_eq!(per.national_id, "");
    assert_eq!(per.id_document_type.as_deref(), Some("passnummer"));
    assert_eq!(per.country.as_deref(), Some("SE"));
    assert!(per.employments.is_empty());
  }

  #[test]
  fn activity_uses_early_days() {
    let persons = parse(DOC).unwrap();
    let kari = persons[0].as_ref().unwrap();
    let day = NaiveDate::from_ymd_opt(2019, 12, 20).unwrap();
    assert!(!kari.employments[0].is_active(day, 0));
    assert!(kari.employments[0].is_active(day, 14));
  }

  #[test]
  fn broken_document_is_an_error() {
    assert!(parse("<data><person ansattnr='1'></data>").is_err());
  }
}
