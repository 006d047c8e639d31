//! The SITO HR export.
//!
//! Persons and units are separate documents with the same element
//! vocabulary. Values live in element text, not in attributes.

use cerebrum_core::{
  code::ContactType,
  date::{date_in_range, parse_date},
};
use chrono::NaiveDate;
use tracing::debug;

use crate::{
  Error, Result,
  xml::{Element, parse_tree},
};

// ─── Persons ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SitoPerson {
  pub employee_number: String,
  pub deactivated:     bool,
  pub ssn:             Option<String>,
  /// `Male` / `Female` as written in the file.
  pub gender:          Option<String>,
  pub birth_date:      Option<NaiveDate>,
  pub first_name:      String,
  pub middle_name:     Option<String>,
  pub last_name:       String,
  pub email:           Option<String>,
  pub phones:          Vec<(ContactType, String)>,
  /// Unit ids of the employments current on the parse date, first one
  /// first, without duplicates.
  pub units:           Vec<String>,
  /// Position name of the first current employment that has one.
  pub title:           Option<String>,
}

fn phone_type(kind: &str) -> Option<ContactType> {
  match kind {
    "CellPhone" => Some(ContactType::Mobile),
    "Home" => Some(ContactType::PrivatePhone),
    "DirectNumber" => Some(ContactType::Phone),
    other => {
      debug!(kind = other, "ignoring SITO phone type");
      None
    }
  }
}

fn required<'a>(e: &'a Element, path: &'static str, record: &str) -> Result<&'a str> {
  e.find_text(path).ok_or_else(|| Error::MissingElement {
    path,
    record: record.to_owned(),
  })
}

fn optional_date(e: &Element, path: &str) -> Option<NaiveDate> {
  e.find_text(path).and_then(|v| parse_date(v).ok())
}

fn parse_person(p: &Element, today: NaiveDate) -> Result<SitoPerson> {
  let employee_number = required(p, "EmploymentInfo/Employee/EmployeeNumber", "?")?.to_owned();
  let record = employee_number.as_str();

  let deactivated = required(p, "EmploymentInfo/Employee/IsDeactivated", record)? != "false";

  let birth_date = match p.find_text("BirthDate") {
    Some(v) => Some(parse_date(v)?),
    None => None,
  };

  let phones = p
    .find_all("Phones/Phone")
    .into_iter()
    .filter_map(|phone| {
      let kind = phone_type(phone.find_text("Type")?)?;
      Some((kind, phone.find_text("Number")?.to_owned()))
    })
    .collect();

  let mut units: Vec<String> = Vec::new();
  let mut title = None;
  for employment in p.find_all("EmploymentInfo/Employee/Employment/Employment") {
    let from = optional_date(employment, "FromDate");
    let to = optional_date(employment, "ToDate");
    if !date_in_range(today, from, to) {
      continue;
    }
    let position = employment.find_text("Position/Name");
    for value in employment.find_all(
      "EmploymentDistributionList/EmploymentDistribution/Unit/Value",
    ) {
      let Some(unit) = value.text.split(',').map(str::trim).find(|s| !s.is_empty()) else {
        continue;
      };
      if units.iter().any(|u| u == unit) {
        continue;
      }
      units.push(unit.to_owned());
      if title.is_none() {
        title = position.map(str::to_owned);
      }
    }
  }

  Ok(SitoPerson {
    deactivated,
    ssn: p.find_text("SocialSecurityNumber").map(str::to_owned),
    gender: p.find_text("Gender").map(str::to_owned),
    birth_date,
    first_name: required(p, "FirstName", record)?.to_owned(),
    middle_name: p.find_text("MiddleName").map(str::to_owned),
    last_name: required(p, "LastName", record)?.to_owned(),
    email: p.find_text("EMailAddresses/EMailAddress/Address").map(str::to_owned),
    phones,
    units,
    title,
    employee_number,
  })
}

/// Parse a SITO person export. Employments are matched against `today`.
pub fn parse_persons(xml: &str, today: NaiveDate) -> Result<Vec<Result<SitoPerson>>> {
  let root = parse_tree(xml)?;
  Ok(
    root
      .descendants("Persons")
      .into_iter()
      .flat_map(|persons| persons.find_all("Person"))
      .map(|p| parse_person(p, today))
      .collect(),
  )
}

// ─── Units ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitoUnit {
  pub guid:        String,
  pub name:        String,
  pub deactivated: bool,
  pub parent:      Option<String>,
}

/// Parse a SITO unit export. Units without a guid or name are an error for
/// the whole document.
pub fn parse_units(xml: &str) -> Result<Vec<SitoUnit>> {
  let root = parse_tree(xml)?;
  root
    .descendants("Units")
    .into_iter()
    .flat_map(|units| units.find_all("Unit"))
    .map(|u| {
      let guid = required(u, "InternalInfo/Guid", "?")?.to_owned();
      Ok(SitoUnit {
        name:        required(u, "Name", &guid)?.to_owned(),
        deactivated: u.find_text("IsDeactivated").is_some_and(|v| v != "false"),
        parent:      u.find_text("ParentUnitIdentifier/Value").map(str::to_owned),
        guid,
      })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn today() -> NaiveDate { NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() }

  const PERSONS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Export>
  <Persons>
    <Person>
      <EmploymentInfo>
        <Employee>
          <EmployeeNumber>5001</EmployeeNumber>
          <IsDeactivated>false</IsDeactivated>
          <Employment>
            <Employment>
              <FromDate>2020-01-01T00:00:00</FromDate>
              <Position><Name>Kokk</Name></Position>
              <EmploymentDistributionList>
                <EmploymentDistribution><Unit><Value>u-kantina, u-other</Value></Unit></EmploymentDistribution>
              </EmploymentDistributionList>
            </Employment>
            <Employment>
              <FromDate>2018-01-01</FromDate>
              <ToDate>2019-01-01</ToDate>
              <Position><Name>Vaskehjelp</Name></Position>
              <EmploymentDistributionList>
                <EmploymentDistribution><Unit><Value>u-old</Value></Unit></EmploymentDistribution>
              </EmploymentDistributionList>
            </Employment>
          </Employment>
        </Employee>
      </EmploymentInfo>
      <SocialSecurityNumber>01018012452</SocialSecurityNumber>
      <Gender>Female</Gender>
      <BirthDate>1980-01-01T00:00:00</BirthDate>
      <FirstName>Kari</FirstName>
      <MiddleName>Anne</MiddleName>
      <LastName>Nordmann</LastName>
      <EMailAddresses><EMailAddress><Address>kari@sito.no</Address></EMailAddress></EMailAddresses>
      <Phones>
        <Phone><Type>CellPhone</Type><Number>90000000</Number></Phone>
        <Phone><Type>Fax</Type><Number>1</Number></Phone>
      </Phones>
    </Person>
    <Person>
      <EmploymentInfo><Employee><EmployeeNumber>5002</EmployeeNumber></Employee></EmploymentInfo>
      <FirstName>Ola</FirstName>
      <LastName>Nordmann</LastName>
    </Person>
  </Persons>
</Export>"#;

  #[test]
  fn parses_current_employments() {
    let persons = parse_persons(PERSONS, today()).unwrap();
    assert_eq!(persons.len(), 2);

    let kari = persons[0].as_ref().unwrap();
    assert_eq!(kari.employee_number, "5001");
    assert!(!kari.deactivated);
    assert_eq!(kari.units, ["u-kantina"]);
    assert_eq!(kari.title.as_deref(), Some("Kokk"));
    assert_eq!(kari.birth_date, NaiveDate::from_ymd_opt(1980, 1, 1));
    assert_eq!(kari.middle_name.as_deref(), Some("Anne"));
    assert_eq!(kari.email.as_deref(), Some("kari@sito.no"));
    assert_eq!(kari.phones, [(ContactType::Mobile, "90000000".to_owned())]);
  }

  #[test]
  fn missing_deactivated_flag_is_an_error() {
    let persons = parse_persons(PERSONS, today()).unwrap();
    assert!(matches!(
      &persons[1],
      Err(Error::MissingElement { path: "EmploymentInfo/Employee/IsDeactivated", record })
        if record == "5002"
    ));
  }

  #[test]
  fn parses_units() {
    let units = parse_units(
      r#"<Export><Units>
        <Unit><InternalInfo><Guid>root</Guid></InternalInfo><Name>SiTO</Name>
          <IsDeactivated>false</IsDeactivated></Unit>
        <Unit><InternalInfo><Guid>u-kantina</Guid></InternalInfo><Name>Kantina</Name>
          <IsDeactivated>true</IsDeactivated>
          <ParentUnitIdentifier><Value>root</Value></ParentUnitIdentifier></Unit>
      </Units></Export>"#,
    )
    .unwrap();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].parent, None);
    assert!(!units[0].deactivated);
    assert!(units[1].deactivated);
    assert_eq!(units[1].parent.as_deref(), Some("root"));
  }
}
