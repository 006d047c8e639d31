//! The OU file.
//!
//! One organisational unit per record in the Cerebrum dialect:
//!
//! ```text
//! stedkode;name;acronym;parent_stedkode;street;postal_number;city
//! 740000;Fakultet for naturvitenskap;NT;000000;Hansine Hansens veg 18;9019;Tromsø
//! ```
//!
//! Only the first two fields are required; the rest may be empty or left
//! out. Records starting with `#` are comments.

use cerebrum_core::entity::Stedkode;

use crate::{
  Error, Result,
  dialect::{Record, read_records},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuRecord {
  pub stedkode:      Stedkode,
  pub name:          String,
  pub acronym:       Option<String>,
  pub parent:        Option<Stedkode>,
  pub street:        Option<String>,
  pub postal_number: Option<String>,
  pub city:          Option<String>,
}

fn optional(record: &Record, i: usize) -> Option<String> {
  record
    .fields
    .get(i)
    .map(|s| s.trim())
    .filter(|s| !s.is_empty())
    .map(str::to_owned)
}

fn build(record: &Record) -> Result<OuRecord> {
  if !(2..=7).contains(&record.fields.len()) {
    return Err(Error::FieldCount {
      line:     record.line,
      expected: 7,
      found:    record.fields.len(),
    });
  }
  let name = optional(record, 1).ok_or(Error::InvalidValue {
    field: "name",
    value: String::new(),
  })?;
  Ok(OuRecord {
    stedkode: record.fields[0].parse()?,
    name,
    acronym: optional(record, 2),
    parent: optional(record, 3).map(|s| s.parse()).transpose()?,
    street: optional(record, 4),
    postal_number: optional(record, 5),
    city: optional(record, 6),
  })
}

pub fn parse(input: &str) -> Result<Vec<Result<OuRecord>>> {
  Ok(
    read_records(input)?
      .iter()
      .filter(|r| !r.fields[0].trim_start().starts_with('#'))
      .map(build)
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_full_and_short_records() {
    let records = parse(
      "# stedkode;name;acronym;parent\n\
       740000;Fakultet for naturvitenskap;NT;;Hansine Hansens veg 18;9019;Tromsø\n\
       740100;Institutt for fysikk;;740000\n",
    )
    .unwrap();
    assert_eq!(records.len(), 2);

    let nt = records[0].as_ref().unwrap();
    assert_eq!(nt.stedkode.to_string(), "740000");
    assert_eq!(nt.acronym.as_deref(), Some("NT"));
    assert_eq!(nt.parent, None);
    assert_eq!(nt.city.as_deref(), Some("Tromsø"));

    let fys = records[1].as_ref().unwrap();
    assert_eq!(fys.parent.map(|p| p.to_string()).as_deref(), Some("740000"));
    assert_eq!(fys.street, None);
  }

  #[test]
  fn bad_records_fail_alone() {
    let records = parse("74;Bad\n740100;\n740200;Good\n").unwrap();
    assert!(matches!(records[0], Err(Error::Core(_))));
    assert!(matches!(records[1], Err(Error::InvalidValue { field: "name", .. })));
    assert!(records[2].is_ok());
  }
}
