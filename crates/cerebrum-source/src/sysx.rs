//! The SYSTEM-X guest registry dump.
//!
//! One guest per record in the Cerebrum dialect. Records starting with `#`
//! are comments.

use cerebrum_core::date::{convert_day_first, parse_date};
use chrono::NaiveDate;

use crate::{
  Error, Result,
  dialect::{Record, read_records},
};

pub const FIELDS: [&str; 17] = [
  "id",
  "birth_date",
  "personnr",
  "gender",
  "first_name",
  "last_name",
  "ou",
  "affiliation",
  "affiliation_status",
  "expire_date",
  "spreads",
  "hjemmel",
  "kontaktinfo",
  "ansvarlig_epost",
  "bruker_epost",
  "national_identity_number",
  "approved",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysXPerson {
  pub id:                       i64,
  pub birth_date:               Option<NaiveDate>,
  /// Legacy five-digit person number; the full national id is
  /// `national_identity_number`.
  pub personnr:                 Option<String>,
  pub gender:                   Option<String>,
  pub first_name:               String,
  pub last_name:                String,
  /// Six-digit stedkode.
  pub ou:                       String,
  pub affiliation:              String,
  pub affiliation_status:       String,
  pub expire_date:              NaiveDate,
  pub spreads:                  Vec<String>,
  /// Legal basis for the guest account.
  pub legal_basis:              Option<String>,
  pub contact_info:             Option<String>,
  /// Mail address of the person responsible for the guest.
  pub responsible_email:        Option<String>,
  /// Mail address the guest asked for.
  pub user_email:               Option<String>,
  pub national_identity_number: Option<String>,
  pub approved:                 bool,
}

fn non_empty(s: &str) -> Option<String> {
  let s = s.trim();
  (!s.is_empty()).then(|| s.to_owned())
}

fn field<'a>(record: &'a Record, name: &str) -> &'a str {
  FIELDS
    .iter()
    .position(|n| *n == name)
    .and_then(|i| record.fields.get(i))
    .map_or("", |v| v.trim())
}

fn build(record: &Record) -> Result<SysXPerson> {
  if record.fields.len() != FIELDS.len() {
    return Err(Error::FieldCount {
      line:     record.line,
      expected: FIELDS.len(),
      found:    record.fields.len(),
    });
  }
  let f = |name: &'static str| field(record, name);

  let id = f("id").parse::<i64>().map_err(|_| Error::InvalidValue {
    field: "id",
    value: f("id").to_owned(),
  })?;
  let birth_date = match f("birth_date") {
    "" => None,
    s => Some(parse_date(&convert_day_first(s))?),
  };

  Ok(SysXPerson {
    id,
    birth_date,
    personnr: non_empty(f("personnr")),
    gender: non_empty(f("gender")),
    first_name: f("first_name").to_owned(),
    last_name: f("last_name").to_owned(),
    ou: f("ou").to_owned(),
    affiliation: f("affiliation").to_owned(),
    affiliation_status: f("affiliation_status").to_owned(),
    expire_date: parse_date(&convert_day_first(f("expire_date")))?,
    spreads: f("spreads")
      .split(',')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(str::to_owned)
      .collect(),
    legal_basis: non_empty(f("hjemmel")),
    contact_info: non_empty(f("kontaktinfo")),
    responsible_email: non_empty(f("ansvarlig_epost")),
    user_email: non_empty(f("bruker_epost")),
    national_identity_number: non_empty(f("national_identity_number")),
    approved: f("approved") == "Yes",
  })
}

/// Parse a SYSTEM-X dump. A dangling escape fails the whole file; a bad
/// record fails only itself.
pub fn parse(input: &str) -> Result<Vec<Result<SysXPerson>>> {
  Ok(
    read_records(input)?
      .iter()
      .filter(|r| !r.fields[0].trim_start().starts_with('#'))
      .map(build)
      .collect(),
  )
}
