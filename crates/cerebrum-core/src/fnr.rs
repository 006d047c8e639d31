//! Norwegian national identity numbers ("fødselsnummer").
//!
//! Eleven digits: `DDMMYY` birth date, a three-digit individual number and
//! two mod-11 control digits. D-numbers add 40 to the day, H-numbers add 40 to
//! the month. The century follows from the individual number, and the ninth
//! digit is odd for men.

use chrono::{Datelike as _, NaiveDate};

use crate::{Error, Result, code::Gender};

const WEIGHTS_1: [u32; 9] = [3, 7, 6, 1, 8, 9, 4, 5, 2];
const WEIGHTS_2: [u32; 10] = [5, 4, 3, 2, 7, 6, 5, 4, 3, 2];

fn invalid(fnr: &str, reason: &'static str) -> Error {
  Error::InvalidFnr { fnr: fnr.to_owned(), reason }
}

fn digits(fnr: &str) -> Result<[u32; 11]> {
  if fnr.len() != 11 {
    return Err(invalid(fnr, "must be eleven digits"));
  }
  let mut out = [0; 11];
  for (slot, c) in out.iter_mut().zip(fnr.chars()) {
    *slot = c.to_digit(10).ok_or_else(|| invalid(fnr, "must be eleven digits"))?;
  }
  Ok(out)
}

fn control_digit(digits: &[u32], weights: &[u32]) -> Option<u32> {
  let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
  match 11 - sum % 11 {
    11 => Some(0),
    10 => None,
    k => Some(k),
  }
}

/// Check length, control digits and the embedded birth date.
pub fn validate(fnr: &str) -> Result<()> {
  let d = digits(fnr)?;
  if control_digit(&d[..9], &WEIGHTS_1) != Some(d[9])
    || control_digit(&d[..10], &WEIGHTS_2) != Some(d[10])
  {
    return Err(invalid(fnr, "control digits do not match"));
  }
  birth_date(fnr).map(|_| ())
}

/// Foreign employees without a national id are registered with their birth
/// date followed by `00000`. Such numbers never pass [`validate`].
pub fn is_placeholder(fnr: &str) -> bool { fnr.len() == 11 && fnr.get(6..) == Some("00000") }

/// The birth date encoded in the number. Does not check the control digits.
pub fn birth_date(fnr: &str) -> Result<NaiveDate> {
  let d = digits(fnr)?;
  let two = |i: usize| d[i] * 10 + d[i + 1];

  let mut day = two(0);
  let mut month = two(2);
  let yy = two(4) as i32;
  let individual = d[6] * 100 + d[7] * 10 + d[8];

  if day > 40 {
    day -= 40;
  }
  if month > 40 {
    month -= 40;
  }

  let year = match individual {
    0..=499 => 1900 + yy,
    500..=749 if yy >= 55 => 1800 + yy,
    500..=999 if yy < 40 => 2000 + yy,
    900..=999 => 1900 + yy,
    _ => return Err(invalid(fnr, "individual number does not match a century")),
  };

  NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| invalid(fnr, "no such date"))
}

pub fn is_female(fnr: &str) -> Result<bool> { Ok(digits(fnr)?[8] % 2 == 0) }

pub fn gender(fnr: &str) -> Result<Gender> {
  Ok(if is_female(fnr)? { Gender::Female } else { Gender::Male })
}

/// Compare a registered birth date with the one derived from the national
/// id.
///
/// Two-digit years are ambiguous for people over a hundred, so a difference
/// of exactly one century is accepted when the national id puts the birth
/// more than a hundred years back.
pub fn birthdates_match(registered: NaiveDate, from_fnr: NaiveDate, today: NaiveDate) -> bool {
  if registered == from_fnr {
    return true;
  }
  registered.month() == from_fnr.month()
    && registered.day() == from_fnr.day()
    && (registered.year() - from_fnr.year()).abs() == 100
    && from_fnr.year() <= today.year() - 100
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, day).unwrap() }

  #[test]
  fn valid_numbers() {
    validate("01018012371").unwrap();
    validate("01018012452").unwrap();
    validate("15050550025").unwrap();
    validate("31129990077").unwrap();
  }

  #[test]
  fn control_digit_errors() {
    assert!(validate("01018012372").is_err());
    assert!(validate("0101801237").is_err());
    assert!(validate("0101801237x").is_err());
  }

  #[test]
  fn centuries() {
    assert_eq!(birth_date("01018012371").unwrap(), d(1980, 1, 1));
    assert_eq!(birth_date("15050550025").unwrap(), d(2005, 5, 15));
    assert_eq!(birth_date("31129990077").unwrap(), d(1999, 12, 31));
  }

  #[test]
  fn d_number_shifts_day() {
    validate("41018012365").unwrap();
    assert_eq!(birth_date("41018012365").unwrap(), d(1980, 1, 1));
  }

  #[test]
  fn gender_from_ninth_digit() {
    assert_eq!(gender("01018012371").unwrap(), Gender::Male);
    assert_eq!(gender("01018012452").unwrap(), Gender::Female);
    assert!(is_female("15050550025").unwrap());
  }

  #[test]
  fn placeholder_numbers() {
    assert!(is_placeholder("01018000000"));
    assert!(!is_placeholder("01018012371"));
    assert!(validate("01018000000").is_err());
  }

  #[test]
  fn century_ambiguity_is_tolerated_only_for_old_people() {
    let today = d(2024, 6, 1);
    assert!(birthdates_match(d(1920, 3, 4), d(1920, 3, 4), today));
    assert!(birthdates_match(d(2020, 3, 4), d(1920, 3, 4), today));
    assert!(!birthdates_match(d(2080, 3, 4), d(1980, 3, 4), today));
    assert!(!birthdates_match(d(1921, 3, 4), d(1920, 3, 4), today));
  }
}
