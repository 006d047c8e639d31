//! Calendar helpers shared by the batch jobs.
//!
//! Every function takes `today` explicitly; the binary resolves it once per
//! run from the local clock.

use chrono::{Datelike as _, Duration, NaiveDate, TimeDelta};

use crate::{Error, Result};

/// Parse a `YYYY-MM-DD` date positionally: year from bytes 0..4, month from
/// 5..7 and day from 8..10. The separators are not checked, so `2024/01/31`
/// and `2024.01.31` are accepted too.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
  let s = s.trim();
  let bad = || Error::InvalidDate(s.to_owned());
  let field = |range: std::ops::Range<usize>| -> Result<u32> {
    s.get(range).and_then(|f| f.parse().ok()).ok_or_else(bad)
  };
  let year = field(0..4)?;
  let month = field(5..7)?;
  let day = field(8..10)?;
  NaiveDate::from_ymd_opt(year as i32, month, day).ok_or_else(bad)
}

/// Rewrite a day-first `dd-mm-yyyy` date as `yyyy-mm-dd`. Anything that is
/// not day-first is returned unchanged.
pub fn convert_day_first(s: &str) -> String {
  let s = s.trim();
  let parts: Vec<&str> = s.split(['-', '.', '/']).collect();
  match parts.as_slice() {
    [d, m, y] if d.len() <= 2 && m.len() <= 2 && y.len() == 4 => {
      format!("{y}-{m:0>2}-{d:0>2}")
    }
    _ => s.to_owned(),
  }
}

/// `date` plus `days` days, failing instead of leaving the calendar.
pub fn add_days(date: NaiveDate, days: i64) -> Result<NaiveDate> {
  TimeDelta::try_days(days)
    .and_then(|delta| date.checked_add_signed(delta))
    .ok_or_else(|| Error::DateOutOfRange(format!("{date} plus {days} days")))
}

/// `today` minus `days + months*30 + years*365` days.
///
/// Months count as 30 days and years as 365, so "1 year 2 months" is
/// always exactly 425 days back.
pub fn relative_date(today: NaiveDate, years: i64, months: i64, days: i64) -> Result<NaiveDate> {
  let out_of_range =
    || Error::DateOutOfRange(format!("{years} years {months} months {days} days before {today}"));
  let total = years
    .checked_mul(365)
    .zip(months.checked_mul(30))
    .and_then(|(y, m)| y.checked_add(m))
    .and_then(|t| t.checked_add(days))
    .ok_or_else(out_of_range)?;
  let back = total.checked_neg().ok_or_else(out_of_range)?;
  add_days(today, back).map_err(|_| out_of_range())
}

/// The expire date given to accounts on each sync pass.
///
/// Normally thirty days ahead. When that lands inside the summer holiday
/// (strictly between 15 June and 15 August of the current year) the date is
/// pushed to 1 September instead.
pub fn default_expire_date(today: NaiveDate) -> NaiveDate {
  let next_month = today + Duration::days(30);
  let year = today.year();
  let holiday = |m, d| NaiveDate::from_ymd_opt(year, m, d);
  match (holiday(6, 15), holiday(8, 15), holiday(9, 1)) {
    (Some(start), Some(end), Some(sep)) if start < next_month && next_month < end => sep,
    _ => next_month,
  }
}

/// `from <= date < to`; a missing bound is not checked.
pub fn date_in_range(date: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
  from.is_none_or(|f| f <= date) && to.is_none_or(|t| date < t)
}

/// Whether an employment record running `from ..= to` counts on `today`.
///
/// Records start counting `early_days` before their first day, and stay
/// active through their last day.
pub fn entry_is_active(
  today: NaiveDate,
  from: NaiveDate,
  to: Option<NaiveDate>,
  early_days: i64,
) -> bool {
  today >= from - Duration::days(early_days) && to.is_none_or(|t| today <= t)
}
