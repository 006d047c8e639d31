//! Inclusive id ranges as given on the command line: `8` or `3-5`.

use std::{fmt, ops::RangeInclusive, str::FromStr};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
  pub start: i64,
  pub end:   i64,
}

impl IdRange {
  pub fn ids(self) -> RangeInclusive<i64> { self.start..=self.end }

  pub fn contains(self, id: i64) -> bool { self.ids().contains(&id) }
}

impl FromStr for IdRange {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let bad = || Error::InvalidRange(s.to_owned());
    let num = |part: &str| part.trim().parse::<i64>().map_err(|_| bad());
    let (start, end) = match s.split_once('-') {
      Some((start, end)) => (num(start)?, num(end)?),
      None => {
        let id = num(s)?;
        (id, id)
      }
    };
    if end < start {
      return Err(bad());
    }
    Ok(Self { start, end })
  }
}

impl fmt::Display for IdRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.start == self.end {
      write!(f, "{}", self.start)
    } else {
      write!(f, "{}-{}", self.start, self.end)
    }
  }
}

/// Expand `N` or `N-M` into the ids it names.
pub fn change_ids(s: &str) -> Result<Vec<i64>> { Ok(s.parse::<IdRange>()?.ids().collect()) }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn expands_ranges() {
    assert_eq!(change_ids("3-5").unwrap(), vec![3, 4, 5]);
    assert_eq!(change_ids("8").unwrap(), vec![8]);
    assert_eq!(change_ids("7-7").unwrap(), vec![7]);
  }

  #[test]
  fn rejects_bad_ranges() {
    assert!(change_ids("5-3").is_err());
    assert!(change_ids("a-3").is_err());
    assert!(change_ids("").is_err());
    assert!(change_ids("1-2-3").is_err());
  }

  #[test]
  fn display_round_trips_through_parse() {
    let r: IdRange = "10-12".parse().unwrap();
    assert_eq!(r.to_string(), "10-12");
    assert!(r.contains(11));
    assert!(!r.contains(13));
    assert_eq!("4".parse::<IdRange>().unwrap().to_string(), "4");
  }
}
