//! Error types for `cerebrum-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid date: {0:?}")]
  InvalidDate(String),

  #[error("date out of range: {0}")]
  DateOutOfRange(String),

  #[error("invalid national id {fnr:?}: {reason}")]
  InvalidFnr { fnr: String, reason: &'static str },

  #[error("invalid stedkode: {0:?}")]
  InvalidStedkode(String),

  #[error("invalid affiliation key: {0:?}")]
  InvalidAffiliationKey(String),

  #[error("invalid id range: {0:?}")]
  InvalidRange(String),

  #[error("unknown code {value:?} in table {table}")]
  UnknownCode { table: &'static str, value: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
