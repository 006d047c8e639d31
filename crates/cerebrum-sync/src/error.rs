//! Error types for `cerebrum-sync`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error(transparent)]
  Source(#[from] cerebrum_source::Error),

  #[error(transparent)]
  Core(#[from] cerebrum_core::Error),

  /// The record cannot be imported. Jobs log it, count it and move on.
  #[error("skipped: {0}")]
  Skip(String),

  #[error("password hashing failed: {0}")]
  Password(String),

  #[error("no free username with prefix {0:?}")]
  NoFreeUsername(String),

  #[error("{0} not found; run `cerebrum init` first")]
  NotInitialised(&'static str),
}

impl Error {
  /// Box a backend error.
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Error::Store(Box::new(e))
  }

  pub fn skip(reason: impl Into<String>) -> Self { Error::Skip(reason.into()) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
