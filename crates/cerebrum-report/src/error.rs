//! Error types for `cerebrum-report`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error(transparent)]
  Date(#[from] cerebrum_core::Error),

  #[error(transparent)]
  Csv(#[from] cerebrum_source::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("HTML error: {0}")]
  Html(String),

  #[error("report output is not UTF-8: {0}")]
  Utf8(#[from] std::string::FromUtf8Error),
}

impl Error {
  /// Box a backend error.
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Error::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
