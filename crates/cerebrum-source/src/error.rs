//! Error types for `cerebrum-source`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("XML error: {0}")]
  Xml(String),

  #[error("CSV error: {0}")]
  Csv(#[from] csv::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("empty document")]
  EmptyDocument,

  #[error("line {line}: escape character at end of input")]
  DanglingEscape { line: usize },

  #[error("line {line}: expected {expected} fields, found {found}")]
  FieldCount {
    line:     usize,
    expected: usize,
    found:    usize,
  },

  #[error("missing attribute {attribute:?} on <{element}>")]
  MissingAttribute {
    element:   &'static str,
    attribute: &'static str,
  },

  #[error("missing element {path:?} (record {record:?})")]
  MissingElement { path: &'static str, record: String },

  #[error("invalid {field}: {value:?}")]
  InvalidValue { field: &'static str, value: String },

  #[error(transparent)]
  Core(#[from] cerebrum_core::Error),
}

impl From<quick_xml::Error> for Error {
  fn from(e: quick_xml::Error) -> Self { Error::Xml(e.to_string()) }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
  fn from(e: quick_xml::events::attributes::AttrError) -> Self { Error::Xml(e.to_string()) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
