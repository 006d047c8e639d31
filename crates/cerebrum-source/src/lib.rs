//! Readers and writers for the files Cerebrum exchanges with other systems.
//!
//! * [`paga`]: the PAGA HR export (XML, one element per person with
//!   attribute-encoded records).
//! * [`sito`]: the SITO HR export (XML, element-encoded persons and units).
//! * [`sysx`]: the SYSTEM-X guest registry dump.
//! * [`ou`]: the organisational unit list.
//! * [`dialect`]: the semicolon separated, backslash escaped CSV dialect
//!   used both for SYSTEM-X input and for report output.
//!
//! Everything here is synchronous and free of database access. Parsers hand
//! back one `Result` per record so a single malformed person never aborts an
//! import.

pub mod dialect;
pub mod error;
pub mod ou;
pub mod paga;
pub mod sito;
pub mod sysx;
pub mod xml;

pub use error::{Error, Result};
