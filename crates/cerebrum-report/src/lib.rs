//! Read-only reports over a Cerebrum database.
//!
//! Each report in [`reports`] queries an
//! [`IdentityStore`](cerebrum_core::store::IdentityStore) and returns a
//! [`Report`]: a title, column names and rows of plain strings. The
//! [`render`] module turns a report into CSV (the Cerebrum dialect), JSON or
//! an HTML table.

pub mod error;
pub mod render;
pub mod reports;

pub use error::{Error, Result};
pub use render::{Format, Report};
