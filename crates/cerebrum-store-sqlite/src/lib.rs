//! SQLite backend for the Cerebrum identity store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime. One [`SqliteStore`] is one
//! connection, so a transaction opened with `begin` covers every call made
//! through it (and its clones) until `commit` or `rollback`.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
