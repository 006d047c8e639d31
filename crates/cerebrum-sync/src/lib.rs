//! The batch jobs that keep a Cerebrum database in step with its source
//! systems.
//!
//! * [`import`]: person and OU imports from PAGA, SITO and SYSTEM-X, with
//!   mark-and-sweep removal of affiliations a source no longer reports.
//! * [`accounts`]: per-person account maintenance driven by the same source
//!   files (creation, expiry, spreads, quarantines, account types).
//! * [`ou_groups`]: one group per OU holding the primary accounts of the
//!   people affiliated there.
//!
//! Every job is generic over [`IdentityStore`](cerebrum_core::store::IdentityStore)
//! and takes `today` as an argument. Transactions are the caller's business.

pub mod accounts;
pub mod bootstrap;
pub mod diff;
pub mod error;
pub mod import;
pub mod ou_groups;
pub mod password;
pub mod settings;
pub mod uname;

pub use error::{Error, Result};
pub use settings::Settings;

#[cfg(test)]
mod fixtures;
