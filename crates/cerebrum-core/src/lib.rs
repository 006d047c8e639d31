//! Core types and trait definitions for Cerebrum.
//!
//! This crate is free of database and file-format dependencies. Every other
//! crate in the workspace depends on it: the code tables, the entity rows,
//! the [`store::IdentityStore`] abstraction and the small helpers shared by
//! all batch jobs (dates, national ids, id ranges).

// Native `async fn` in traits; the returned futures are declared `Send`
// explicitly on the trait.
#![allow(async_fn_in_trait)]

pub mod code;
pub mod date;
pub mod entity;
pub mod error;
pub mod fnr;
pub mod range;
pub mod store;

pub use error::{Error, Result};
