//! Shared setup for the job tests.

use cerebrum_core::entity::{EntityId, NewOu, Stedkode};
use cerebrum_core::store::IdentityStore as _;
use cerebrum_store_sqlite::SqliteStore;
use chrono::NaiveDate;

use crate::{Settings, bootstrap};

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, d).unwrap() }

pub fn today() -> NaiveDate { day(2024, 3, 1) }

/// An initialised in-memory store.
pub async fn store() -> SqliteStore {
  let store = SqliteStore::open_in_memory().await.unwrap();
  bootstrap::init(&store, &Settings::default()).await.unwrap();
  store
}

pub async fn ou(store: &SqliteStore, sko: &str, parent_id: Option<EntityId>) -> EntityId {
  store
    .add_ou(NewOu {
      stedkode: Some(sko.parse::<Stedkode>().unwrap()),
      name: format!("OU {sko}"),
      acronym: None,
      parent_id,
    })
    .await
    .unwrap()
    .ou_id
}
