//! Error type for `cerebrum-store-sqlite`.

use cerebrum_core::{
  code::{Affiliation, EntityType},
  entity::EntityId,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] cerebrum_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("{entity_type} {id} not found")]
  NotFound { entity_type: EntityType, id: EntityId },

  #[error("entity {0} does not exist")]
  UnknownEntity(EntityId),

  #[error("name {0:?} is already taken")]
  NameTaken(String),

  #[error("unknown spread {0:?}")]
  UnknownSpread(String),

  #[error("spread {spread:?} is for {expected} entities, {entity_id} is a {found}")]
  SpreadEntityMismatch {
    spread:    String,
    entity_id: EntityId,
    expected:  EntityType,
    found:     EntityType,
  },

  #[error("owner {person_id} of account {account_id} has no {affiliation} affiliation at OU {ou_id}")]
  MissingAffiliation {
    account_id:  EntityId,
    person_id:   EntityId,
    ou_id:       EntityId,
    affiliation: Affiliation,
  },

  #[error("account {0} is not owned by a person")]
  NotPersonal(EntityId),

  #[error("uid {0} is already in use")]
  UidTaken(u32),

  #[error("no uid left above the highest one in use")]
  UidsExhausted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
