//! The entities every batch job relies on: the initial account that owns
//! what the jobs create, the posix default group and the spread codes.

use cerebrum_core::{
  entity::{EntityId, NewAccount, NewGroup},
  store::IdentityStore,
};
use tracing::info;

use crate::{Error, Result, Settings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bootstrap {
  /// Creator of accounts and quarantines.
  pub creator_id:     EntityId,
  pub posix_group_id: EntityId,
}

/// Register every configured spread.
pub async fn register_spreads<S: IdentityStore>(store: &S, settings: &Settings) -> Result<()> {
  for (code, entity_type) in &settings.spreads.0 {
    store.register_spread(code, *entity_type).await.map_err(Error::store)?;
  }
  Ok(())
}

/// Create whatever is missing. Safe to run on an initialised database.
pub async fn init<S: IdentityStore>(store: &S, settings: &Settings) -> Result<Bootstrap> {
  let c = &settings.cerebrum;
  register_spreads(store, settings).await?;

  let owner = match store.find_group_by_name(&c.initial_group_name).await.map_err(Error::store)? {
    Some(g) => g.group_id,
    None => {
      info!(name = %c.initial_group_name, "creating initial group");
      store
        .create_group(NewGroup {
          name:        c.initial_group_name.clone(),
          description: Some("Owner of the initial account".to_owned()),
          creator_id:  None,
        })
        .await
        .map_err(Error::store)?
        .group_id
    }
  };

  let creator_id =
    match store.find_account_by_name(&c.initial_account_name).await.map_err(Error::store)? {
      Some(a) => a.account_id,
      None => {
        info!(name = %c.initial_account_name, "creating initial account");
        store
          .create_account(NewAccount {
            name:        c.initial_account_name.clone(),
            owner_id:    owner,
            creator_id:  None,
            expire_date: None,
            gecos:       None,
          })
          .await
          .map_err(Error::store)?
          .account_id
      }
    };

  let posix_group_id = match store.find_group_by_name(&c.posix_group).await.map_err(Error::store)? {
    Some(g) => g.group_id,
    None => {
      info!(name = %c.posix_group, "creating posix default group");
      store
        .create_group(NewGroup {
          name:        c.posix_group.clone(),
          description: Some("Default group of posix users".to_owned()),
          creator_id:  Some(creator_id),
        })
        .await
        .map_err(Error::store)?
        .group_id
    }
  };

  Ok(Bootstrap { creator_id, posix_group_id })
}

/// Look the entities up without creating anything.
pub async fn load<S: IdentityStore>(store: &S, settings: &Settings) -> Result<Bootstrap> {
  let c = &settings.cerebrum;
  let creator_id = store
    .find_account_by_name(&c.initial_account_name)
    .await
    .map_err(Error::store)?
    .ok_or(Error::NotInitialised("initial account"))?
    .account_id;
  let posix_group_id = store
    .find_group_by_name(&c.posix_group)
    .await
    .map_err(Error::store)?
    .ok_or(Error::NotInitialised("posix group"))?
    .group_id;
  Ok(Bootstrap { creator_id, posix_group_id })
}

#[cfg(test)]
mod tests {
  use cerebrum_core::code::EntityType;
  use cerebrum_store_sqlite::SqliteStore;

  use super::*;

  #[tokio::test]
  async fn init_is_idempotent() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let settings = Settings::default();

    assert!(matches!(load(&store, &settings).await, Err(Error::NotInitialised(_))));

    let first = init(&store, &settings).await.unwrap();
    let second = init(&store, &settings).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(load(&store, &settings).await.unwrap(), first);

    assert_eq!(
      store.spread_entity_type("exchange_mailbox").await.unwrap(),
      Some(EntityType::Account)
    );
    assert_eq!(store.spread_entity_type("ansatt@ldap").await.unwrap(), Some(EntityType::Person));
  }
}
