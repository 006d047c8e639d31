//! One group per OU.
//!
//! Each live OU with a stedkode gets a group named `ou_group:<stedkode>`.
//! Its members are the primary accounts of everyone affiliated with the OU
//! plus the groups of the OU's children, so membership of a faculty group
//! covers its institutes. Groups whose OU is gone are expired, not deleted.

use std::collections::{BTreeMap, BTreeSet};

use cerebrum_core::{
  entity::{EntityId, NewGroup, Ou},
  store::{AffiliationFilter, IdentityStore, primary_accounts},
};
use chrono::NaiveDate;
use tracing::info;

use crate::{Error, Result, bootstrap::Bootstrap, diff::diff_sets};

pub const PREFIX: &str = "ou_group:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OuGroupStats {
  pub created:         usize,
  pub members_added:   usize,
  pub members_removed: usize,
  pub expired:         usize,
}

pub fn group_name(ou: &Ou) -> Option<String> { ou.stedkode.map(|sko| format!("{PREFIX}{sko}")) }

pub async fn sync_ou_groups<S: IdentityStore>(
  store: &S,
  bootstrap: Bootstrap,
  today: NaiveDate,
) -> Result<OuGroupStats> {
  let mut stats = OuGroupStats::default();
  let ous: Vec<Ou> = store
    .list_ous()
    .await
    .map_err(Error::store)?
    .into_iter()
    .filter(|ou| ou.stedkode.is_some() && ou.expire_date.is_none_or(|d| d > today))
    .collect();
  let mut groups: BTreeMap<String, _> = store
    .list_groups()
    .await
    .map_err(Error::store)?
    .into_iter()
    .filter(|g| g.name.starts_with(PREFIX))
    .map(|g| (g.name.clone(), g))
    .collect();

  // Make sure every live OU has a live group.
  let mut group_of: BTreeMap<EntityId, EntityId> = BTreeMap::new();
  for ou in &ous {
    let Some(name) = group_name(ou) else { continue };
    let group_id = match groups.remove(&name) {
      Some(g) => {
        if g.expire_date.is_some() {
          info!(group = %name, "reviving OU group");
          store.set_group_expire(g.group_id, None).await.map_err(Error::store)?;
        }
        g.group_id
      }
      None => {
        info!(group = %name, "creating OU group");
        stats.created += 1;
        store
          .create_group(NewGroup {
            name:        name.clone(),
            description: Some(ou.name.clone()),
            creator_id:  Some(bootstrap.creator_id),
          })
          .await
          .map_err(Error::store)?
          .group_id
      }
    };
    group_of.insert(ou.ou_id, group_id);
  }

  // Whatever is left has lost its OU.
  for (name, group) in groups {
    if group.expire_date.is_none_or(|d| d > today) {
      info!(group = %name, "expiring OU group");
      store.set_group_expire(group.group_id, Some(today)).await.map_err(Error::store)?;
      stats.expired += 1;
    }
  }

  let primary = primary_accounts(store, today).await.map_err(Error::store)?;
  let mut desired: BTreeMap<EntityId, BTreeSet<EntityId>> =
    group_of.values().map(|g| (*g, BTreeSet::new())).collect();
  for aff in store.list_affiliations(AffiliationFilter::default()).await.map_err(Error::store)? {
    if let (Some(group), Some(account)) = (group_of.get(&aff.ou_id), primary.get(&aff.person_id))
      && let Some(members) = desired.get_mut(group)
    {
      members.insert(*account);
    }
  }
  for ou in &ous {
    if let (Some(child), Some(parent)) =
      (group_of.get(&ou.ou_id), ou.parent_id.and_then(|p| group_of.get(&p)))
      && let Some(members) = desired.get_mut(parent)
    {
      members.insert(*child);
    }
  }

  for (group_id, wanted) in desired {
    let current: BTreeSet<EntityId> = store
      .list_members(group_id)
      .await
      .map_err(Error::store)?
      .into_iter()
      .map(|m| m.member_id)
      .collect();
    let diff = diff_sets(&current, &wanted);
    for member in diff.to_add {
      store.add_member(group_id, member).await.map_err(Error::store)?;
      stats.members_added += 1;
    }
    for member in diff.to_remove {
      store.remove_member(group_id, member).await.map_err(Error::store)?;
      stats.members_removed += 1;
    }
  }

  info!(
    created = stats.created,
    members_added = stats.members_added,
    members_removed = stats.members_removed,
    expired = stats.expired,
    "OU groups synced"
  );
  Ok(stats)
}

#[cfg(test)]
mod tests {
  use cerebrum_core::{
    code::{Affiliation, AffiliationStatus, Gender, SourceSystem},
    entity::{NewAccount, NewAffiliation, NewPerson},
  };
  use cerebrum_store_sqlite::SqliteStore;

  use super::*;
  use crate::{
    Settings,
    fixtures::{self, day},
  };

  async fn members(store: &SqliteStore, group_id: EntityId) -> Vec<EntityId> {
    store.list_members(group_id).await.unwrap().into_iter().map(|m| m.member_id).collect()
  }

  #[tokio::test]
  async fn groups_follow_ous_and_primary_accounts() {
    let store = fixtures::store().await;
    let boot = crate::bootstrap::load(&store, &Settings::default()).await.unwrap();
    let faculty = fixtures::ou(&store, "740000", None).await;
    let institute = fixtures::ou(&store, "740100", Some(faculty)).await;

    let person = store
      .create_person(NewPerson { birth_date: day(1980, 1, 1), gender: Gender::Female })
      .await
      .unwrap()
      .person_id;
    store
      .upsert_affiliation(
        NewAffiliation {
          person_id: person,
          ou_id:     institute,
          status:    AffiliationStatus::AnsattTekadm,
          source:    SourceSystem::Paga,
        },
        fixtures::today(),
      )
      .await
      .unwrap();
    let account = store
      .create_account(NewAccount {
        name:        "kar001".into(),
        owner_id:    person,
        creator_id:  None,
        expire_date: None,
        gecos:       None,
      })
      .await
      .unwrap()
      .account_id;
    store.set_account_type(account, institute, Affiliation::Ansatt).await.unwrap();

    let stats = sync_ou_groups(&store, boot, fixtures::today()).await.unwrap();
    assert_eq!(stats, OuGroupStats { created: 2, members_added: 2, ..Default::default() });

    let faculty_group = store.find_group_by_name("ou_group:740000").await.unwrap().unwrap();
    let institute_group = store.find_group_by_name("ou_group:740100").await.unwrap().unwrap();
    assert_eq!(members(&store, institute_group.group_id).await, [account]);
    assert_eq!(members(&store, faculty_group.group_id).await, [institute_group.group_id]);

    let stats = sync_ou_groups(&store, boot, fixtures::today()).await.unwrap();
    assert_eq!(stats, OuGroupStats::default());

    // Closing the institute expires its group and drops it from the faculty.
    store.set_ou_expire(institute, Some(day(2024, 2, 1))).await.unwrap();
    let stats = sync_ou_groups(&store, boot, fixtures::today()).await.unwrap();
    assert_eq!((stats.expired, stats.members_removed), (1, 1));
    assert!(members(&store, faculty_group.group_id).await.is_empty());
    let closed = store.find_group_by_name("ou_group:740100").await.unwrap().unwrap();
    assert_eq!(closed.expire_date, Some(fixtures::today()));
  }
}
