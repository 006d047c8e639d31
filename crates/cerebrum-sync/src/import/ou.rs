//! OU import from the OU file.
//!
//! OUs are matched on stedkode. Parents are linked in a second pass so the
//! file may list children before their parents.

use std::collections::BTreeMap;

use cerebrum_core::{
  code::{AddressType, SourceSystem},
  entity::{AddressFields, EntityId, NewOu, Stedkode},
  store::IdentityStore,
};
use cerebrum_source::ou::OuRecord;
use tracing::{info, warn};

use super::{ImportStats, Outcome};
use crate::{Error, Result};

pub async fn import_ous<S: IdentityStore>(
  store: &S,
  records: Vec<cerebrum_source::Result<OuRecord>>,
  source: SourceSystem,
) -> Result<ImportStats> {
  let mut stats = ImportStats::default();
  let mut imported: Vec<(EntityId, OuRecord)> = Vec::new();

  for record in records {
    let record = match record {
      Ok(r) => r,
      Err(e) => {
        stats.absorb("ou", Err(Error::skip(e.to_string())))?;
        continue;
      }
    };
    let (ou_id, outcome) = upsert_ou(store, &record, source).await?;
    stats.record(outcome);
    imported.push((ou_id, record));
  }

  let ids: BTreeMap<Stedkode, EntityId> =
    imported.iter().map(|(id, r)| (r.stedkode, *id)).collect();
  for (ou_id, record) in &imported {
    let Some(parent_sko) = record.parent else { continue };
    let parent_id = match ids.get(&parent_sko) {
      Some(id) => Some(*id),
      None => store
        .find_ou_by_stedkode(parent_sko)
        .await
        .map_err(Error::store)?
        .map(|ou| ou.ou_id),
    };
    let Some(parent_id) = parent_id else {
      warn!(stedkode = %record.stedkode, parent = %parent_sko, "unknown parent stedkode");
      continue;
    };
    if parent_id == *ou_id {
      continue;
    }
    link_parent(store, *ou_id, parent_id).await?;
  }

  stats.log("import-ou");
  Ok(stats)
}

async fn upsert_ou<S: IdentityStore>(
  store: &S,
  record: &OuRecord,
  source: SourceSystem,
) -> Result<(EntityId, Outcome)> {
  let existing = store.find_ou_by_stedkode(record.stedkode).await.map_err(Error::store)?;
  let new = NewOu {
    stedkode:  Some(record.stedkode),
    name:      record.name.clone(),
    acronym:   record.acronym.clone(),
    parent_id: existing.as_ref().and_then(|ou| ou.parent_id),
  };

  let (ou_id, created, mut changed) = match existing {
    Some(ou) => {
      let changed = store.update_ou(ou.ou_id, new).await.map_err(Error::store)?;
      (ou.ou_id, false, changed)
    }
    None => {
      let ou = store.add_ou(new).await.map_err(Error::store)?;
      info!(stedkode = %record.stedkode, ou_id = ou.ou_id, "created OU");
      (ou.ou_id, true, false)
    }
  };

  let mut addresses = Vec::new();
  if record.street.is_some() || record.postal_number.is_some() || record.city.is_some() {
    addresses.push((AddressType::Street, AddressFields {
      address_text: record.street.clone(),
      postal_number: record.postal_number.clone(),
      city: record.city.clone(),
      ..AddressFields::default()
    }));
  }
  changed |= store.set_addresses(ou_id, source, addresses).await.map_err(Error::store)?;

  Ok((ou_id, Outcome::from_flags(created, changed)))
}

async fn link_parent<S: IdentityStore>(store: &S, ou_id: EntityId, parent_id: EntityId) -> Result<()> {
  let Some(ou) = store.get_ou(ou_id).await.map_err(Error::store)? else {
    return Ok(());
  };
  if ou.parent_id == Some(parent_id) {
    return Ok(());
  }
  store
    .update_ou(ou_id, NewOu {
      stedkode:  ou.stedkode,
      name:      ou.name,
      acronym:   ou.acronym,
      parent_id: Some(parent_id),
    })
    .await
    .map_err(Error::store)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fixtures;

  const FILE: &str = "\
740100;Institutt for fysikk;IFT;740000;;;
740000;Fakultet for naturvitenskap;NT;;Hansine Hansens veg 18;9019;Tromsø
74;broken
";

  #[tokio::test]
  async fn imports_and_links_parents() {
    let store = fixtures::store().await;
    let records = cerebrum_source::ou::parse(FILE).unwrap();
    let stats = import_ous(&store, records, SourceSystem::Paga).await.unwrap();
    assert_eq!((stats.added, stats.skipped), (2, 1));

    let nt = store.find_ou_by_stedkode("740000".parse().unwrap()).await.unwrap().unwrap();
    let ift = store.find_ou_by_stedkode("740100".parse().unwrap()).await.unwrap().unwrap();
    assert_eq!(ift.parent_id, Some(nt.ou_id));
    assert_eq!(nt.parent_id, None);
    let addresses = store.list_addresses(nt.ou_id).await.unwrap();
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].fields.city.as_deref(), Some("Tromsø"));

    // A second run changes nothing.
    let records = cerebrum_source::ou::parse(FILE).unwrap();
    let stats = import_ous(&store, records, SourceSystem::Paga).await.unwrap();
    assert_eq!((stats.added, stats.updated, stats.unchanged), (0, 0, 2));
  }
}
