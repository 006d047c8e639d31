//! Source imports.
//!
//! Each importer walks the records of one source file, creates or updates
//! the persons (or OUs) they describe and refreshes their affiliations.
//! Affiliations the source stopped reporting are found by mark and sweep:
//! every key the source owned before the run is loaded, every key the run
//! produces is marked, and the rest is handed to
//! [`remove_old_affiliations`], which deletes only rows whose grace period
//! has run out.

pub mod ou;
pub mod paga;
pub mod sito;
pub mod sysx;

use std::collections::HashMap;

use cerebrum_core::{
  code::{AddressType, SourceSystem},
  date::add_days,
  entity::{AddressFields, AffiliationKey, EntityId, Stedkode},
  store::{AffiliationFilter, IdentityStore},
};
use chrono::NaiveDate;
use tracing::{error, info, warn};

use crate::{Error, Result, diff::MarkAndSweep};

// ─── Statistics ──────────────────────────────────────────────────────────────

/// What happened to one source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Added,
  Updated,
  Unchanged,
}

impl Outcome {
  pub(crate) fn from_flags(created: bool, changed: bool) -> Self {
    match (created, changed) {
      (true, _) => Outcome::Added,
      (false, true) => Outcome::Updated,
      (false, false) => Outcome::Unchanged,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
  pub added:     usize,
  pub updated:   usize,
  pub unchanged: usize,
  pub skipped:   usize,
  pub sweep:     SweepStats,
}

impl ImportStats {
  pub fn record(&mut self, outcome: Outcome) {
    match outcome {
      Outcome::Added => self.added += 1,
      Outcome::Updated => self.updated += 1,
      Outcome::Unchanged => self.unchanged += 1,
    }
  }

  /// Count a record's result. Skips are logged and swallowed; any other
  /// error is returned.
  pub(crate) fn absorb(&mut self, record: &str, result: Result<Outcome>) -> Result<()> {
    match result {
      Ok(outcome) => {
        self.record(outcome);
        Ok(())
      }
      Err(Error::Skip(reason)) => {
        warn!(record, %reason, "skipping record");
        self.skipped += 1;
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  pub fn log(&self, job: &str) {
    info!(
      job,
      added = self.added,
      updated = self.updated,
      unchanged = self.unchanged,
      skipped = self.skipped,
      affiliations_deleted = self.sweep.deleted,
      affiliations_kept = self.sweep.kept,
      "job finished"
    );
  }
}

// ─── Mark and sweep ──────────────────────────────────────────────────────────

/// Every affiliation key `source` currently owns.
pub async fn load_affiliation_keys<S: IdentityStore>(
  store: &S,
  source: SourceSystem,
) -> Result<MarkAndSweep<AffiliationKey>> {
  let rows = store
    .list_affiliations(AffiliationFilter::source(source))
    .await
    .map_err(Error::store)?;
  let sweep = MarkAndSweep::new(rows.iter().map(|a| a.key()));
  info!(%source, keys = sweep.loaded(), "loaded affiliation keys");
  Ok(sweep)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
  pub deleted:         usize,
  /// Unseen rows still inside their grace period.
  pub kept:            usize,
  pub spreads_removed: usize,
}

/// Delete the affiliations behind `keys` whose grace period is over, that
/// is when `today > last_date + grace_days`.
///
/// A person whose affiliation was not seen today also loses
/// `person_spreads`, grace period or not.
pub async fn remove_old_affiliations<S: IdentityStore>(
  store: &S,
  source: SourceSystem,
  keys: impl IntoIterator<Item = AffiliationKey>,
  grace_days: i64,
  today: NaiveDate,
  person_spreads: &[String],
) -> Result<SweepStats> {
  let mut stats = SweepStats::default();
  for key in keys {
    let rows = store
      .list_affiliations(AffiliationFilter {
        person_id:   Some(key.person_id),
        ou_id:       Some(key.ou_id),
        affiliation: Some(key.affiliation),
        source:      Some(source),
      })
      .await
      .map_err(Error::store)?;

    for row in rows {
      let end_of_grace = add_days(row.last_date, grace_days)?;
      if today > end_of_grace {
        warn!(
          %key,
          %source,
          last_date = %row.last_date,
          grace_days,
          "deleting affiliation"
        );
        store
          .delete_affiliation(key.person_id, key.ou_id, key.affiliation, source)
          .await
          .map_err(Error::store)?;
        stats.deleted += 1;
      } else {
        stats.kept += 1;
      }

      if today > row.last_date {
        for spread in person_spreads {
          if store.delete_spread(key.person_id, spread).await.map_err(Error::store)? {
            info!(person_id = key.person_id, spread, "removed employee spread");
            stats.spreads_removed += 1;
          }
        }
      }
    }
  }
  Ok(stats)
}

// ─── OU lookups ──────────────────────────────────────────────────────────────

/// An OU as the person importers need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedOu {
  pub ou_id:  EntityId,
  pub street: Option<AddressFields>,
  pub post:   Option<AddressFields>,
}

/// Stedkode lookups, remembered for the run. Unknown and expired stedkoder
/// are logged once and remembered as missing.
#[derive(Debug)]
pub struct OuCache {
  today:  NaiveDate,
  by_sko: HashMap<Stedkode, Option<CachedOu>>,
}

impl OuCache {
  pub fn new(today: NaiveDate) -> Self { Self { today, by_sko: HashMap::new() } }

  pub async fn get<S: IdentityStore>(
    &mut self,
    store: &S,
    stedkode: Stedkode,
  ) -> Result<Option<CachedOu>> {
    if let Some(hit) = self.by_sko.get(&stedkode) {
      return Ok(hit.clone());
    }
    let found = self.load(store, stedkode).await?;
    self.by_sko.insert(stedkode, found.clone());
    Ok(found)
  }

  async fn load<S: IdentityStore>(&self, store: &S, stedkode: Stedkode) -> Result<Option<CachedOu>> {
    let Some(ou) = store.find_ou_by_stedkode(stedkode).await.map_err(Error::store)? else {
      error!(%stedkode, "unknown stedkode");
      return Ok(None);
    };
    if ou.expire_date.is_some_and(|d| d <= self.today) {
      error!(%stedkode, ou_id = ou.ou_id, "expired stedkode");
      return Ok(None);
    }

    let addresses = store.list_addresses(ou.ou_id).await.map_err(Error::store)?;
    let of_type = |t: AddressType| {
      addresses
        .iter()
        .find(|a| a.address_type == t)
        .map(|a| a.fields.clone())
    };

    // Domestic street addresses are printed below the OU's short name.
    let street = of_type(AddressType::Street).map(|mut fields| {
      if fields.country.is_none() {
        let lines: Vec<String> =
          [ou.acronym.clone(), fields.address_text.take()].into_iter().flatten().collect();
        fields.address_text = (!lines.is_empty()).then(|| lines.join("\n"));
      }
      fields
    });

    Ok(Some(CachedOu {
      ou_id: ou.ou_id,
      street,
      post: of_type(AddressType::Post),
    }))
  }
}

#[cfg(test)]
mod tests {
  use cerebrum_core::{
    code::{AffiliationStatus, EntityType},
    entity::{NewAffiliation, NewPerson},
  };

  use super::*;
  use crate::fixtures::{self, day};

  #[tokio::test]
  async fn sweep_respects_grace_period() {
    let store = fixtures::store().await;
    let ou = fixtures::ou(&store, "740100", None).await;
    let other = fixtures::ou(&store, "740200", None).await;
    store.register_spread("ansatt@ldap", EntityType::Person).await.unwrap();
    let p = store
      .create_person(NewPerson {
        birth_date: day(1980, 1, 1),
        gender:     cerebrum_core::code::Gender::Male,
      })
      .await
      .unwrap()
      .person_id;
    store.add_spread(p, "ansatt@ldap").await.unwrap();

    // Both rows were last seen on 2024-02-20.
    for ou_id in [ou, other] {
      store
        .upsert_affiliation(
          NewAffiliation {
            person_id: p,
            ou_id,
            status: AffiliationStatus::AnsattTekadm,
            source: SourceSystem::Paga,
          },
          day(2024, 2, 20),
        )
        .await
        .unwrap();
    }

    let sweep = load_affiliation_keys(&store, SourceSystem::Paga).await.unwrap();
    assert_eq!(sweep.loaded(), 2);
    let keys: Vec<AffiliationKey> = sweep.remaining().copied().collect();

    // Ten days later, with a 14 day grace period, nothing is deleted.
    let spreads = vec!["ansatt@ldap".to_owned()];
    let stats =
      remove_old_affiliations(&store, SourceSystem::Paga, keys.clone(), 14, day(2024, 3, 1), &spreads)
        .await
        .unwrap();
    assert_eq!(stats, SweepStats { deleted: 0, kept: 2, spreads_removed: 1 });

    // The grace period ends on 2024-03-05; the day after, both go.
    let stats =
      remove_old_affiliations(&store, SourceSystem::Paga, keys, 14, day(2024, 3, 6), &spreads)
        .await
        .unwrap();
    assert_eq!(stats.deleted, 2);
    assert!(
      store
        .list_affiliations(AffiliationFilter::source(SourceSystem::Paga))
        .await
        .unwrap()
        .is_empty()
    );
  }

  #[tokio::test]
  async fn ou_cache_skips_unknown_and_expired() {
    let store = fixtures::store().await;
    let live = fixtures::ou(&store, "740100", None).await;
    let gone = fixtures::ou(&store, "740200", None).await;
    store.set_ou_expire(gone, Some(day(2024, 1, 1))).await.unwrap();
    store
      .set_addresses(
        live,
        SourceSystem::Paga,
        vec![(AddressType::Street, AddressFields {
          address_text: Some("Hansine Hansens veg 18".into()),
          ..AddressFields::default()
        })],
      )
      .await
      .unwrap();

    let mut cache = OuCache::new(fixtures::today());
    let hit = cache.get(&store, "740100".parse().unwrap()).await.unwrap().unwrap();
    assert_eq!(hit.ou_id, live);
    assert_eq!(
      hit.street.and_then(|s| s.address_text).as_deref(),
      Some("Hansine Hansens veg 18")
    );
    assert!(cache.get(&store, "740200".parse().unwrap()).await.unwrap().is_none());
    assert!(cache.get(&store, "990000".parse().unwrap()).await.unwrap().is_none());
  }
}
