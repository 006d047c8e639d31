//! Entity rows as the store hands them out.
//!
//! Every person, account, group and OU shares one id space ([`EntityId`]),
//! so spreads, quarantines, external ids and contact info can be attached to
//! any of them.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  code::{
    AddressType, Affiliation, AffiliationStatus, ChangeType, ContactType, EntityType,
    ExternalIdType, Gender, NameVariant, QuarantineType, SourceSystem,
  },
};

pub type EntityId = i64;

// ─── Organisational units ────────────────────────────────────────────────────

/// Faculty / institute / group triplet addressing an OU, shown as six digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stedkode {
  pub fakultet:  u8,
  pub institutt: u8,
  pub gruppe:    u8,
}

impl Stedkode {
  pub fn new(fakultet: u8, institutt: u8, gruppe: u8) -> Self {
    Self { fakultet, institutt, gruppe }
  }

  /// Build a stedkode from the three separate numeric fields some source
  /// files carry (`fakultetnr_utgift`, ...).
  pub fn from_parts(fakultet: &str, institutt: &str, gruppe: &str) -> Result<Self> {
    let part = |s: &str| {
      s.trim()
        .parse::<u8>()
        .map_err(|_| Error::InvalidStedkode(format!("{fakultet}/{institutt}/{gruppe}")))
    };
    Ok(Self::new(part(fakultet)?, part(institutt)?, part(gruppe)?))
  }
}

impl fmt::Display for Stedkode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:02}{:02}{:02}", self.fakultet, self.institutt, self.gruppe)
  }
}

impl FromStr for Stedkode {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let s = s.trim();
    if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
      return Err(Error::InvalidStedkode(s.to_owned()));
    }
    // Six ASCII digits; every two-digit slice fits in a u8.
    let two = |i: usize| s[i..i + 2].parse::<u8>().unwrap_or_default();
    Ok(Self::new(two(0), two(2), two(4)))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ou {
  pub ou_id:       EntityId,
  pub stedkode:    Option<Stedkode>,
  pub name:        String,
  pub acronym:     Option<String>,
  pub parent_id:   Option<EntityId>,
  pub expire_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewOu {
  pub stedkode:  Option<Stedkode>,
  pub name:      String,
  pub acronym:   Option<String>,
  pub parent_id: Option<EntityId>,
}

// ─── Persons ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
  pub person_id:     EntityId,
  pub birth_date:    NaiveDate,
  pub gender:        Gender,
  pub deceased_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewPerson {
  pub birth_date: NaiveDate,
  pub gender:     Gender,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonName {
  pub person_id: EntityId,
  pub source:    SourceSystem,
  pub variant:   NameVariant,
  pub name:      String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalId {
  pub entity_id: EntityId,
  pub source:    SourceSystem,
  pub id_type:   ExternalIdType,
  pub value:     String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
  pub entity_id:    EntityId,
  pub source:       SourceSystem,
  pub contact_type: ContactType,
  pub preference:   u32,
  pub value:        String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
  pub contact_type: ContactType,
  pub preference:   u32,
  pub value:        String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressFields {
  pub address_text:  Option<String>,
  pub p_o_box:       Option<String>,
  pub postal_number: Option<String>,
  pub city:          Option<String>,
  pub country:       Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
  pub entity_id:    EntityId,
  pub source:       SourceSystem,
  pub address_type: AddressType,
  pub fields:       AddressFields,
}

// ─── Affiliations ────────────────────────────────────────────────────────────

/// The identity of an affiliation row, independent of its status and source.
///
/// Shown and parsed as `person_id:ou_id:AFFILIATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AffiliationKey {
  pub person_id:   EntityId,
  pub ou_id:       EntityId,
  pub affiliation: Affiliation,
}

impl fmt::Display for AffiliationKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.person_id, self.ou_id, self.affiliation)
  }
}

impl FromStr for AffiliationKey {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let bad = || Error::InvalidAffiliationKey(s.to_owned());
    let mut parts = s.splitn(3, ':');
    let (Some(person), Some(ou), Some(aff)) = (parts.next(), parts.next(), parts.next()) else {
      return Err(bad());
    };
    Ok(Self {
      person_id:   person.parse().map_err(|_| bad())?,
      ou_id:       ou.parse().map_err(|_| bad())?,
      affiliation: aff.parse().map_err(|_| bad())?,
    })
  }
}

/// A person's affiliation to an OU as owned by one source system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonAffiliation {
  pub person_id:   EntityId,
  pub ou_id:       EntityId,
  pub affiliation: Affiliation,
  pub status:      AffiliationStatus,
  pub source:      SourceSystem,
  pub create_date: NaiveDate,
  /// The last day a source run saw this affiliation.
  pub last_date:   NaiveDate,
}

impl PersonAffiliation {
  pub fn key(&self) -> AffiliationKey {
    AffiliationKey {
      person_id:   self.person_id,
      ou_id:       self.ou_id,
      affiliation: self.affiliation,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NewAffiliation {
  pub person_id: EntityId,
  pub ou_id:     EntityId,
  pub status:    AffiliationStatus,
  pub source:    SourceSystem,
}

impl NewAffiliation {
  pub fn key(&self) -> AffiliationKey {
    AffiliationKey {
      person_id:   self.person_id,
      ou_id:       self.ou_id,
      affiliation: self.status.affiliation(),
    }
  }
}

// ─── Accounts ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
  pub account_id:  EntityId,
  pub name:        String,
  pub owner_id:    EntityId,
  pub owner_type:  EntityType,
  pub creator_id:  Option<EntityId>,
  pub create_date: NaiveDate,
  pub expire_date: Option<NaiveDate>,
  pub gecos:       Option<String>,
}

impl Account {
  pub fn is_expired(&self, today: NaiveDate) -> bool {
    self.expire_date.is_some_and(|d| d <= today)
  }
}

/// Pick a person's primary account from `(account_id, lowest account type
/// priority)` candidates. The lowest priority wins, accounts without types
/// only win when no candidate has one, and ties go to the lowest id.
pub fn pick_primary(
  candidates: impl IntoIterator<Item = (EntityId, Option<i32>)>,
) -> Option<EntityId> {
  candidates
    .into_iter()
    .min_by_key(|&(account_id, best)| (best.is_none(), best, account_id))
    .map(|(account_id, _)| account_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
  pub name:        String,
  pub owner_id:    EntityId,
  pub creator_id:  Option<EntityId>,
  pub expire_date: Option<NaiveDate>,
  pub gecos:       Option<String>,
}

/// An account's claim on one of its owner's affiliations. The account type
/// with the lowest priority across a person's accounts marks the primary
/// account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountType {
  pub account_id:  EntityId,
  pub person_id:   EntityId,
  pub ou_id:       EntityId,
  pub affiliation: Affiliation,
  pub priority:    i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixUser {
  pub account_id: EntityId,
  pub uid:        u32,
  pub gid_group:  EntityId,
  pub shell:      String,
}

// ─── Spreads and quarantines ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpread {
  pub entity_id:   EntityId,
  pub spread:      String,
  pub expire_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quarantine {
  pub entity_id:       EntityId,
  pub quarantine_type: QuarantineType,
  pub creator_id:      Option<EntityId>,
  pub description:     Option<String>,
  pub start_date:      NaiveDate,
  pub end_date:        Option<NaiveDate>,
}

impl Quarantine {
  /// In force on `today`: started, and not yet ended.
  pub fn is_active(&self, today: NaiveDate) -> bool {
    self.start_date <= today && self.end_date.is_none_or(|end| today < end)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQuarantine {
  pub entity_id:       EntityId,
  pub quarantine_type: QuarantineType,
  pub creator_id:      Option<EntityId>,
  pub description:     Option<String>,
  pub start_date:      NaiveDate,
  pub end_date:        Option<NaiveDate>,
}

// ─── Groups ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
  pub group_id:    EntityId,
  pub name:        String,
  pub description: Option<String>,
  pub creator_id:  Option<EntityId>,
  pub create_date: NaiveDate,
  pub expire_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroup {
  pub name:        String,
  pub description: Option<String>,
  pub creator_id:  Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
  pub group_id:    EntityId,
  pub member_id:   EntityId,
  pub member_type: EntityType,
}

// ─── Change log ──────────────────────────────────────────────────────────────

/// One row of the change log. Every mutating store call appends one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
  pub change_id:      i64,
  /// Identifies the batch run that made the change.
  pub run_id:         uuid::Uuid,
  pub change_program: String,
  pub change_type:    ChangeType,
  pub subject_id:     EntityId,
  pub params:         Option<serde_json::Value>,
  pub recorded_at:    DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;

  #[test]
  fn primary_prefers_typed_then_low_priority() {
    assert_eq!(pick_primary([(5, None), (9, Some(2)), (7, Some(1))]), Some(7));
    assert_eq!(pick_primary([(9, Some(1)), (7, Some(1))]), Some(7));
    assert_eq!(pick_primary([(9, None), (7, None)]), Some(7));
    assert_eq!(pick_primary([(3, None), (4, Some(9))]), Some(4));
    assert_eq!(pick_primary(Vec::new()), None);
  }

  #[test]
  fn stedkode_display_pads() {
    let sko = Stedkode::new(1, 2, 30);
    assert_eq!(sko.to_string(), "010230");
    assert_eq!("010230".parse::<Stedkode>().unwrap(), sko);
  }

  #[test]
  fn stedkode_rejects_garbage() {
    assert!("01023".parse::<Stedkode>().is_err());
    assert!("01a230".parse::<Stedkode>().is_err());
    assert!(Stedkode::from_parts("1", "x", "0").is_err());
    assert_eq!(Stedkode::from_parts("74", "1", " 0").unwrap().to_string(), "740100");
  }

  #[test]
  fn affiliation_key_string_form() {
    let key = AffiliationKey {
      person_id:   12,
      ou_id:       7,
      affiliation: Affiliation::Ansatt,
    };
    assert_eq!(key.to_string(), "12:7:ANSATT");
    assert_eq!("12:7:ANSATT".parse::<AffiliationKey>().unwrap(), key);
    assert!("12:7".parse::<AffiliationKey>().is_err());
    assert!("12:x:ANSATT".parse::<AffiliationKey>().is_err());
  }

  #[test]
  fn quarantine_activity_window() {
    let day = |d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap();
    let q = Quarantine {
      entity_id:       1,
      quarantine_type: QuarantineType::Generell,
      creator_id:      None,
      description:     None,
      start_date:      day(10),
      end_date:        Some(day(20)),
    };
    assert!(!q.is_active(day(9)));
    assert!(q.is_active(day(10)));
    assert!(q.is_active(day(19)));
    assert!(!q.is_active(day(20)));
  }
}
