//! Code tables.
//!
//! Each table is a closed enum with a stable string form. The string form is
//! what gets stored in the database, read from source files and printed in
//! reports, so it must never change for an existing variant.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator as _, IntoStaticStr};

use crate::{Error, Result};

/// Serialise a code table through its string form.
macro_rules! string_serde {
  ($($ty:ty),* $(,)?) => {$(
    impl Serialize for $ty {
      fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
      ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
      }
    }

    impl<'de> Deserialize<'de> for $ty {
      fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
      ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
      }
    }
  )*};
}

string_serde!(
  SourceSystem,
  EntityType,
  ExternalIdType,
  Gender,
  NameVariant,
  Affiliation,
  AffiliationStatus,
  QuarantineType,
  ContactType,
  AddressType,
  ChangeType,
);

// ─── Source systems ──────────────────────────────────────────────────────────

/// An external system of record.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
pub enum SourceSystem {
  #[strum(serialize = "PAGA")]
  Paga,
  #[strum(serialize = "FS")]
  Fs,
  #[strum(serialize = "SAP")]
  Sap,
  #[strum(serialize = "SYSTEM-X")]
  SystemX,
  #[strum(serialize = "SITO")]
  Sito,
  #[strum(serialize = "Manual")]
  Manual,
  #[strum(serialize = "Cached")]
  Cached,
}

// ─── Entities ────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum EntityType {
  Person,
  Account,
  Group,
  Ou,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
pub enum ExternalIdType {
  /// Norwegian national id.
  #[strum(serialize = "NO_BIRTHNO")]
  Fodselsnr,
  #[strum(serialize = "PAGA_ANSATTNR")]
  PagaAnsattnr,
  /// Passport number, stored as `CC-number`.
  #[strum(serialize = "PASSNR")]
  PassNumber,
  #[strum(serialize = "SITO_ANSATTNR")]
  SitoAnsattnr,
  #[strum(serialize = "SYS_X_ID")]
  SysXId,
  /// Unit guid in the SITO HR system.
  #[strum(serialize = "SITO_OU")]
  SitoOu,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString, AsRefStr, EnumIter,
)]
pub enum Gender {
  #[strum(serialize = "M")]
  Male,
  #[strum(serialize = "F")]
  Female,
  #[default]
  #[strum(serialize = "X")]
  Unknown,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NameVariant {
  First,
  Last,
  Full,
  #[strum(serialize = "WORKTITLE")]
  WorkTitle,
  #[strum(serialize = "PERSONALTITLE")]
  PersonalTitle,
}

// ─── Affiliations ────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Affiliation {
  Ansatt,
  Student,
  Tilknyttet,
  Manuell,
  Sito,
}

/// An affiliation status. Every status belongs to exactly one
/// [`Affiliation`]; the string form is `AFFILIATION/status`.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Display,
  EnumString,
  AsRefStr,
  IntoStaticStr,
  EnumIter,
)]
pub enum AffiliationStatus {
  #[strum(serialize = "ANSATT/tekadm")]
  AnsattTekadm,
  #[strum(serialize = "ANSATT/vitenskapelig")]
  AnsattVitenskapelig,
  #[strum(serialize = "ANSATT/timelonnet_midlertidig")]
  AnsattTimelonnet,
  #[strum(serialize = "STUDENT/aktiv")]
  StudentAktiv,
  #[strum(serialize = "STUDENT/evu")]
  StudentEvu,
  #[strum(serialize = "TILKNYTTET/gjesteforsker")]
  TilknyttetGjesteforsker,
  #[strum(serialize = "TILKNYTTET/emeritus")]
  TilknyttetEmeritus,
  #[strum(serialize = "TILKNYTTET/ekst_partner")]
  TilknyttetEkstPartner,
  #[strum(serialize = "MANUELL/gjest")]
  ManuellGjest,
  #[strum(serialize = "MANUELL/gjest_u_konto")]
  ManuellGjestUKonto,
  #[strum(serialize = "MANUELL/ekst_person")]
  ManuellEkstPerson,
  #[strum(serialize = "SITO/sito")]
  SitoAnsatt,
}

impl AffiliationStatus {
  pub fn affiliation(self) -> Affiliation {
    use AffiliationStatus::*;
    match self {
      AnsattTekadm | AnsattVitenskapelig | AnsattTimelonnet => Affiliation::Ansatt,
      StudentAktiv | StudentEvu => Affiliation::Student,
      TilknyttetGjesteforsker | TilknyttetEmeritus | TilknyttetEkstPartner => {
        Affiliation::Tilknyttet
      }
      ManuellGjest | ManuellGjestUKonto | ManuellEkstPerson => Affiliation::Manuell,
      SitoAnsatt => Affiliation::Sito,
    }
  }

  /// The status part of the code, without the affiliation prefix.
  pub fn status_str(self) -> &'static str {
    let full: &'static str = self.into();
    full.split_once('/').map_or(full, |(_, status)| status)
  }

  /// Look a status up by its two halves, as source files spell them.
  pub fn from_parts(affiliation: Affiliation, status: &str) -> Result<Self> {
    Self::iter()
      .find(|s| s.affiliation() == affiliation && s.status_str().eq_ignore_ascii_case(status))
      .ok_or_else(|| Error::UnknownCode {
        table: "affiliation status",
        value: format!("{affiliation}/{status}"),
      })
  }
}

// ─── Quarantines ─────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
pub enum QuarantineType {
  #[strum(serialize = "generell")]
  Generell,
  #[strum(serialize = "autopassord")]
  Autopassord,
  /// Offered a study place but not yet accepted.
  #[strum(serialize = "tilbud")]
  Tilbud,
  /// Guest account awaiting approval in SYSTEM-X.
  #[strum(serialize = "sys_x-approved")]
  SysXApproved,
  #[strum(serialize = "slutta")]
  Slutta,
}

impl QuarantineType {
  /// Automatic quarantines are set and cleared by the sync jobs; the others
  /// are only ever touched by a human.
  pub fn is_auto(self) -> bool {
    matches!(
      self,
      QuarantineType::Autopassord | QuarantineType::Tilbud | QuarantineType::SysXApproved
    )
  }
}

// ─── Contact info ────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactType {
  Phone,
  Mobile,
  Fax,
  #[strum(serialize = "PRIVPHONE")]
  PrivatePhone,
  Email,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressType {
  Street,
  Post,
  #[strum(serialize = "PRIVPOST")]
  PrivatePost,
  Location,
}

// ─── Change log ──────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
pub enum ChangeType {
  #[strum(serialize = "entity:ext_id_mod")]
  ExternalIdMod,
  #[strum(serialize = "entity:cinfo_mod")]
  ContactMod,
  #[strum(serialize = "entity:address_mod")]
  AddressMod,
  #[strum(serialize = "ou:create")]
  OuCreate,
  #[strum(serialize = "ou:mod")]
  OuMod,
  #[strum(serialize = "person:create")]
  PersonCreate,
  #[strum(serialize = "person:mod")]
  PersonMod,
  #[strum(serialize = "person:name_mod")]
  PersonNameMod,
  #[strum(serialize = "person:aff_add")]
  PersonAffAdd,
  #[strum(serialize = "person:aff_mod")]
  PersonAffMod,
  #[strum(serialize = "person:aff_del")]
  PersonAffDel,
  #[strum(serialize = "e_account:create")]
  AccountCreate,
  #[strum(serialize = "e_account:mod")]
  AccountMod,
  #[strum(serialize = "e_account:password")]
  AccountPassword,
  #[strum(serialize = "ac_type:add")]
  AccountTypeAdd,
  #[strum(serialize = "ac_type:del")]
  AccountTypeDel,
  #[strum(serialize = "posix:promote")]
  PosixPromote,
  #[strum(serialize = "spread:add")]
  SpreadAdd,
  #[strum(serialize = "spread:del")]
  SpreadDel,
  #[strum(serialize = "spread:expire")]
  SpreadExpire,
  #[strum(serialize = "quarantine:add")]
  QuarantineAdd,
  #[strum(serialize = "quarantine:del")]
  QuarantineDel,
  #[strum(serialize = "e_group:create")]
  GroupCreate,
  #[strum(serialize = "e_group:mod")]
  GroupMod,
  #[strum(serialize = "e_group:add")]
  GroupAdd,
  #[strum(serialize = "e_group:rem")]
  GroupRem,
  #[strum(serialize = "email:primary")]
  EmailPrimary,
}

/// Parse a code from its string form, naming the table in the error.
pub fn parse_code<T>(table: &'static str, value: &str) -> Result<T>
where
  T: std::str::FromStr,
{
  value.parse().map_err(|_| Error::UnknownCode {
    table,
    value: value.to_owned(),
  })
}

#[cfg(test)]
mod tests {
  use strum::IntoEnumIterator;

  use super::*;

  #[test]
  fn status_parts() {
    let s = AffiliationStatus::AnsattVitenskapelig;
    assert_eq!(s.affiliation(), Affiliation::Ansatt);
    assert_eq!(s.status_str(), "vitenskapelig");
    assert_eq!(s.to_string(), "ANSATT/vitenskapelig");
  }

  #[test]
  fn status_from_parts() {
    assert_eq!(
      AffiliationStatus::from_parts(Affiliation::Manuell, "gjest_u_konto").unwrap(),
      AffiliationStatus::ManuellGjestUKonto
    );
    assert!(AffiliationStatus::from_parts(Affiliation::Ansatt, "gjest").is_err());
  }

  #[test]
  fn every_status_string_matches_its_affiliation() {
    for status in AffiliationStatus::iter() {
      let (aff, _) = status.as_ref().split_once('/').unwrap();
      assert_eq!(aff, status.affiliation().as_ref());
    }
  }

  #[test]
  fn codes_parse_from_string_form() {
    assert_eq!("SYSTEM-X".parse::<SourceSystem>().unwrap(), SourceSystem::SystemX);
    assert_eq!("NO_BIRTHNO".parse::<ExternalIdType>().unwrap(), ExternalIdType::Fodselsnr);
    assert_eq!("WORKTITLE".parse::<NameVariant>().unwrap(), NameVariant::WorkTitle);
    assert_eq!("sys_x-approved".parse::<QuarantineType>().unwrap(), QuarantineType::SysXApproved);
    assert_eq!("ou".parse::<EntityType>().unwrap(), EntityType::Ou);
    assert!(parse_code::<Gender>("gender", "Q").is_err());
  }

  #[test]
  fn serde_uses_string_form() {
    let json = serde_json::to_string(&AffiliationStatus::SitoAnsatt).unwrap();
    assert_eq!(json, "\"SITO/sito\"");
    let back: QuarantineType = serde_json::from_str("\"tilbud\"").unwrap();
    assert_eq!(back, QuarantineType::Tilbud);
  }
}
