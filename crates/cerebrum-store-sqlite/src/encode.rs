//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Rows are first read into `Raw*` structs holding the column values as
//! SQLite hands them out, then decoded outside the connection closure.

use std::str::FromStr;

use cerebrum_core::{
  code::parse_code,
  entity::{
    Account, AccountType, Address, AddressFields, ChangeLogEntry, ContactInfo, EntityId,
    EntitySpread, ExternalId, Group, GroupMember, Ou, Person, PersonAffiliation, PersonName,
    PosixUser, Quarantine, Stedkode,
  },
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Row;
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

pub fn encode_opt_date(d: Option<NaiveDate>) -> Option<String> { d.map(encode_date) }

pub fn decode_opt_date(s: Option<String>) -> Result<Option<NaiveDate>> {
  s.as_deref().map(decode_date).transpose()
}

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

/// Decode a code column through its `FromStr` impl.
pub fn decode_code<T: FromStr>(table: &'static str, s: &str) -> Result<T> {
  Ok(parse_code(table, s)?)
}

// ─── Rows ────────────────────────────────────────────────────────────────────

pub const OU_COLUMNS: &str = "ou_id, stedkode, name, acronym, parent_id, expire_date";

pub struct RawOu {
  pub ou_id:       EntityId,
  pub stedkode:    Option<String>,
  pub name:        String,
  pub acronym:     Option<String>,
  pub parent_id:   Option<EntityId>,
  pub expire_date: Option<String>,
}

impl RawOu {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      ou_id:       row.get(0)?,
      stedkode:    row.get(1)?,
      name:        row.get(2)?,
      acronym:     row.get(3)?,
      parent_id:   row.get(4)?,
      expire_date: row.get(5)?,
    })
  }

  pub fn into_ou(self) -> Result<Ou> {
    Ok(Ou {
      ou_id:       self.ou_id,
      stedkode:    self.stedkode.as_deref().map(str::parse::<Stedkode>).transpose()?,
      name:        self.name,
      acronym:     self.acronym,
      parent_id:   self.parent_id,
      expire_date: decode_opt_date(self.expire_date)?,
    })
  }
}

pub const PERSON_COLUMNS: &str = "person_id, birth_date, gender, deceased_date";

pub struct RawPerson {
  pub person_id:     EntityId,
  pub birth_date:    String,
  pub gender:        String,
  pub deceased_date: Option<String>,
}

impl RawPerson {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      person_id:     row.get(0)?,
      birth_date:    row.get(1)?,
      gender:        row.get(2)?,
      deceased_date: row.get(3)?,
    })
  }

  pub fn into_person(self) -> Result<Person> {
    Ok(Person {
      person_id:     self.person_id,
      birth_date:    decode_date(&self.birth_date)?,
      gender:        decode_code("gender", &self.gender)?,
      deceased_date: decode_opt_date(self.deceased_date)?,
    })
  }
}

pub struct RawName {
  pub person_id: EntityId,
  pub source:    String,
  pub variant:   String,
  pub name:      String,
}

impl RawName {
  pub fn into_name(self) -> Result<PersonName> {
    Ok(PersonName {
      person_id: self.person_id,
      source:    decode_code("source_system", &self.source)?,
      variant:   decode_code("name_variant", &self.variant)?,
      name:      self.name,
    })
  }
}

pub struct RawExternalId {
  pub entity_id: EntityId,
  pub source:    String,
  pub id_type:   String,
  pub value:     String,
}

impl RawExternalId {
  pub fn into_external_id(self) -> Result<ExternalId> {
    Ok(ExternalId {
      entity_id: self.entity_id,
      source:    decode_code("source_system", &self.source)?,
      id_type:   decode_code("external_id_type", &self.id_type)?,
      value:     self.value,
    })
  }
}

pub struct RawContact {
  pub entity_id:    EntityId,
  pub source:       String,
  pub contact_type: String,
  pub preference:   u32,
  pub value:        String,
}

impl RawContact {
  pub fn into_contact(self) -> Result<ContactInfo> {
    Ok(ContactInfo {
      entity_id:    self.entity_id,
      source:       decode_code("source_system", &self.source)?,
      contact_type: decode_code("contact_type", &self.contact_type)?,
      preference:   self.preference,
      value:        self.value,
    })
  }
}

pub struct RawAddress {
  pub entity_id:    EntityId,
  pub source:       String,
  pub address_type: String,
  pub fields:       AddressFields,
}

impl RawAddress {
  pub fn into_address(self) -> Result<Address> {
    Ok(Address {
      entity_id:    self.entity_id,
      source:       decode_code("source_system", &self.source)?,
      address_type: decode_code("address_type", &self.address_type)?,
      fields:       self.fields,
    })
  }
}

pub const AFFILIATION_COLUMNS: &str =
  "person_id, ou_id, affiliation, status, source, create_date, last_date";

pub struct RawAffiliation {
  pub person_id:   EntityId,
  pub ou_id:       EntityId,
  pub affiliation: String,
  pub status:      String,
  pub source:      String,
  pub create_date: String,
  pub last_date:   String,
}

impl RawAffiliation {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      person_id:   row.get(0)?,
      ou_id:       row.get(1)?,
      affiliation: row.get(2)?,
      status:      row.get(3)?,
      source:      row.get(4)?,
      create_date: row.get(5)?,
      last_date:   row.get(6)?,
    })
  }

  pub fn into_affiliation(self) -> Result<PersonAffiliation> {
    Ok(PersonAffiliation {
      person_id:   self.person_id,
      ou_id:       self.ou_id,
      affiliation: decode_code("affiliation", &self.affiliation)?,
      status:      decode_code("affiliation_status", &self.status)?,
      source:      decode_code("source_system", &self.source)?,
      create_date: decode_date(&self.create_date)?,
      last_date:   decode_date(&self.last_date)?,
    })
  }
}

pub struct RawSpread {
  pub entity_id:   EntityId,
  pub spread:      String,
  pub expire_date: Option<String>,
}

impl RawSpread {
  pub fn into_spread(self) -> Result<EntitySpread> {
    Ok(EntitySpread {
      entity_id:   self.entity_id,
      spread:      self.spread,
      expire_date: decode_opt_date(self.expire_date)?,
    })
  }
}

pub const ACCOUNT_COLUMNS: &str =
  "account_id, name, owner_id, owner_type, creator_id, create_date, expire_date, gecos";

pub struct RawAccount {
  pub account_id:  EntityId,
  pub name:        String,
  pub owner_id:    EntityId,
  pub owner_type:  String,
  pub creator_id:  Option<EntityId>,
  pub create_date: String,
  pub expire_date: Option<String>,
  pub gecos:       Option<String>,
}

impl RawAccount {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      account_id:  row.get(0)?,
      name:        row.get(1)?,
      owner_id:    row.get(2)?,
      owner_type:  row.get(3)?,
      creator_id:  row.get(4)?,
      create_date: row.get(5)?,
      expire_date: row.get(6)?,
      gecos:       row.get(7)?,
    })
  }

  pub fn into_account(self) -> Result<Account> {
    Ok(Account {
      account_id:  self.account_id,
      name:        self.name,
      owner_id:    self.owner_id,
      owner_type:  decode_code("entity_type", &self.owner_type)?,
      creator_id:  self.creator_id,
      create_date: decode_date(&self.create_date)?,
      expire_date: decode_opt_date(self.expire_date)?,
      gecos:       self.gecos,
    })
  }
}

pub struct RawAccountType {
  pub account_id:  EntityId,
  pub person_id:   EntityId,
  pub ou_id:       EntityId,
  pub affiliation: String,
  pub priority:    i32,
}

impl RawAccountType {
  pub fn into_account_type(self) -> Result<AccountType> {
    Ok(AccountType {
      account_id:  self.account_id,
      person_id:   self.person_id,
      ou_id:       self.ou_id,
      affiliation: decode_code("affiliation", &self.affiliation)?,
      priority:    self.priority,
    })
  }
}

pub fn posix_from_row(row: &Row<'_>) -> rusqlite::Result<PosixUser> {
  Ok(PosixUser {
    account_id: row.get(0)?,
    uid:        row.get(1)?,
    gid_group:  row.get(2)?,
    shell:      row.get(3)?,
  })
}

pub struct RawQuarantine {
  pub entity_id:       EntityId,
  pub quarantine_type: String,
  pub creator_id:      Option<EntityId>,
  pub description:     Option<String>,
  pub start_date:      String,
  pub end_date:        Option<String>,
}

impl RawQuarantine {
  pub fn into_quarantine(self) -> Result<Quarantine> {
    Ok(Quarantine {
      entity_id:       self.entity_id,
      quarantine_type: decode_code("quarantine_type", &self.quarantine_type)?,
      creator_id:      self.creator_id,
      description:     self.description,
      start_date:      decode_date(&self.start_date)?,
      end_date:        decode_opt_date(self.end_date)?,
    })
  }
}

pub const GROUP_COLUMNS: &str = "group_id, name, description, creator_id, create_date, expire_date";

pub struct RawGroup {
  pub group_id:    EntityId,
  pub name:        String,
  pub description: Option<String>,
  pub creator_id:  Option<EntityId>,
  pub create_date: String,
  pub expire_date: Option<String>,
}

impl RawGroup {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      group_id:    row.get(0)?,
      name:        row.get(1)?,
      description: row.get(2)?,
      creator_id:  row.get(3)?,
      create_date: row.get(4)?,
      expire_date: row.get(5)?,
    })
  }

  pub fn into_group(self) -> Result<Group> {
    Ok(Group {
      group_id:    self.group_id,
      name:        self.name,
      description: self.description,
      creator_id:  self.creator_id,
      create_date: decode_date(&self.create_date)?,
      expire_date: decode_opt_date(self.expire_date)?,
    })
  }
}

pub struct RawMember {
  pub group_id:    EntityId,
  pub member_id:   EntityId,
  pub member_type: String,
}

impl RawMember {
  pub fn into_member(self) -> Result<GroupMember> {
    Ok(GroupMember {
      group_id:    self.group_id,
      member_id:   self.member_id,
      member_type: decode_code("entity_type", &self.member_type)?,
    })
  }
}

pub const CHANGE_COLUMNS: &str =
  "change_id, run_id, change_program, change_type, subject_id, params, recorded_at";

pub struct RawChange {
  pub change_id:      i64,
  pub run_id:         String,
  pub change_program: String,
  pub change_type:    String,
  pub subject_id:     EntityId,
  pub params:         Option<String>,
  pub recorded_at:    String,
}

impl RawChange {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      change_id:      row.get(0)?,
      run_id:         row.get(1)?,
      change_program: row.get(2)?,
      change_type:    row.get(3)?,
      subject_id:     row.get(4)?,
      params:         row.get(5)?,
      recorded_at:    row.get(6)?,
    })
  }

  pub fn into_change(self) -> Result<ChangeLogEntry> {
    Ok(ChangeLogEntry {
      change_id:      self.change_id,
      run_id:         decode_uuid(&self.run_id)?,
      change_program: self.change_program,
      change_type:    decode_code("change_type", &self.change_type)?,
      subject_id:     self.subject_id,
      params:         self.params.as_deref().map(serde_json::from_str).transpose()?,
      recorded_at:    decode_dt(&self.recorded_at)?,
    })
  }
}
