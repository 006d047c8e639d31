//! [`SqliteStore`]: the SQLite implementation of [`IdentityStore`].

use std::{collections::BTreeMap, path::Path, sync::Arc};

use chrono::{Local, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use cerebrum_core::{
  code::{
    AddressType, Affiliation, ChangeType, EntityType, ExternalIdType, NameVariant,
    QuarantineType, SourceSystem,
  },
  entity::{
    Account, AccountType, Address, AddressFields, ChangeLogEntry, ContactInfo, EntityId,
    EntitySpread, ExternalId, Group, GroupMember, NewAccount, NewAffiliation, NewContact,
    NewGroup, NewOu, NewPerson, NewQuarantine, Ou, Person, PersonAffiliation, PersonName,
    PosixUser, Quarantine, Stedkode,
  },
  range::IdRange,
  store::{AffiliationFilter, ExternalIdFilter, IdentityStore, Upsert},
};

use crate::{
  Error, Result,
  encode::{
    ACCOUNT_COLUMNS, AFFILIATION_COLUMNS, CHANGE_COLUMNS, GROUP_COLUMNS, OU_COLUMNS,
    PERSON_COLUMNS, RawAccount, RawAccountType, RawAddress, RawAffiliation, RawChange,
    RawContact, RawExternalId, RawGroup, RawMember, RawName, RawOu, RawPerson, RawQuarantine,
    RawSpread, decode_code, encode_date, encode_dt, encode_opt_date, encode_uuid,
    posix_from_row,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// Who is writing: every change log row carries these.
struct RunContext {
  change_program: String,
  run_id:         Uuid,
}

/// A Cerebrum database backed by a single SQLite file.
///
/// Cloning is cheap; clones share the connection and the run context.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
  run:  Arc<RunContext>,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory store; useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    let store = Self {
      conn,
      run: Arc::new(RunContext {
        change_program: "cerebrum".to_owned(),
        run_id:         Uuid::new_v4(),
      }),
    };
    store.execute_batch(SCHEMA).await?;
    Ok(store)
  }

  /// Tag every change made through the returned store with `program` and a
  /// fresh run id.
  pub fn with_change_program(self, program: impl Into<String>) -> Self {
    Self {
      conn: self.conn,
      run:  Arc::new(RunContext {
        change_program: program.into(),
        run_id:         Uuid::new_v4(),
      }),
    }
  }

  pub fn change_program(&self) -> &str { &self.run.change_program }

  pub fn run_id(&self) -> Uuid { self.run.run_id }

  async fn execute_batch(&self, sql: &'static str) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute_batch(sql)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

fn today() -> NaiveDate { Local::now().date_naive() }

fn log_change(
  conn: &Connection,
  run: &RunContext,
  change_type: ChangeType,
  subject_id: EntityId,
  params: Option<serde_json::Value>,
) -> rusqlite::Result<()> {
  debug!(%change_type, subject_id, "change");
  conn.execute(
    "INSERT INTO change_log (run_id, change_program, change_type, subject_id, params, recorded_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    params![
      encode_uuid(run.run_id),
      run.change_program,
      change_type.to_string(),
      subject_id,
      params.map(|p| p.to_string()),
      encode_dt(Utc::now()),
    ],
  )?;
  Ok(())
}

fn new_entity(conn: &Connection, entity_type: EntityType) -> rusqlite::Result<EntityId> {
  conn.execute(
    "INSERT INTO entity_info (entity_type) VALUES (?1)",
    params![entity_type.to_string()],
  )?;
  Ok(conn.last_insert_rowid())
}

// ─── IdentityStore impl ──────────────────────────────────────────────────────

impl IdentityStore for SqliteStore {
  type Error = Error;

  // ── Transactions ──────────────────────────────────────────────────────────

  async fn begin(&self) -> Result<()> { self.execute_batch("BEGIN").await }

  async fn commit(&self) -> Result<()> { self.execute_batch("COMMIT").await }

  async fn rollback(&self) -> Result<()> { self.execute_batch("ROLLBACK").await }

  async fn entity_type(&self, entity_id: EntityId) -> Result<Option<EntityType>> {
    let raw: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT entity_type FROM entity_info WHERE entity_id = ?1",
              params![entity_id],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(|t| decode_code("entity_type", &t)).transpose()
  }

  // ── Organisational units ──────────────────────────────────────────────────

  async fn add_ou(&self, ou: NewOu) -> Result<Ou> {
    let run = self.run.clone();
    let stedkode = ou.stedkode.map(|s| s.to_string());
    let (name, acronym, parent_id) = (ou.name.clone(), ou.acronym.clone(), ou.parent_id);

    let ou_id = self
      .conn
      .call(move |conn| {
        let id = new_entity(conn, EntityType::Ou)?;
        conn.execute(
          "INSERT INTO ou_info (ou_id, stedkode, name, acronym, parent_id)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          params![id, stedkode, name, acronym, parent_id],
        )?;
        log_change(conn, &run, ChangeType::OuCreate, id, Some(json!({ "name": name })))?;
        Ok(id)
      })
      .await?;

    Ok(Ou {
      ou_id,
      stedkode: ou.stedkode,
      name: ou.name,
      acronym: ou.acronym,
      parent_id: ou.parent_id,
      expire_date: None,
    })
  }

  async fn update_ou(&self, ou_id: EntityId, ou: NewOu) -> Result<bool> {
    let current = self
      .get_ou(ou_id)
      .await?
      .ok_or(Error::NotFound { entity_type: EntityType::Ou, id: ou_id })?;
    if current.stedkode == ou.stedkode
      && current.name == ou.name
      && current.acronym == ou.acronym
      && current.parent_id == ou.parent_id
    {
      return Ok(false);
    }

    let run = self.run.clone();
    let stedkode = ou.stedkode.map(|s| s.to_string());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE ou_info SET stedkode = ?2, name = ?3, acronym = ?4, parent_id = ?5
           WHERE ou_id = ?1",
          params![ou_id, stedkode, ou.name, ou.acronym, ou.parent_id],
        )?;
        log_change(conn, &run, ChangeType::OuMod, ou_id, Some(json!({ "name": ou.name })))?;
        Ok(())
      })
      .await?;
    Ok(true)
  }

  async fn set_ou_expire(&self, ou_id: EntityId, expire_date: Option<NaiveDate>) -> Result<()> {
    let run = self.run.clone();
    let expire = encode_opt_date(expire_date);
    self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "UPDATE ou_info SET expire_date = ?2 WHERE ou_id = ?1 AND expire_date IS NOT ?2",
          params![ou_id, expire],
        )?;
        if n > 0 {
          log_change(conn, &run, ChangeType::OuMod, ou_id, Some(json!({ "expire_date": expire })))?;
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_ou(&self, ou_id: EntityId) -> Result<Option<Ou>> {
    let raw: Option<RawOu> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {OU_COLUMNS} FROM ou_info WHERE ou_id = ?1"),
              params![ou_id],
              RawOu::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawOu::into_ou).transpose()
  }

  async fn find_ou_by_stedkode(&self, stedkode: Stedkode) -> Result<Option<Ou>> {
    let sko = stedkode.to_string();
    let raw: Option<RawOu> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {OU_COLUMNS} FROM ou_info WHERE stedkode = ?1"),
              params![sko],
              RawOu::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawOu::into_ou).transpose()
  }

  async fn list_ous(&self) -> Result<Vec<Ou>> {
    let raws: Vec<RawOu> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!("SELECT {OU_COLUMNS} FROM ou_info ORDER BY ou_id"))?;
        let rows = stmt
          .query_map([], RawOu::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawOu::into_ou).collect()
  }

  // ── Persons ───────────────────────────────────────────────────────────────

  async fn create_person(&self, person: NewPerson) -> Result<Person> {
    let run = self.run.clone();
    let birth = encode_date(person.birth_date);
    let gender = person.gender.to_string();

    let person_id = self
      .conn
      .call(move |conn| {
        let id = new_entity(conn, EntityType::Person)?;
        conn.execute(
          "INSERT INTO person_info (person_id, birth_date, gender) VALUES (?1, ?2, ?3)",
          params![id, birth, gender],
        )?;
        log_change(conn, &run, ChangeType::PersonCreate, id, None)?;
        Ok(id)
      })
      .await?;

    Ok(Person {
      person_id,
      birth_date: person.birth_date,
      gender: person.gender,
      deceased_date: None,
    })
  }

  async fn update_person(&self, person_id: EntityId, person: NewPerson) -> Result<bool> {
    let current = self
      .get_person(person_id)
      .await?
      .ok_or(Error::NotFound { entity_type: EntityType::Person, id: person_id })?;
    if current.birth_date == person.birth_date && current.gender == person.gender {
      return Ok(false);
    }

    let run = self.run.clone();
    let birth = encode_date(person.birth_date);
    let gender = person.gender.to_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE person_info SET birth_date = ?2, gender = ?3 WHERE person_id = ?1",
          params![person_id, birth, gender],
        )?;
        log_change(
          conn,
          &run,
          ChangeType::PersonMod,
          person_id,
          Some(json!({ "birth_date": birth, "gender": gender })),
        )?;
        Ok(())
      })
      .await?;
    Ok(true)
  }

  async fn set_deceased(&self, person_id: EntityId, deceased_date: Option<NaiveDate>) -> Result<()> {
    let run = self.run.clone();
    let deceased = encode_opt_date(deceased_date);
    self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "UPDATE person_info SET deceased_date = ?2
           WHERE person_id = ?1 AND deceased_date IS NOT ?2",
          params![person_id, deceased],
        )?;
        if n > 0 {
          log_change(
            conn,
            &run,
            ChangeType::PersonMod,
            person_id,
            Some(json!({ "deceased_date": deceased })),
          )?;
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_person(&self, person_id: EntityId) -> Result<Option<Person>> {
    let raw: Option<RawPerson> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {PERSON_COLUMNS} FROM person_info WHERE person_id = ?1"),
              params![person_id],
              RawPerson::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawPerson::into_person).transpose()
  }

  async fn list_persons(&self) -> Result<Vec<Person>> {
    let raws: Vec<RawPerson> = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare(&format!("SELECT {PERSON_COLUMNS} FROM person_info ORDER BY person_id"))?;
        let rows = stmt
          .query_map([], RawPerson::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawPerson::into_person).collect()
  }

  async fn set_names(
    &self,
    person_id: EntityId,
    source: SourceSystem,
    names: Vec<(NameVariant, String)>,
  ) -> Result<bool> {
    let run = self.run.clone();
    let source = source.to_string();
    let desired: BTreeMap<String, String> =
      names.into_iter().map(|(v, n)| (v.to_string(), n)).collect();

    let changed = self
      .conn
      .call(move |conn| {
        let current: BTreeMap<String, String> = {
          let mut stmt = conn
            .prepare("SELECT variant, name FROM person_name WHERE person_id = ?1 AND source = ?2")?;
          stmt
            .query_map(params![person_id, source], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?
        };
        if current == desired {
          return Ok(false);
        }
        conn.execute(
          "DELETE FROM person_name WHERE person_id = ?1 AND source = ?2",
          params![person_id, source],
        )?;
        for (variant, name) in &desired {
          conn.execute(
            "INSERT INTO person_name (person_id, source, variant, name) VALUES (?1, ?2, ?3, ?4)",
            params![person_id, source, variant, name],
          )?;
        }
        log_change(
          conn,
          &run,
          ChangeType::PersonNameMod,
          person_id,
          Some(json!({ "source": source })),
        )?;
        Ok(true)
      })
      .await?;
    Ok(changed)
  }

  async fn list_names(&self, person_id: EntityId) -> Result<Vec<PersonName>> {
    let raws: Vec<RawName> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT person_id, source, variant, name FROM person_name
           WHERE person_id = ?1 ORDER BY source, variant",
        )?;
        let rows = stmt
          .query_map(params![person_id], |r| {
            Ok(RawName {
              person_id: r.get(0)?,
              source:    r.get(1)?,
              variant:   r.get(2)?,
              name:      r.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawName::into_name).collect()
  }

  // ── External ids, contact info, addresses ────────────────────────────────

  async fn set_external_ids(
    &self,
    entity_id: EntityId,
    source: SourceSystem,
    ids: Vec<(ExternalIdType, String)>,
  ) -> Result<bool> {
    let run = self.run.clone();
    let source = source.to_string();
    let desired: BTreeMap<String, String> =
      ids.into_iter().map(|(t, v)| (t.to_string(), v)).collect();

    let changed = self
      .conn
      .call(move |conn| {
        let current: BTreeMap<String, String> = {
          let mut stmt = conn.prepare(
            "SELECT id_type, value FROM entity_external_id WHERE entity_id = ?1 AND source = ?2",
          )?;
          stmt
            .query_map(params![entity_id, source], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?
        };
        if current == desired {
          return Ok(false);
        }
        conn.execute(
          "DELETE FROM entity_external_id WHERE entity_id = ?1 AND source = ?2",
          params![entity_id, source],
        )?;
        for (id_type, value) in &desired {
          conn.execute(
            "INSERT INTO entity_external_id (entity_id, source, id_type, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![entity_id, source, id_type, value],
          )?;
        }
        log_change(
          conn,
          &run,
          ChangeType::ExternalIdMod,
          entity_id,
          Some(json!({ "source": source, "ids": desired })),
        )?;
        Ok(true)
      })
      .await?;
    Ok(changed)
  }

  async fn find_by_external_id(
    &self,
    id_type: ExternalIdType,
    value: &str,
  ) -> Result<Option<EntityId>> {
    let id_type = id_type.to_string();
    let value = value.to_owned();
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(
            conn
              .query_row(
                "SELECT entity_id FROM entity_external_id
                 WHERE id_type = ?1 AND value = ?2 ORDER BY entity_id LIMIT 1",
                params![id_type, value],
                |r| r.get(0),
              )
              .optional()?,
          )
        })
        .await?,
    )
  }

  async fn list_external_ids(&self, filter: ExternalIdFilter) -> Result<Vec<ExternalId>> {
    let id_type = filter.id_type.map(|t| t.to_string());
    let source = filter.source.map(|s| s.to_string());
    let raws: Vec<RawExternalId> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT entity_id, source, id_type, value FROM entity_external_id
           WHERE (?1 IS NULL OR entity_id = ?1)
             AND (?2 IS NULL OR id_type = ?2)
             AND (?3 IS NULL OR source = ?3)
           ORDER BY entity_id, source, id_type",
        )?;
        let rows = stmt
          .query_map(params![filter.entity_id, id_type, source], |r| {
            Ok(RawExternalId {
              entity_id: r.get(0)?,
              source:    r.get(1)?,
              id_type:   r.get(2)?,
              value:     r.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawExternalId::into_external_id).collect()
  }

  async fn set_contact_info(
    &self,
    entity_id: EntityId,
    source: SourceSystem,
    contacts: Vec<NewContact>,
  ) -> Result<bool> {
    let run = self.run.clone();
    let source = source.to_string();
    let desired: BTreeMap<(String, u32), String> = contacts
      .into_iter()
      .map(|c| ((c.contact_type.to_string(), c.preference), c.value))
      .collect();

    let changed = self
      .conn
      .call(move |conn| {
        let current: BTreeMap<(String, u32), String> = {
          let mut stmt = conn.prepare(
            "SELECT contact_type, preference, value FROM entity_contact_info
             WHERE entity_id = ?1 AND source = ?2",
          )?;
          stmt
            .query_map(params![entity_id, source], |r| Ok(((r.get(0)?, r.get(1)?), r.get(2)?)))?
            .collect::<rusqlite::Result<_>>()?
        };
        if current == desired {
          return Ok(false);
        }
        conn.execute(
          "DELETE FROM entity_contact_info WHERE entity_id = ?1 AND source = ?2",
          params![entity_id, source],
        )?;
        for ((contact_type, preference), value) in &desired {
          conn.execute(
            "INSERT INTO entity_contact_info (entity_id, source, contact_type, preference, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entity_id, source, contact_type, preference, value],
          )?;
        }
        log_change(conn, &run, ChangeType::ContactMod, entity_id, Some(json!({ "source": source })))?;
        Ok(true)
      })
      .await?;
    Ok(changed)
  }

  async fn list_contact_info(&self, entity_id: EntityId) -> Result<Vec<ContactInfo>> {
    let raws: Vec<RawContact> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT entity_id, source, contact_type, preference, value FROM entity_contact_info
           WHERE entity_id = ?1 ORDER BY source, contact_type, preference",
        )?;
        let rows = stmt
          .query_map(params![entity_id], |r| {
            Ok(RawContact {
              entity_id:    r.get(0)?,
              source:       r.get(1)?,
              contact_type: r.get(2)?,
              preference:   r.get(3)?,
              value:        r.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawContact::into_contact).collect()
  }

  async fn set_addresses(
    &self,
    entity_id: EntityId,
    source: SourceSystem,
    addresses: Vec<(AddressType, AddressFields)>,
  ) -> Result<bool> {
    let current: BTreeMap<String, AddressFields> = self
      .list_addresses(entity_id)
      .await?
      .into_iter()
      .filter(|a| a.source == source)
      .map(|a| (a.address_type.to_string(), a.fields))
      .collect();
    let desired: BTreeMap<String, AddressFields> =
      addresses.into_iter().map(|(t, f)| (t.to_string(), f)).collect();
    if current == desired {
      return Ok(false);
    }

    let run = self.run.clone();
    let source = source.to_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM entity_address WHERE entity_id = ?1 AND source = ?2",
          params![entity_id, source],
        )?;
        for (address_type, f) in &desired {
          conn.execute(
            "INSERT INTO entity_address (
               entity_id, source, address_type,
               address_text, p_o_box, postal_number, city, country
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
              entity_id,
              source,
              address_type,
              f.address_text,
              f.p_o_box,
              f.postal_number,
              f.city,
              f.country,
            ],
          )?;
        }
        log_change(conn, &run, ChangeType::AddressMod, entity_id, Some(json!({ "source": source })))?;
        Ok(())
      })
      .await?;
    Ok(true)
  }

  async fn list_addresses(&self, entity_id: EntityId) -> Result<Vec<Address>> {
    let raws: Vec<RawAddress> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT entity_id, source, address_type,
                  address_text, p_o_box, postal_number, city, country
           FROM entity_address WHERE entity_id = ?1 ORDER BY source, address_type",
        )?;
        let rows = stmt
          .query_map(params![entity_id], |r| {
            Ok(RawAddress {
              entity_id:    r.get(0)?,
              source:       r.get(1)?,
              address_type: r.get(2)?,
              fields:       AddressFields {
                address_text:  r.get(3)?,
                p_o_box:       r.get(4)?,
                postal_number: r.get(5)?,
                city:          r.get(6)?,
                country:       r.get(7)?,
              },
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAddress::into_address).collect()
  }

  // ── Affiliations ──────────────────────────────────────────────────────────

  async fn upsert_affiliation(&self, affiliation: NewAffiliation, today: NaiveDate) -> Result<Upsert> {
    let run = self.run.clone();
    let NewAffiliation { person_id, ou_id, status, source } = affiliation;
    let aff = status.affiliation().to_string();
    let status = status.to_string();
    let source = source.to_string();
    let today = encode_date(today);

    let outcome = self
      .conn
      .call(move |conn| {
        let current: Option<String> = conn
          .query_row(
            "SELECT status FROM person_affiliation_source
             WHERE person_id = ?1 AND ou_id = ?2 AND affiliation = ?3 AND source = ?4",
            params![person_id, ou_id, aff, source],
            |r| r.get(0),
          )
          .optional()?;

        let params = json!({ "ou_id": ou_id, "status": status, "source": source });
        let outcome = match current {
          None => {
            conn.execute(
              "INSERT INTO person_affiliation_source
                 (person_id, ou_id, affiliation, source, status, create_date, last_date)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
              params![person_id, ou_id, aff, source, status, today],
            )?;
            log_change(conn, &run, ChangeType::PersonAffAdd, person_id, Some(params))?;
            Upsert::Inserted
          }
          Some(old) => {
            conn.execute(
              "UPDATE person_affiliation_source SET status = ?5, last_date = ?6
               WHERE person_id = ?1 AND ou_id = ?2 AND affiliation = ?3 AND source = ?4",
              params![person_id, ou_id, aff, source, status, today],
            )?;
            if old == status {
              Upsert::Unchanged
            } else {
              log_change(conn, &run, ChangeType::PersonAffMod, person_id, Some(params))?;
              Upsert::Updated
            }
          }
        };
        Ok(outcome)
      })
      .await?;
    Ok(outcome)
  }

  async fn list_affiliations(&self, filter: AffiliationFilter) -> Result<Vec<PersonAffiliation>> {
    let aff = filter.affiliation.map(|a| a.to_string());
    let source = filter.source.map(|s| s.to_string());
    let raws: Vec<RawAffiliation> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {AFFILIATION_COLUMNS} FROM person_affiliation_source
           WHERE (?1 IS NULL OR person_id = ?1)
             AND (?2 IS NULL OR ou_id = ?2)
             AND (?3 IS NULL OR affiliation = ?3)
             AND (?4 IS NULL OR source = ?4)
           ORDER BY person_id, ou_id, affiliation, source"
        ))?;
        let rows = stmt
          .query_map(
            params![filter.person_id, filter.ou_id, aff, source],
            RawAffiliation::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAffiliation::into_affiliation).collect()
  }

  async fn delete_affiliation(
    &self,
    person_id: EntityId,
    ou_id: EntityId,
    affiliation: Affiliation,
    source: SourceSystem,
  ) -> Result<bool> {
    let run = self.run.clone();
    let aff = affiliation.to_string();
    let source = source.to_string();

    let deleted = self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "DELETE FROM person_affiliation_source
           WHERE person_id = ?1 AND ou_id = ?2 AND affiliation = ?3 AND source = ?4",
          params![person_id, ou_id, aff, source],
        )?;
        if n == 0 {
          return Ok(false);
        }
        log_change(
          conn,
          &run,
          ChangeType::PersonAffDel,
          person_id,
          Some(json!({ "ou_id": ou_id, "affiliation": aff, "source": source })),
        )?;

        let remaining: i64 = conn.query_row(
          "SELECT COUNT(*) FROM person_affiliation_source
           WHERE person_id = ?1 AND ou_id = ?2 AND affiliation = ?3",
          params![person_id, ou_id, aff],
          |r| r.get(0),
        )?;
        if remaining == 0 {
          let accounts: Vec<EntityId> = {
            let mut stmt = conn.prepare(
              "SELECT account_id FROM account_type
               WHERE person_id = ?1 AND ou_id = ?2 AND affiliation = ?3",
            )?;
            stmt
              .query_map(params![person_id, ou_id, aff], |r| r.get(0))?
              .collect::<rusqlite::Result<_>>()?
          };
          conn.execute(
            "DELETE FROM account_type WHERE person_id = ?1 AND ou_id = ?2 AND affiliation = ?3",
            params![person_id, ou_id, aff],
          )?;
          for account_id in accounts {
            log_change(
              conn,
              &run,
              ChangeType::AccountTypeDel,
              account_id,
              Some(json!({ "ou_id": ou_id, "affiliation": aff })),
            )?;
          }
        }
        Ok(true)
      })
      .await?;
    Ok(deleted)
  }

  // ── Spreads ───────────────────────────────────────────────────────────────

  async fn register_spread(&self, code: &str, entity_type: EntityType) -> Result<()> {
    let code = code.to_owned();
    let entity_type = entity_type.to_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO spread_code (code, entity_type) VALUES (?1, ?2)
           ON CONFLICT(code) DO UPDATE SET entity_type = excluded.entity_type",
          params![code, entity_type],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn spread_entity_type(&self, code: &str) -> Result<Option<EntityType>> {
    let code = code.to_owned();
    let raw: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT entity_type FROM spread_code WHERE code = ?1",
              params![code],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(|t| decode_code("entity_type", &t)).transpose()
  }

  async fn add_spread(&self, entity_id: EntityId, spread: &str) -> Result<bool> {
    let expected = self
      .spread_entity_type(spread)
      .await?
      .ok_or_else(|| Error::UnknownSpread(spread.to_owned()))?;
    let found = self
      .entity_type(entity_id)
      .await?
      .ok_or(Error::UnknownEntity(entity_id))?;
    if expected != found {
      return Err(Error::SpreadEntityMismatch {
        spread: spread.to_owned(),
        entity_id,
        expected,
        found,
      });
    }

    let run = self.run.clone();
    let spread = spread.to_owned();
    Ok(
      self
        .conn
        .call(move |conn| {
          let n = conn.execute(
            "INSERT OR IGNORE INTO entity_spread (entity_id, spread) VALUES (?1, ?2)",
            params![entity_id, spread],
          )?;
          if n > 0 {
            log_change(conn, &run, ChangeType::SpreadAdd, entity_id, Some(json!({ "spread": spread })))?;
          }
          Ok(n > 0)
        })
        .await?,
    )
  }

  async fn delete_spread(&self, entity_id: EntityId, spread: &str) -> Result<bool> {
    let run = self.run.clone();
    let spread = spread.to_owned();
    Ok(
      self
        .conn
        .call(move |conn| {
          let n = conn.execute(
            "DELETE FROM entity_spread WHERE entity_id = ?1 AND spread = ?2",
            params![entity_id, spread],
          )?;
          if n > 0 {
            log_change(conn, &run, ChangeType::SpreadDel, entity_id, Some(json!({ "spread": spread })))?;
          }
          Ok(n > 0)
        })
        .await?,
    )
  }

  async fn set_spread_expire(
    &self,
    entity_id: EntityId,
    spread: &str,
    expire_date: Option<NaiveDate>,
  ) -> Result<()> {
    let run = self.run.clone();
    let spread = spread.to_owned();
    let expire = encode_opt_date(expire_date);
    self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "UPDATE entity_spread SET expire_date = ?3
           WHERE entity_id = ?1 AND spread = ?2 AND expire_date IS NOT ?3",
          params![entity_id, spread, expire],
        )?;
        if n > 0 {
          log_change(
            conn,
            &run,
            ChangeType::SpreadExpire,
            entity_id,
            Some(json!({ "spread": spread, "expire_date": expire })),
          )?;
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_spreads(&self, entity_id: Option<EntityId>) -> Result<Vec<EntitySpread>> {
    let raws: Vec<RawSpread> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT entity_id, spread, expire_date FROM entity_spread
           WHERE (?1 IS NULL OR entity_id = ?1) ORDER BY entity_id, spread",
        )?;
        let rows = stmt
          .query_map(params![entity_id], |r| {
            Ok(RawSpread {
              entity_id:   r.get(0)?,
              spread:      r.get(1)?,
              expire_date: r.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawSpread::into_spread).collect()
  }

  // ── Accounts ──────────────────────────────────────────────────────────────

  async fn create_account(&self, account: NewAccount) -> Result<Account> {
    let owner_type = self
      .entity_type(account.owner_id)
      .await?
      .ok_or(Error::UnknownEntity(account.owner_id))?;
    if self.find_account_by_name(&account.name).await?.is_some() {
      return Err(Error::NameTaken(account.name));
    }

    let run = self.run.clone();
    let create_date = today();
    let NewAccount { name, owner_id, creator_id, expire_date, gecos } = account;
    let row = (
      name.clone(),
      owner_type.to_string(),
      encode_date(create_date),
      encode_opt_date(expire_date),
      gecos.clone(),
    );

    let account_id = self
      .conn
      .call(move |conn| {
        let (name, owner_type, created, expire, gecos) = row;
        let id = new_entity(conn, EntityType::Account)?;
        conn.execute(
          "INSERT INTO account_info (
             account_id, name, owner_id, owner_type, creator_id, create_date, expire_date, gecos
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          params![id, name, owner_id, owner_type, creator_id, created, expire, gecos],
        )?;
        log_change(
          conn,
          &run,
          ChangeType::AccountCreate,
          id,
          Some(json!({ "name": name, "owner_id": owner_id })),
        )?;
        Ok(id)
      })
      .await?;

    Ok(Account {
      account_id,
      name,
      owner_id,
      owner_type,
      creator_id,
      create_date,
      expire_date,
      gecos,
    })
  }

  async fn get_account(&self, account_id: EntityId) -> Result<Option<Account>> {
    let raw: Option<RawAccount> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {ACCOUNT_COLUMNS} FROM account_info WHERE account_id = ?1"),
              params![account_id],
              RawAccount::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawAccount::into_account).transpose()
  }

  async fn find_account_by_name(&self, name: &str) -> Result<Option<Account>> {
    let name = name.to_owned();
    let raw: Option<RawAccount> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {ACCOUNT_COLUMNS} FROM account_info WHERE name = ?1"),
              params![name],
              RawAccount::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawAccount::into_account).transpose()
  }

  async fn list_accounts(&self, owner_id: Option<EntityId>) -> Result<Vec<Account>> {
    let raws: Vec<RawAccount> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {ACCOUNT_COLUMNS} FROM account_info
           WHERE (?1 IS NULL OR owner_id = ?1) ORDER BY account_id"
        ))?;
        let rows = stmt
          .query_map(params![owner_id], RawAccount::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAccount::into_account).collect()
  }

  async fn set_account_expire(
    &self,
    account_id: EntityId,
    expire_date: Option<NaiveDate>,
  ) -> Result<()> {
    let run = self.run.clone();
    let expire = encode_opt_date(expire_date);
    self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "UPDATE account_info SET expire_date = ?2
           WHERE account_id = ?1 AND expire_date IS NOT ?2",
          params![account_id, expire],
        )?;
        if n > 0 {
          log_change(
            conn,
            &run,
            ChangeType::AccountMod,
            account_id,
            Some(json!({ "expire_date": expire })),
          )?;
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn set_account_gecos(&self, account_id: EntityId, gecos: Option<String>) -> Result<()> {
    let run = self.run.clone();
    self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "UPDATE account_info SET gecos = ?2 WHERE account_id = ?1 AND gecos IS NOT ?2",
          params![account_id, gecos],
        )?;
        if n > 0 {
          log_change(conn, &run, ChangeType::AccountMod, account_id, Some(json!({ "gecos": gecos })))?;
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn set_password_hash(&self, account_id: EntityId, hash: String) -> Result<()> {
    let run = self.run.clone();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE account_info SET password_hash = ?2 WHERE account_id = ?1",
          params![account_id, hash],
        )?;
        log_change(conn, &run, ChangeType::AccountPassword, account_id, None)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_account_types(&self, account_id: Option<EntityId>) -> Result<Vec<AccountType>> {
    let raws: Vec<RawAccountType> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT account_id, person_id, ou_id, affiliation, priority FROM account_type
           WHERE (?1 IS NULL OR account_id = ?1) ORDER BY account_id, priority",
        )?;
        let rows = stmt
          .query_map(params![account_id], |r| {
            Ok(RawAccountType {
              account_id:  r.get(0)?,
              person_id:   r.get(1)?,
              ou_id:       r.get(2)?,
              affiliation: r.get(3)?,
              priority:    r.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAccountType::into_account_type).collect()
  }

  async fn set_account_type(
    &self,
    account_id: EntityId,
    ou_id: EntityId,
    affiliation: Affiliation,
  ) -> Result<AccountType> {
    let account = self
      .get_account(account_id)
      .await?
      .ok_or(Error::NotFound { entity_type: EntityType::Account, id: account_id })?;
    if account.owner_type != EntityType::Person {
      return Err(Error::NotPersonal(account_id));
    }
    let person_id = account.owner_id;

    let run = self.run.clone();
    let aff = affiliation.to_string();
    let priority: Option<i32> = self
      .conn
      .call(move |conn| {
        let has_affiliation = conn
          .query_row(
            "SELECT 1 FROM person_affiliation_source
             WHERE person_id = ?1 AND ou_id = ?2 AND affiliation = ?3 LIMIT 1",
            params![person_id, ou_id, aff],
            |_| Ok(()),
          )
          .optional()?
          .is_some();
        if !has_affiliation {
          return Ok(None);
        }

        let existing: Option<i32> = conn
          .query_row(
            "SELECT priority FROM account_type
             WHERE account_id = ?1 AND ou_id = ?2 AND affiliation = ?3",
            params![account_id, ou_id, aff],
            |r| r.get(0),
          )
          .optional()?;
        if existing.is_some() {
          return Ok(existing);
        }

        let priority: i32 = conn.query_row(
          "SELECT COALESCE(MAX(priority), 0) + 1 FROM account_type WHERE person_id = ?1",
          params![person_id],
          |r| r.get(0),
        )?;
        conn.execute(
          "INSERT INTO account_type (account_id, person_id, ou_id, affiliation, priority)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          params![account_id, person_id, ou_id, aff, priority],
        )?;
        log_change(
          conn,
          &run,
          ChangeType::AccountTypeAdd,
          account_id,
          Some(json!({ "ou_id": ou_id, "affiliation": aff, "priority": priority })),
        )?;
        Ok(Some(priority))
      })
      .await?;

    let priority = priority.ok_or(Error::MissingAffiliation {
      account_id,
      person_id,
      ou_id,
      affiliation,
    })?;
    Ok(AccountType { account_id, person_id, ou_id, affiliation, priority })
  }

  async fn delete_account_type(
    &self,
    account_id: EntityId,
    ou_id: EntityId,
    affiliation: Affiliation,
  ) -> Result<bool> {
    let run = self.run.clone();
    let aff = affiliation.to_string();
    Ok(
      self
        .conn
        .call(move |conn| {
          let n = conn.execute(
            "DELETE FROM account_type WHERE account_id = ?1 AND ou_id = ?2 AND affiliation = ?3",
            params![account_id, ou_id, aff],
          )?;
          if n > 0 {
            log_change(
              conn,
              &run,
              ChangeType::AccountTypeDel,
              account_id,
              Some(json!({ "ou_id": ou_id, "affiliation": aff })),
            )?;
          }
          Ok(n > 0)
        })
        .await?,
    )
  }

  // ── Posix ─────────────────────────────────────────────────────────────────

  async fn list_posix_users(&self) -> Result<Vec<PosixUser>> {
    Ok(
      self
        .conn
        .call(|conn| {
          let mut stmt = conn
            .prepare("SELECT account_id, uid, gid_group, shell FROM posix_user ORDER BY account_id")?;
          let rows = stmt
            .query_map([], posix_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
          Ok(rows)
        })
        .await?,
    )
  }

  async fn free_uid(&self, start: u32) -> Result<u32> {
    let max: Option<u32> = self
      .conn
      .call(|conn| Ok(conn.query_row("SELECT MAX(uid) FROM posix_user", [], |r| r.get(0))?))
      .await?;
    match max {
      None => Ok(start),
      Some(m) => m.checked_add(1).map(|next| start.max(next)).ok_or(Error::UidsExhausted),
    }
  }

  async fn add_posix_user(&self, user: PosixUser) -> Result<()> {
    let run = self.run.clone();
    let uid = user.uid;
    let inserted = self
      .conn
      .call(move |conn| {
        let taken = conn
          .query_row("SELECT 1 FROM posix_user WHERE uid = ?1", params![user.uid], |_| Ok(()))
          .optional()?
          .is_some();
        if taken {
          return Ok(false);
        }
        conn.execute(
          "INSERT INTO posix_user (account_id, uid, gid_group, shell) VALUES (?1, ?2, ?3, ?4)",
          params![user.account_id, user.uid, user.gid_group, user.shell],
        )?;
        log_change(
          conn,
          &run,
          ChangeType::PosixPromote,
          user.account_id,
          Some(json!({ "uid": user.uid, "shell": user.shell })),
        )?;
        Ok(true)
      })
      .await?;
    if inserted { Ok(()) } else { Err(Error::UidTaken(uid)) }
  }

  // ── Quarantines ───────────────────────────────────────────────────────────

  async fn add_quarantine(&self, quarantine: NewQuarantine) -> Result<bool> {
    let run = self.run.clone();
    let NewQuarantine {
      entity_id,
      quarantine_type,
      creator_id,
      description,
      start_date,
      end_date,
    } = quarantine;
    let qt = quarantine_type.to_string();
    let start = encode_date(start_date);
    let end = encode_opt_date(end_date);
    Ok(
      self
        .conn
        .call(move |conn| {
          let n = conn.execute(
            "INSERT OR IGNORE INTO entity_quarantine (
               entity_id, quarantine_type, creator_id, description, start_date, end_date
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![entity_id, qt, creator_id, description, start, end],
          )?;
          if n > 0 {
            log_change(
              conn,
              &run,
              ChangeType::QuarantineAdd,
              entity_id,
              Some(json!({ "type": qt, "start_date": start })),
            )?;
          }
          Ok(n > 0)
        })
        .await?,
    )
  }

  async fn delete_quarantine(
    &self,
    entity_id: EntityId,
    quarantine_type: QuarantineType,
  ) -> Result<bool> {
    let run = self.run.clone();
    let qt = quarantine_type.to_string();
    Ok(
      self
        .conn
        .call(move |conn| {
          let n = conn.execute(
            "DELETE FROM entity_quarantine WHERE entity_id = ?1 AND quarantine_type = ?2",
            params![entity_id, qt],
          )?;
          if n > 0 {
            log_change(conn, &run, ChangeType::QuarantineDel, entity_id, Some(json!({ "type": qt })))?;
          }
          Ok(n > 0)
        })
        .await?,
    )
  }

  async fn list_quarantines(&self, entity_id: Option<EntityId>) -> Result<Vec<Quarantine>> {
    let raws: Vec<RawQuarantine> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT entity_id, quarantine_type, creator_id, description, start_date, end_date
           FROM entity_quarantine
           WHERE (?1 IS NULL OR entity_id = ?1) ORDER BY entity_id, quarantine_type",
        )?;
        let rows = stmt
          .query_map(params![entity_id], |r| {
            Ok(RawQuarantine {
              entity_id:       r.get(0)?,
              quarantine_type: r.get(1)?,
              creator_id:      r.get(2)?,
              description:     r.get(3)?,
              start_date:      r.get(4)?,
              end_date:        r.get(5)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawQuarantine::into_quarantine).collect()
  }

  // ── Groups ────────────────────────────────────────────────────────────────

  async fn create_group(&self, group: NewGroup) -> Result<Group> {
    if self.find_group_by_name(&group.name).await?.is_some() {
      return Err(Error::NameTaken(group.name));
    }

    let run = self.run.clone();
    let create_date = today();
    let created = encode_date(create_date);
    let NewGroup { name, description, creator_id } = group;
    let row = (name.clone(), description.clone());

    let group_id = self
      .conn
      .call(move |conn| {
        let (name, description) = row;
        let id = new_entity(conn, EntityType::Group)?;
        conn.execute(
          "INSERT INTO group_info (group_id, name, description, creator_id, create_date)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          params![id, name, description, creator_id, created],
        )?;
        log_change(conn, &run, ChangeType::GroupCreate, id, Some(json!({ "name": name })))?;
        Ok(id)
      })
      .await?;

    Ok(Group {
      group_id,
      name,
      description,
      creator_id,
      create_date,
      expire_date: None,
    })
  }

  async fn find_group_by_name(&self, name: &str) -> Result<Option<Group>> {
    let name = name.to_owned();
    let raw: Option<RawGroup> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {GROUP_COLUMNS} FROM group_info WHERE name = ?1"),
              params![name],
              RawGroup::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawGroup::into_group).transpose()
  }

  async fn list_groups(&self) -> Result<Vec<Group>> {
    let raws: Vec<RawGroup> = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare(&format!("SELECT {GROUP_COLUMNS} FROM group_info ORDER BY group_id"))?;
        let rows = stmt
          .query_map([], RawGroup::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawGroup::into_group).collect()
  }

  async fn set_group_expire(
    &self,
    group_id: EntityId,
    expire_date: Option<NaiveDate>,
  ) -> Result<()> {
    let run = self.run.clone();
    let expire = encode_opt_date(expire_date);
    self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "UPDATE group_info SET expire_date = ?2 WHERE group_id = ?1 AND expire_date IS NOT ?2",
          params![group_id, expire],
        )?;
        if n > 0 {
          log_change(conn, &run, ChangeType::GroupMod, group_id, Some(json!({ "expire_date": expire })))?;
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn add_member(&self, group_id: EntityId, member_id: EntityId) -> Result<bool> {
    let member_type = self
      .entity_type(member_id)
      .await?
      .ok_or(Error::UnknownEntity(member_id))?
      .to_string();
    let run = self.run.clone();
    Ok(
      self
        .conn
        .call(move |conn| {
          let n = conn.execute(
            "INSERT OR IGNORE INTO group_member (group_id, member_id, member_type)
             VALUES (?1, ?2, ?3)",
            params![group_id, member_id, member_type],
          )?;
          if n > 0 {
            log_change(conn, &run, ChangeType::GroupAdd, group_id, Some(json!({ "member_id": member_id })))?;
          }
          Ok(n > 0)
        })
        .await?,
    )
  }

  async fn remove_member(&self, group_id: EntityId, member_id: EntityId) -> Result<bool> {
    let run = self.run.clone();
    Ok(
      self
        .conn
        .call(move |conn| {
          let n = conn.execute(
            "DELETE FROM group_member WHERE group_id = ?1 AND member_id = ?2",
            params![group_id, member_id],
          )?;
          if n > 0 {
            log_change(conn, &run, ChangeType::GroupRem, group_id, Some(json!({ "member_id": member_id })))?;
          }
          Ok(n > 0)
        })
        .await?,
    )
  }

  async fn list_members(&self, group_id: EntityId) -> Result<Vec<GroupMember>> {
    let raws: Vec<RawMember> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT group_id, member_id, member_type FROM group_member
           WHERE group_id = ?1 ORDER BY member_id",
        )?;
        let rows = stmt
          .query_map(params![group_id], |r| {
            Ok(RawMember {
              group_id:    r.get(0)?,
              member_id:   r.get(1)?,
              member_type: r.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawMember::into_member).collect()
  }

  // ── Email ─────────────────────────────────────────────────────────────────

  async fn get_primary_email(&self, account_id: EntityId) -> Result<Option<String>> {
    Ok(
      self
        .conn
        .call(move |conn| {
          Ok(
            conn
              .query_row(
                "SELECT address FROM email_primary_address WHERE account_id = ?1",
                params![account_id],
                |r| r.get(0),
              )
              .optional()?,
          )
        })
        .await?,
    )
  }

  async fn set_primary_email(&self, account_id: EntityId, address: &str) -> Result<bool> {
    if self.get_primary_email(account_id).await?.as_deref() == Some(address) {
      return Ok(false);
    }
    let run = self.run.clone();
    let address = address.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO email_primary_address (account_id, address) VALUES (?1, ?2)
           ON CONFLICT(account_id) DO UPDATE SET address = excluded.address",
          params![account_id, address],
        )?;
        log_change(conn, &run, ChangeType::EmailPrimary, account_id, Some(json!({ "address": address })))?;
        Ok(())
      })
      .await?;
    Ok(true)
  }

  // ── Change log ────────────────────────────────────────────────────────────

  async fn get_changes(&self, range: IdRange) -> Result<Vec<ChangeLogEntry>> {
    let raws: Vec<RawChange> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CHANGE_COLUMNS} FROM change_log
           WHERE change_id BETWEEN ?1 AND ?2 ORDER BY change_id"
        ))?;
        let rows = stmt
          .query_map(params![range.start, range.end], RawChange::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawChange::into_change).collect()
  }

  async fn list_changes_for(&self, subject_id: EntityId) -> Result<Vec<ChangeLogEntry>> {
    let raws: Vec<RawChange> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CHANGE_COLUMNS} FROM change_log WHERE subject_id = ?1 ORDER BY change_id"
        ))?;
        let rows = stmt
          .query_map(params![subject_id], RawChange::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawChange::into_change).collect()
  }
}
