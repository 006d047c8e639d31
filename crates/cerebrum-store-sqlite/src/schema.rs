//! SQL schema for the Cerebrum SQLite store.
//!
//! Executed on every open; idempotent thanks to `IF NOT EXISTS`. Dates are
//! `YYYY-MM-DD` text, timestamps RFC 3339 text, and code values are stored
//! in their string form.

pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One id space for persons, accounts, groups and OUs.
CREATE TABLE IF NOT EXISTS entity_info (
    entity_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL          -- 'person' | 'account' | 'group' | 'ou'
);

CREATE TABLE IF NOT EXISTS ou_info (
    ou_id       INTEGER PRIMARY KEY REFERENCES entity_info(entity_id),
    stedkode    TEXT UNIQUE,
    name        TEXT NOT NULL,
    acronym     TEXT,
    parent_id   INTEGER REFERENCES ou_info(ou_id),
    expire_date TEXT
);

CREATE TABLE IF NOT EXISTS person_info (
    person_id     INTEGER PRIMARY KEY REFERENCES entity_info(entity_id),
    birth_date    TEXT NOT NULL,
    gender        TEXT NOT NULL,
    deceased_date TEXT
);

CREATE TABLE IF NOT EXISTS person_name (
    person_id INTEGER NOT NULL REFERENCES person_info(person_id),
    source    TEXT NOT NULL,
    variant   TEXT NOT NULL,
    name      TEXT NOT NULL,
    PRIMARY KEY (person_id, source, variant)
);

CREATE TABLE IF NOT EXISTS entity_external_id (
    entity_id INTEGER NOT NULL REFERENCES entity_info(entity_id),
    source    TEXT NOT NULL,
    id_type   TEXT NOT NULL,
    value     TEXT NOT NULL,
    PRIMARY KEY (entity_id, source, id_type)
);

CREATE TABLE IF NOT EXISTS entity_contact_info (
    entity_id    INTEGER NOT NULL REFERENCES entity_info(entity_id),
    source       TEXT NOT NULL,
    contact_type TEXT NOT NULL,
    preference   INTEGER NOT NULL,
    value        TEXT NOT NULL,
    PRIMARY KEY (entity_id, source, contact_type, preference)
);

CREATE TABLE IF NOT EXISTS entity_address (
    entity_id     INTEGER NOT NULL REFERENCES entity_info(entity_id),
    source        TEXT NOT NULL,
    address_type  TEXT NOT NULL,
    address_text  TEXT,
    p_o_box       TEXT,
    postal_number TEXT,
    city          TEXT,
    country       TEXT,
    PRIMARY KEY (entity_id, source, address_type)
);

-- One row per source system that provides the affiliation.
CREATE TABLE IF NOT EXISTS person_affiliation_source (
    person_id   INTEGER NOT NULL REFERENCES person_info(person_id),
    ou_id       INTEGER NOT NULL REFERENCES ou_info(ou_id),
    affiliation TEXT NOT NULL,
    source      TEXT NOT NULL,
    status      TEXT NOT NULL,
    create_date TEXT NOT NULL,
    last_date   TEXT NOT NULL,
    PRIMARY KEY (person_id, ou_id, affiliation, source)
);

CREATE TABLE IF NOT EXISTS spread_code (
    code        TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_spread (
    entity_id   INTEGER NOT NULL REFERENCES entity_info(entity_id),
    spread      TEXT NOT NULL REFERENCES spread_code(code),
    expire_date TEXT,
    PRIMARY KEY (entity_id, spread)
);

CREATE TABLE IF NOT EXISTS account_info (
    account_id    INTEGER PRIMARY KEY REFERENCES entity_info(entity_id),
    name          TEXT NOT NULL UNIQUE,
    owner_id      INTEGER NOT NULL REFERENCES entity_info(entity_id),
    owner_type    TEXT NOT NULL,
    creator_id    INTEGER,
    create_date   TEXT NOT NULL,
    expire_date   TEXT,
    gecos         TEXT,
    password_hash TEXT
);

CREATE TABLE IF NOT EXISTS account_type (
    account_id  INTEGER NOT NULL REFERENCES account_info(account_id),
    person_id   INTEGER NOT NULL REFERENCES person_info(person_id),
    ou_id       INTEGER NOT NULL REFERENCES ou_info(ou_id),
    affiliation TEXT NOT NULL,
    priority    INTEGER NOT NULL,
    PRIMARY KEY (account_id, ou_id, affiliation)
);

CREATE TABLE IF NOT EXISTS posix_user (
    account_id INTEGER PRIMARY KEY REFERENCES account_info(account_id),
    uid        INTEGER NOT NULL UNIQUE,
    gid_group  INTEGER NOT NULL,
    shell      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_quarantine (
    entity_id       INTEGER NOT NULL REFERENCES entity_info(entity_id),
    quarantine_type TEXT NOT NULL,
    creator_id      INTEGER,
    description     TEXT,
    start_date      TEXT NOT NULL,
    end_date        TEXT,
    PRIMARY KEY (entity_id, quarantine_type)
);

CREATE TABLE IF NOT EXISTS group_info (
    group_id    INTEGER PRIMARY KEY REFERENCES entity_info(entity_id),
    name        TEXT NOT NULL UNIQUE,
    description TEXT,
    creator_id  INTEGER,
    create_date TEXT NOT NULL,
    expire_date TEXT
);

CREATE TABLE IF NOT EXISTS group_member (
    group_id    INTEGER NOT NULL REFERENCES group_info(group_id),
    member_id   INTEGER NOT NULL REFERENCES entity_info(entity_id),
    member_type TEXT NOT NULL,
    PRIMARY KEY (group_id, member_id)
);

CREATE TABLE IF NOT EXISTS email_primary_address (
    account_id INTEGER PRIMARY KEY REFERENCES account_info(account_id),
    address    TEXT NOT NULL
);

-- Append-only.
CREATE TABLE IF NOT EXISTS change_log (
    change_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id         TEXT NOT NULL,
    change_program TEXT NOT NULL,
    change_type    TEXT NOT NULL,
    subject_id     INTEGER NOT NULL,
    params         TEXT,           -- JSON or NULL
    recorded_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS external_id_value_idx ON entity_external_id(id_type, value);
CREATE INDEX IF NOT EXISTS affiliation_source_idx ON person_affiliation_source(source);
CREATE INDEX IF NOT EXISTS account_owner_idx     ON account_info(owner_id);
CREATE INDEX IF NOT EXISTS change_subject_idx    ON change_log(subject_id);

PRAGMA user_version = 1;
";
