//! SQLite-backed identity store.
//!
//! Attempt records live in their own table and are never deleted. Deleting
//! an identity leaves its attempts behind; promoting a quarantine re-keys
//! its attempts to the new registered identity.

use chrono::{DateTime, SecondsFormat, Utc};
use facegate_core::store::{
    ensure_append_only, FaceGuard, IdentityStore, Promotion, StoreError, StoreResult,
};
use facegate_core::{
    AttemptOutcome, AttemptRecord, Descriptor, GalleryEntry, Identity, IdentityId, Role,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    role          TEXT NOT NULL,
    display_name  TEXT NOT NULL,
    contact       TEXT NOT NULL,
    avatar_ref    TEXT,
    descriptor    TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    last_seen_at  TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS identities_registered_contact
    ON identities (contact) WHERE role = 'registered';
CREATE INDEX IF NOT EXISTS identities_role ON identities (role, seq);
CREATE TABLE IF NOT EXISTS attempts (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id  TEXT NOT NULL,
    timestamp    TEXT NOT NULL,
    outcome      TEXT NOT NULL,
    descriptor   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS attempts_identity ON attempts (identity_id, timestamp, seq);
";

const IDENTITY_COLUMNS: &str =
    "id, role, display_name, contact, avatar_ref, descriptor, created_at, last_seen_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the identity database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| unavailable("create database directory", e))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| unavailable("open database", e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| unavailable("enable WAL", e))?;
        Self::init(conn)
    }

    /// In-memory database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| unavailable("open database", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| unavailable("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    /// Run `f` inside an IMMEDIATE transaction, committing on success.
    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| unavailable("begin transaction", e))?;
        let value = f(&tx)?;
        tx.commit().map_err(|e| unavailable("commit", e))?;
        Ok(value)
    }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("{context}: {err}"))
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed-width UTC keeps lexicographic order equal to chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| unavailable("corrupt timestamp", e))
}

fn outcome_str(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Matched => "matched",
        AttemptOutcome::Quarantined => "quarantined",
        AttemptOutcome::Rejected => "rejected",
    }
}

fn parse_outcome(raw: &str) -> StoreResult<AttemptOutcome> {
    match raw {
        "matched" => Ok(AttemptOutcome::Matched),
        "quarantined" => Ok(AttemptOutcome::Quarantined),
        "rejected" => Ok(AttemptOutcome::Rejected),
        other => Err(StoreError::Unavailable(format!("corrupt attempt outcome: {other}"))),
    }
}

fn encode_descriptor(descriptor: &Descriptor) -> StoreResult<String> {
    serde_json::to_string(descriptor).map_err(|e| unavailable("encode descriptor", e))
}

fn decode_descriptor(raw: &str) -> StoreResult<Descriptor> {
    serde_json::from_str(raw).map_err(|e| unavailable("corrupt descriptor", e))
}

/// Raw identity row before decoding.
struct IdentityRow {
    id: String,
    role: String,
    display_name: String,
    contact: String,
    avatar_ref: Option<String>,
    descriptor: String,
    created_at: String,
    last_seen_at: String,
}

impl IdentityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            role: row.get(1)?,
            display_name: row.get(2)?,
            contact: row.get(3)?,
            avatar_ref: row.get(4)?,
            descriptor: row.get(5)?,
            created_at: row.get(6)?,
            last_seen_at: row.get(7)?,
        })
    }

    fn decode(self, attempt_log: Vec<AttemptRecord>) -> StoreResult<Identity> {
        Ok(Identity {
            id: self.id.parse().map_err(|e| unavailable("corrupt identity id", e))?,
            role: self.role.parse().map_err(StoreError::Unavailable)?,
            display_name: self.display_name,
            contact: self.contact,
            avatar_ref: self.avatar_ref,
            descriptor: decode_descriptor(&self.descriptor)?,
            attempt_log,
            created_at: parse_timestamp(&self.created_at)?,
            last_seen_at: parse_timestamp(&self.last_seen_at)?,
        })
    }
}

fn insert_attempt(conn: &Connection, id: &IdentityId, record: &AttemptRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO attempts (identity_id, timestamp, outcome, descriptor) VALUES (?1, ?2, ?3, ?4)",
        params![
            id.to_string(),
            timestamp(&record.timestamp),
            outcome_str(record.outcome),
            encode_descriptor(&record.descriptor_snapshot)?,
        ],
    )
    .map_err(|e| unavailable("insert attempt", e))?;
    Ok(())
}

fn attempts_for(conn: &Connection, id: &str) -> StoreResult<Vec<AttemptRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT timestamp, outcome, descriptor FROM attempts
             WHERE identity_id = ?1 ORDER BY timestamp, seq",
        )
        .map_err(|e| unavailable("prepare attempts query", e))?;
    let rows = stmt
        .query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })
        .map_err(|e| unavailable("query attempts", e))?;

    let mut log = Vec::new();
    for row in rows {
        let (ts, outcome, descriptor) = row.map_err(|e| unavailable("read attempt", e))?;
        log.push(AttemptRecord {
            timestamp: parse_timestamp(&ts)?,
            outcome: parse_outcome(&outcome)?,
            descriptor_snapshot: decode_descriptor(&descriptor)?,
        });
    }
    Ok(log)
}

fn load_where(conn: &Connection, clause: &str, param: &str) -> StoreResult<Vec<Identity>> {
    let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE {clause} ORDER BY seq");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| unavailable("prepare identity query", e))?;
    let rows = stmt
        .query_map(params![param], IdentityRow::from_row)
        .map_err(|e| unavailable("query identities", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| unavailable("read identity", e))?;

    rows.into_iter()
        .map(|row| {
            let log = attempts_for(conn, &row.id)?;
            row.decode(log)
        })
        .collect()
}

/// Registered ids and descriptors in insertion order. Attempts are not read.
fn load_gallery(conn: &Connection) -> StoreResult<Vec<GalleryEntry>> {
    let mut stmt = conn
        .prepare("SELECT id, descriptor FROM identities WHERE role = 'registered' ORDER BY seq")
        .map_err(|e| unavailable("prepare gallery query", e))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| unavailable("query gallery", e))?;

    let mut gallery = Vec::new();
    for row in rows {
        let (id, descriptor) = row.map_err(|e| unavailable("read gallery entry", e))?;
        gallery.push(GalleryEntry {
            id: id.parse().map_err(|e| unavailable("corrupt identity id", e))?,
            descriptor: decode_descriptor(&descriptor)?,
        });
    }
    Ok(gallery)
}

fn load_one(conn: &Connection, id: &IdentityId) -> StoreResult<Option<Identity>> {
    Ok(load_where(conn, "id = ?1", &id.to_string())?.into_iter().next())
}

fn contact_taken(conn: &Connection, contact: &str, except: Option<&IdentityId>) -> StoreResult<bool> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT id FROM identities WHERE role = 'registered' AND contact = ?1",
            params![contact],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| unavailable("query contact", e))?;
    Ok(match (owner, except) {
        (Some(owner), Some(except)) => owner != except.to_string(),
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn insert_identity(conn: &Connection, identity: &Identity) -> StoreResult<()> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM identities WHERE id = ?1)",
            params![identity.id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| unavailable("query identity", e))?;
    if exists {
        return Err(StoreError::AlreadyExists(identity.id));
    }
    if identity.is_registered() && contact_taken(conn, &identity.contact, None)? {
        return Err(StoreError::DuplicateContact(identity.contact.clone()));
    }

    conn.execute(
        &format!("INSERT INTO identities ({IDENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            identity.id.to_string(),
            identity.role.as_str(),
            identity.display_name,
            identity.contact,
            identity.avatar_ref,
            encode_descriptor(&identity.descriptor)?,
            timestamp(&identity.created_at),
            timestamp(&identity.last_seen_at),
        ],
    )
    .map_err(|e| unavailable("insert identity", e))?;

    for record in &identity.attempt_log {
        insert_attempt(conn, &identity.id, record)?;
    }
    Ok(())
}

impl IdentityStore for SqliteStore {
    fn find_by_role(&self, role: Role) -> StoreResult<Vec<Identity>> {
        let conn = self.lock()?;
        load_where(&conn, "role = ?1", role.as_str())
    }

    fn gallery(&self) -> StoreResult<Vec<GalleryEntry>> {
        let conn = self.lock()?;
        load_gallery(&conn)
    }

    fn find_by_contact(&self, contact: &str) -> StoreResult<Option<Identity>> {
        let conn = self.lock()?;
        Ok(load_where(&conn, "role = 'registered' AND contact = ?1", contact)?
            .into_iter()
            .next())
    }

    fn get(&self, id: &IdentityId) -> StoreResult<Option<Identity>> {
        let conn = self.lock()?;
        load_one(&conn, id)
    }

    fn attempt_history(&self, id: &IdentityId) -> StoreResult<Vec<AttemptRecord>> {
        let conn = self.lock()?;
        attempts_for(&conn, &id.to_string())
    }

    fn insert(&self, identity: &Identity) -> StoreResult<()> {
        self.write(|tx| insert_identity(tx, identity))
    }

    fn delete_by_id(&self, id: &IdentityId) -> StoreResult<()> {
        let conn = self.lock()?;
        let rows = conn
            .execute("DELETE FROM identities WHERE id = ?1", params![id.to_string()])
            .map_err(|e| unavailable("delete identity", e))?;
        if rows == 0 {
            tracing::debug!(id = %id, "delete of absent identity ignored");
        }
        Ok(())
    }

    fn update(&self, identity: &Identity) -> StoreResult<()> {
        self.write(|tx| {
            let existing = load_one(tx, &identity.id)?.ok_or(StoreError::NotFound(identity.id))?;
            ensure_append_only(&existing, identity)?;
            if identity.is_registered() && contact_taken(tx, &identity.contact, Some(&identity.id))? {
                return Err(StoreError::DuplicateContact(identity.contact.clone()));
            }

            tx.execute(
                "UPDATE identities SET role = ?2, display_name = ?3, contact = ?4, avatar_ref = ?5,
                     descriptor = ?6, last_seen_at = ?7
                 WHERE id = ?1",
                params![
                    identity.id.to_string(),
                    identity.role.as_str(),
                    identity.display_name,
                    identity.contact,
                    identity.avatar_ref,
                    encode_descriptor(&identity.descriptor)?,
                    timestamp(&identity.last_seen_at),
                ],
            )
            .map_err(|e| unavailable("update identity", e))?;

            for record in &identity.attempt_log[existing.attempt_log.len()..] {
                insert_attempt(tx, &identity.id, record)?;
            }
            Ok(())
        })
    }

    fn record_attempt(
        &self,
        id: &IdentityId,
        record: AttemptRecord,
        touch_last_seen: bool,
    ) -> StoreResult<Identity> {
        self.write(|tx| {
            let changed = tx
                .execute(
                    "UPDATE identities
                     SET last_seen_at = CASE WHEN ?3 THEN ?2 ELSE last_seen_at END
                     WHERE id = ?1",
                    params![id.to_string(), timestamp(&record.timestamp), touch_last_seen],
                )
                .map_err(|e| unavailable("touch identity", e))?;
            if changed == 0 {
                return Err(StoreError::NotFound(*id));
            }
            insert_attempt(tx, id, &record)?;
            load_one(tx, id)?.ok_or(StoreError::NotFound(*id))
        })
    }

    fn promote(
        &self,
        registered: Identity,
        quarantine_id: Option<&IdentityId>,
        face_guard: FaceGuard<'_>,
    ) -> StoreResult<Promotion> {
        self.write(|tx| {
            if let Some(owner) = face_guard(&load_gallery(tx)?) {
                return Err(StoreError::DuplicateFace(owner));
            }
            insert_identity(tx, &registered)?;

            let mut merged_from = None;
            if let Some(qid) = quarantine_id {
                let claimed = tx
                    .execute(
                        "DELETE FROM identities WHERE id = ?1 AND role = 'quarantined'",
                        params![qid.to_string()],
                    )
                    .map_err(|e| unavailable("claim quarantine", e))?;
                if claimed > 0 {
                    tx.execute(
                        "UPDATE attempts SET identity_id = ?2 WHERE identity_id = ?1",
                        params![qid.to_string(), registered.id.to_string()],
                    )
                    .map_err(|e| unavailable("move quarantine attempts", e))?;
                    merged_from = Some(*qid);
                }
            }

            let identity = load_one(tx, &registered.id)?.ok_or(StoreError::NotFound(registered.id))?;
            Ok(Promotion {
                identity,
                merged_from,
            })
        })
    }
}
