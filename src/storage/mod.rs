use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::config::DbConfig;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::StorageOptions;
use crate::journaling::{EntryFields, EntryGateway, EntryId, GatewayError, OwnerRef, Visibility};

pub mod memory;
mod schema;

const ENTRY_COLUMNS: &str =
    "id, owner_id, content, is_private, word_count, character_count, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRecord {
    pub id: EntryId,
    pub owner_id: OwnerRef,
    pub content: String,
    pub visibility: Visibility,
    pub word_count: usize,
    pub character_count: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn create_entry(&self, fields: &EntryFields, owner: &OwnerRef) -> Result<EntryId> {
        let id = EntryId::new();
        self.with_connection(|conn| {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            conn.execute(
                "INSERT INTO entries (id, owner_id, content, is_private, word_count, character_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    owner.as_str(),
                    fields.content,
                    fields.visibility.is_private(),
                    fields.stats.word_count as i64,
                    fields.stats.char_count as i64,
                    now
                ],
            )
            .context("inserting entry")?;
            Ok(id)
        })
    }

    /// Returns `false` when no entry with `id` exists.
    pub fn update_entry(&self, id: EntryId, fields: &EntryFields) -> Result<bool> {
        self.with_connection(|conn| {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            let updated = conn
                .execute(
                    "UPDATE entries
                     SET content = ?1, is_private = ?2, word_count = ?3, character_count = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        fields.content,
                        fields.visibility.is_private(),
                        fields.stats.word_count as i64,
                        fields.stats.char_count as i64,
                        now,
                        id.to_string()
                    ],
                )
                .with_context(|| format!("updating entry {id}"))?;
            Ok(updated > 0)
        })
    }

    /// Returns `false` when no entry with `id` exists.
    pub fn delete_entry(&self, id: EntryId) -> Result<bool> {
        self.with_connection(|conn| {
            let deleted = conn
                .execute("DELETE FROM entries WHERE id = ?1", [id.to_string()])
                .with_context(|| format!("deleting entry {id}"))?;
            Ok(deleted > 0)
        })
    }

    pub fn fetch_entry(&self, id: EntryId) -> Result<Option<EntryRecord>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1");
            conn.query_row(&sql, [id.to_string()], entry_from_row)
                .optional()
                .with_context(|| format!("fetching entry {id}"))
        })
    }

    /// Entries visible to `owner`, newest first. Visibility rules beyond
    /// ownership belong to the hosting service.
    pub fn list_entries(&self, owner: &OwnerRef, limit: usize) -> Result<Vec<EntryRecord>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS}
                 FROM entries
                 WHERE owner_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(params![owner.as_str(), limit as i64], entry_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("listing entries")?;
            Ok(records)
        })
    }
}

impl EntryGateway for StorageHandle {
    fn create(&self, fields: &EntryFields, owner: &OwnerRef) -> Result<EntryId, GatewayError> {
        self.create_entry(fields, owner)
            .map_err(|err| GatewayError::backend(format!("{err:#}")))
    }

    fn update(&self, id: EntryId, fields: &EntryFields) -> Result<(), GatewayError> {
        match self.update_entry(id, fields) {
            Ok(true) => Ok(()),
            Ok(false) => Err(GatewayError::NotFound(id)),
            Err(err) => Err(GatewayError::backend(format!("{err:#}"))),
        }
    }

    fn delete(&self, id: EntryId) -> Result<(), GatewayError> {
        match self.delete_entry(id) {
            Ok(true) => Ok(()),
            Ok(false) => Err(GatewayError::NotFound(id)),
            Err(err) => Err(GatewayError::backend(format!("{err:#}"))),
        }
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<EntryRecord> {
    let raw_id: String = row.get(0)?;
    let id = raw_id
        .parse::<EntryId>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))?;
    Ok(EntryRecord {
        id,
        owner_id: OwnerRef::new(row.get::<_, String>(1)?),
        content: row.get(2)?,
        visibility: Visibility::from_private_flag(row.get::<_, i64>(3)? != 0),
        word_count: row.get::<_, i64>(4)? as usize,
        character_count: row.get::<_, i64>(5)? as usize,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub fn init(storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = &storage.database_path;
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    tracing::debug!(path = %db_path.display(), "entry store ready");
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}
