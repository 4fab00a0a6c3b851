//! Registry of locked items.
//!
//! Persists the mapping from an item's original path to its locked form
//! so a front-end can list what is currently locked.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use fflocker_common::{Error, LockedItemRecord, Result};

/// Storage of [`LockedItemRecord`]s keyed by original path.
pub trait LockedItemsRepository: Send + Sync {
    /// Insert or replace the record for `record.original_path`.
    fn add(&self, record: &LockedItemRecord) -> Result<()>;

    /// Remove the record for `original_path`. Returns whether one existed.
    fn remove(&self, original_path: &Path) -> Result<bool>;

    /// All records, oldest first.
    fn list(&self) -> Result<Vec<LockedItemRecord>>;
}

/// In-process repository.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: Mutex<Vec<LockedItemRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockedItemsRepository for MemoryRepository {
    fn add(&self, record: &LockedItemRecord) -> Result<()> {
        let mut records = self.records.lock().map_err(poisoned)?;
        records.retain(|r| r.original_path != record.original_path);
        records.push(record.clone());
        Ok(())
    }

    fn remove(&self, original_path: &Path) -> Result<bool> {
        let mut records = self.records.lock().map_err(poisoned)?;
        let before = records.len();
        records.retain(|r| r.original_path != original_path);
        Ok(records.len() != before)
    }

    fn list(&self) -> Result<Vec<LockedItemRecord>> {
        Ok(self.records.lock().map_err(poisoned)?.clone())
    }
}

/// SQLite-backed repository.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Create or open the database at `db_path`, creating parent directories.
    ///
    /// # Errors
    /// - [`Error::Registry`] on database creation or schema failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).map_err(sql)?;
        let repo = Self::init(conn)?;
        info!("Registry opened at {}", db_path.display());
        Ok(repo)
    }

    /// Create an in-memory repository (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(sql)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS locked_items (
                original_path TEXT PRIMARY KEY,
                locked_path TEXT NOT NULL,
                is_folder INTEGER NOT NULL,
                locked_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(sql)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LockedItemsRepository for SqliteRepository {
    fn add(&self, record: &LockedItemRecord) -> Result<()> {
        debug!("Registering locked item: {}", record.original_path.display());
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO locked_items
            (original_path, locked_path, is_folder, locked_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.original_path.to_string_lossy(),
                record.locked_path.to_string_lossy(),
                record.is_folder as i32,
                record.locked_at.to_rfc3339(),
            ],
        )
        .map_err(sql)?;
        Ok(())
    }

    fn remove(&self, original_path: &Path) -> Result<bool> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let removed = conn
            .execute(
                "DELETE FROM locked_items WHERE original_path = ?1",
                params![original_path.to_string_lossy()],
            )
            .map_err(sql)?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<LockedItemRecord>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT original_path, locked_path, is_folder, locked_at
                FROM locked_items ORDER BY locked_at
                "#,
            )
            .map_err(sql)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)? != 0,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(sql)?;

        let mut records = Vec::new();
        for row in rows {
            let (original, locked, is_folder, locked_at) = row.map_err(sql)?;
            let locked_at = DateTime::parse_from_rfc3339(&locked_at)
                .map_err(|e| Error::Registry(format!("bad timestamp {}: {}", locked_at, e)))?
                .with_timezone(&Utc);
            records.push(LockedItemRecord {
                original_path: PathBuf::from(original),
                locked_path: PathBuf::from(locked),
                is_folder,
                locked_at,
            });
        }
        Ok(records)
    }
}

fn sql(err: rusqlite::Error) -> Error {
    Error::Registry(err.to_string())
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Registry("registry lock poisoned".to_string())
}
