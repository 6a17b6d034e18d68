//! SQLite store of chapter upload times, keyed by (comic id, chapter id).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::info;

use crate::{Error, Result};

/// Bumped whenever `migrate` learns a new step.
const SCHEMA_VERSION: i64 = 1;

pub struct Database {
    connection: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the store at `path` and brings its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        let database = Self {
            connection: Mutex::new(connection),
        };
        database.migrate()?;
        Ok(database)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection.lock().map_err(|_| Error::StorePoisoned)
    }

    fn migrate(&self) -> Result<()> {
        let connection = self.lock()?;
        let version: i64 = connection.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        if version < 1 {
            connection.execute(
                r#"
                CREATE TABLE IF NOT EXISTS chapter_upload_time(
                    comic_id INTEGER NOT NULL,
                    chapter_id INTEGER NOT NULL,
                    upload_time INTEGER NOT NULL,
                    PRIMARY KEY (comic_id, chapter_id)
                )
                "#,
                [],
            )?;
        }
        // PRAGMA does not take bound parameters.
        connection.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        info!(from = version, to = SCHEMA_VERSION, "migrated store schema");
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let connection = self.lock()?;
        Ok(connection.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn has_chapter_upload_time(&self, comic_id: i64, chapter_id: i64) -> Result<bool> {
        let connection = self.lock()?;
        let found = connection
            .query_row(
                "SELECT 1 FROM chapter_upload_time WHERE comic_id = ?1 AND chapter_id = ?2 LIMIT 1",
                params![comic_id, chapter_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Inserts a new record. An existing (comic, chapter) pair is left untouched
    /// and reported as [`Error::DuplicateKey`].
    pub fn insert_chapter_upload_time(
        &self,
        comic_id: i64,
        chapter_id: i64,
        upload_time: i64,
    ) -> Result<()> {
        let connection = self.lock()?;
        let inserted = connection.execute(
            "INSERT INTO chapter_upload_time(comic_id, chapter_id, upload_time) VALUES (?1, ?2, ?3)",
            params![comic_id, chapter_id, upload_time],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(Error::DuplicateKey {
                    comic_id,
                    chapter_id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn comic_ids(&self) -> Result<BTreeSet<i64>> {
        let connection = self.lock()?;
        let mut stmt = connection.prepare("SELECT DISTINCT comic_id FROM chapter_upload_time")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<BTreeSet<i64>>>()?;
        Ok(ids)
    }

    /// Chapter id to upload time for every stored chapter of `comic_id`.
    pub fn chapter_data(&self, comic_id: i64) -> Result<BTreeMap<i64, i64>> {
        let connection = self.lock()?;
        let mut stmt = connection
            .prepare("SELECT chapter_id, upload_time FROM chapter_upload_time WHERE comic_id = ?1")?;
        let data = stmt
            .query_map(params![comic_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<i64, i64>>>()?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn insert_then_lookup() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.has_chapter_upload_time(100, 1).unwrap());

        db.insert_chapter_upload_time(100, 1, 1000).unwrap();

        assert!(db.has_chapter_upload_time(100, 1).unwrap());
        assert!(!db.has_chapter_upload_time(100, 2).unwrap());
        assert!(!db.has_chapter_upload_time(101, 1).unwrap());
    }

    #[test]
    fn duplicate_insert_keeps_first_value() {
        let db = Database::open_in_memory().unwrap();
        db.insert_chapter_upload_time(100, 1, 1000).unwrap();

        let err = db.insert_chapter_upload_time(100, 1, 9999).unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateKey {
                comic_id: 100,
                chapter_id: 1
            }
        ));

        let data = db.chapter_data(100).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[&1], 1000);
    }

    #[test]
    fn groups_records_by_comic() {
        let db = Database::open_in_memory().unwrap();
        db.insert_chapter_upload_time(100, 1, 1000).unwrap();
        db.insert_chapter_upload_time(100, 2, 2000).unwrap();
        db.insert_chapter_upload_time(7, 1, 50).unwrap();

        assert_eq!(db.comic_ids().unwrap(), BTreeSet::from([7, 100]));
        assert_eq!(
            db.chapter_data(100).unwrap(),
            BTreeMap::from([(1, 1000), (2, 2000)])
        );
        assert!(db.chapter_data(5).unwrap().is_empty());
    }

    #[test]
    fn reopening_keeps_schema_and_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("database.sqlite3");

        {
            let db = Database::open(&path).unwrap();
            assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
            db.insert_chapter_upload_time(3, 4, 5).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
        assert!(db.has_chapter_upload_time(3, 4).unwrap());
    }
}
