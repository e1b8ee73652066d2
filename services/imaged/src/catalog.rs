//! SQLite-backed catalog of images and blob references.
//!
//! The catalog is the source of truth for every image's lifecycle state.
//! The worker advances rows one transition at a time; the control surface
//! inserts, reads, and deletes them. All access goes through a single
//! connection guarded by a mutex; the worker is the only writer that
//! performs multi-step sequences, so no cross-row transactions are needed.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::lifecycle::ImageState;

/// Errors from catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// One image row.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Monotonically assigned row id.
    pub id: i64,
    /// Caller-supplied unique name.
    pub name: String,
    /// Blob URL the archive is fetched from.
    pub blob_url: String,
    /// Expected lowercase hex sha256 of the archive bytes.
    pub checksum: String,
    /// Current lifecycle state.
    pub state: ImageState,
    /// Error text from the last failed side effect, if any.
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const IMAGE_COLUMNS: &str =
    "id, name, blob_key, checksum, state, last_error, created_at, updated_at";

/// SQLite catalog.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open or create a catalog at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let conn = Connection::open(path)?;

        // WAL keeps readers (the control surface) off the worker's writes.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.init_schema()?;

        Ok(catalog)
    }

    /// Open an in-memory catalog (for testing).
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    fn init_schema(&self) -> Result<(), CatalogError> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                blob_key TEXT NOT NULL,
                checksum TEXT NOT NULL,
                state TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_images_state ON images(state);

            CREATE TABLE IF NOT EXISTS blobs (
                image_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                checksum TEXT NOT NULL,
                UNIQUE(image_id, checksum)
            );
            "#,
        )?;

        debug!("Catalog schema initialized");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new image in `NEW` unless a row with that name exists.
    /// Repeat submissions are a no-op and still report success.
    pub fn enqueue(&self, name: &str, blob_url: &str, checksum: &str) -> Result<(), CatalogError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO images(name, blob_key, checksum, state) VALUES (?1, ?2, ?3, ?4)",
            params![name, blob_url, checksum, ImageState::New.as_str()],
        )?;
        Ok(())
    }

    /// Look up an image by name.
    pub fn get(&self, name: &str) -> Result<Option<ImageRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE name = ?1"
        ))?;

        stmt.query_row(params![name], row_to_image)
            .optional()
            .map_err(Into::into)
    }

    /// All images, oldest first.
    pub fn list(&self) -> Result<Vec<ImageRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {IMAGE_COLUMNS} FROM images ORDER BY id"))?;

        let records = stmt
            .query_map([], row_to_image)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Delete an image row. Returns whether a row was removed.
    pub fn delete(&self, name: &str) -> Result<bool, CatalogError> {
        let conn = self.lock();
        let affected = conn.execute("DELETE FROM images WHERE name = ?1", params![name])?;
        Ok(affected > 0)
    }

    /// Select one image that still has work pending. The single-worker
    /// design makes a plain `SELECT ... LIMIT 1` sufficient here.
    pub fn claim(&self) -> Result<Option<ImageRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images
             WHERE state NOT IN ('ACTIVE', 'FAILED')
             ORDER BY id LIMIT 1"
        ))?;

        stmt.query_row([], row_to_image)
            .optional()
            .map_err(Into::into)
    }

    /// Commit a new state and refresh `updated_at`. Clears any recorded
    /// error text from a previous failed run of the same row.
    pub fn set_state(&self, id: i64, state: ImageState) -> Result<(), CatalogError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE images SET state = ?1, last_error = NULL, updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), now(), id],
        )?;
        Ok(())
    }

    /// Mark an image as terminally failed, preserving the error text for
    /// operators.
    pub fn set_failed(&self, id: i64, error: &str) -> Result<(), CatalogError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE images SET state = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![ImageState::Failed.as_str(), error, now(), id],
        )?;
        Ok(())
    }

    /// Number of image rows.
    pub fn count(&self) -> Result<i64, CatalogError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Record that an image references a blob; idempotent on duplicates.
    pub fn mark_blob_used(
        &self,
        image_id: i64,
        path: &str,
        checksum: &str,
    ) -> Result<(), CatalogError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO blobs(image_id, path, checksum) VALUES (?1, ?2, ?3)",
            params![image_id, path, checksum],
        )?;
        Ok(())
    }

    /// Checksums referenced by no image, or only by FAILED images. A
    /// checksum with any non-FAILED referent is never reported, which keeps
    /// cleanup away from anything the worker could still be processing.
    pub fn unused_blob_checksums(&self) -> Result<Vec<String>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT b.checksum FROM blobs b
            WHERE NOT EXISTS (
                SELECT 1 FROM blobs b2
                JOIN images i ON i.id = b2.image_id
                WHERE b2.checksum = b.checksum AND i.state != 'FAILED'
            )
            "#,
        )?;

        let checksums = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(checksums)
    }

    /// Remove all blob rows for a checksum.
    pub fn delete_blob_rows(&self, checksum: &str) -> Result<(), CatalogError> {
        let conn = self.lock();
        conn.execute("DELETE FROM blobs WHERE checksum = ?1", params![checksum])?;
        Ok(())
    }
}

fn row_to_image(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImageRecord> {
    let state_str: String = row.get(4)?;
    let state = ImageState::parse(&state_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ImageRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        blob_url: row.get(2)?,
        checksum: row.get(3)?,
        state,
        last_error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
