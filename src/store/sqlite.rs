//! SQLite namespace backend.
//!
//! Two tables: a tile index keyed by `(zoom, x, y)` and an image table keyed
//! by content digest. Tiles with identical bytes (sea, blank land) share one
//! image row; rows no tile points at are deleted in the same transaction that
//! orphaned them.

use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::StoreError;
use crate::tile::{TileAddress, TileEntry};

use super::codec::{content_digest, from_millis, to_millis};
use super::{BackendKind, NamespaceBackend};

pub(crate) const SQLITE_FILE: &str = "tiles.sqlite";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS images (
        id INTEGER PRIMARY KEY,
        digest TEXT NOT NULL UNIQUE,
        data BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS tiles (
        zoom INTEGER NOT NULL,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        image_id INTEGER NOT NULL REFERENCES images(id),
        downloaded INTEGER NOT NULL,
        last_modified INTEGER,
        expires INTEGER NOT NULL,
        etag TEXT,
        PRIMARY KEY (zoom, x, y)
    );
    CREATE INDEX IF NOT EXISTS tiles_by_image ON tiles(image_id);
"#;

pub(crate) struct SqliteNamespace {
    name: String,
    conn: Mutex<Connection>,
}

impl SqliteNamespace {
    pub fn open(name: &str, dir: &Path) -> Result<Self, StoreError> {
        let open_err = |e: rusqlite::Error| StoreError::Open {
            namespace: name.to_string(),
            message: e.to_string(),
        };

        let path = dir.join(SQLITE_FILE);
        let conn = Connection::open(&path).map_err(open_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(open_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(open_err)?;
        conn.execute_batch(SCHEMA).map_err(open_err)?;

        debug!(namespace = name, path = %path.display(), "Opened SQLite namespace");

        Ok(Self {
            name: name.to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn backend_err(&self, e: rusqlite::Error) -> StoreError {
        StoreError::Backend {
            namespace: self.name.clone(),
            message: e.to_string(),
        }
    }

    fn corrupt(&self, address: TileAddress, what: &str) -> StoreError {
        StoreError::Corrupt {
            namespace: self.name.clone(),
            message: format!("{}: invalid {}", address, what),
        }
    }

    /// Number of distinct image payloads.
    #[cfg(test)]
    pub(crate) fn image_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| self.backend_err(e))
    }
}

impl NamespaceBackend for SqliteNamespace {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn put(&self, entry: &TileEntry) -> Result<(), StoreError> {
        let address = entry.address;
        let digest = content_digest(&entry.data);

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.backend_err(e))?;

        let previous: Option<i64> = tx
            .query_row(
                "SELECT image_id FROM tiles WHERE zoom = ?1 AND x = ?2 AND y = ?3",
                params![address.zoom, address.x, address.y],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| self.backend_err(e))?;

        tx.execute(
            "INSERT INTO images (digest, data) VALUES (?1, ?2) ON CONFLICT(digest) DO NOTHING",
            params![digest, &entry.data[..]],
        )
        .map_err(|e| self.backend_err(e))?;
        let image_id: i64 = tx
            .query_row(
                "SELECT id FROM images WHERE digest = ?1",
                params![digest],
                |row| row.get(0),
            )
            .map_err(|e| self.backend_err(e))?;

        tx.execute(
            "INSERT INTO tiles (zoom, x, y, image_id, downloaded, last_modified, expires, etag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(zoom, x, y) DO UPDATE SET
                image_id = excluded.image_id,
                downloaded = excluded.downloaded,
                last_modified = excluded.last_modified,
                expires = excluded.expires,
                etag = excluded.etag",
            params![
                address.zoom,
                address.x,
                address.y,
                image_id,
                to_millis(entry.time_downloaded),
                entry.time_last_modified.map(to_millis),
                to_millis(entry.time_expires),
                entry.etag,
            ],
        )
        .map_err(|e| self.backend_err(e))?;

        if let Some(old) = previous.filter(|old| *old != image_id) {
            tx.execute(
                "DELETE FROM images WHERE id = ?1
                 AND NOT EXISTS (SELECT 1 FROM tiles WHERE image_id = ?1)",
                params![old],
            )
            .map_err(|e| self.backend_err(e))?;
        }

        tx.commit().map_err(|e| self.backend_err(e))
    }

    fn get(&self, address: TileAddress) -> Result<Option<TileEntry>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT t.downloaded, t.last_modified, t.expires, t.etag, i.data
                 FROM tiles t JOIN images i ON i.id = t.image_id
                 WHERE t.zoom = ?1 AND t.x = ?2 AND t.y = ?3",
                params![address.zoom, address.x, address.y],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| self.backend_err(e))?;

        let Some((downloaded, last_modified, expires, etag, data)) = row else {
            return Ok(None);
        };

        let downloaded = from_millis(downloaded).ok_or_else(|| self.corrupt(address, "download time"))?;
        let expires = from_millis(expires).ok_or_else(|| self.corrupt(address, "expiry time"))?;
        let last_modified = match last_modified {
            Some(ms) => Some(from_millis(ms).ok_or_else(|| self.corrupt(address, "modification time"))?),
            None => None,
        };

        Ok(Some(
            TileEntry::new(address, Bytes::from(data), downloaded, expires)
                .with_last_modified(last_modified)
                .with_etag(etag),
        ))
    }

    fn contains(&self, address: TileAddress) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM tiles WHERE zoom = ?1 AND x = ?2 AND y = ?3",
            params![address.zoom, address.x, address.y],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(|e| self.backend_err(e))
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| self.backend_err(e))?;
        tx.execute_batch("DELETE FROM tiles; DELETE FROM images;")
            .map_err(|e| self.backend_err(e))?;
        tx.commit().map_err(|e| self.backend_err(e))
    }

    fn tile_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM tiles", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| self.backend_err(e))
    }

    fn flush(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|e| self.backend_err(e))
    }
}
