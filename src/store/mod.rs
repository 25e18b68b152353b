//! Persistent tile store.
//!
//! One isolated namespace per origin, each living in its own directory under
//! the store root. A namespace is backed by one of two embedded engines:
//!
//! - [`BackendKind::Lmdb`]: transactional key-value engine (heed); one record per tile
//! - [`BackendKind::Sqlite`]: relational engine (rusqlite); a tile index pointing
//!   at de-duplicated image blobs
//!
//! ```text
//! store root/
//! ├── .tilestore.lock        exclusive process lock
//! ├── osm/
//! │   └── data.mdb           (lmdb)
//! └── topo/
//!     └── tiles.sqlite       (sqlite)
//! ```
//!
//! The [`TileStore`] registry keeps at most `max_open` namespaces open and
//! closes the least recently used one when it needs room.

mod codec;
mod lmdb;
mod registry;
mod sqlite;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::StoreError;
use crate::tile::{TileAddress, TileEntry};

pub use registry::TileStore;

pub(crate) use lmdb::LmdbNamespace;
pub(crate) use sqlite::SqliteNamespace;

/// Default maximum number of simultaneously open namespaces.
pub const DEFAULT_MAX_OPEN_NAMESPACES: usize = 5;

/// Default LMDB map size (1 GiB).
pub const DEFAULT_LMDB_MAP_SIZE: usize = 1024 * 1024 * 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Embedded engine backing each namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Lmdb,
    Sqlite,
}

impl BackendKind {
    pub const fn name(&self) -> &'static str {
        match self {
            BackendKind::Lmdb => "lmdb",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lmdb" | "kv" => Ok(BackendKind::Lmdb),
            "sqlite" | "sql" => Ok(BackendKind::Sqlite),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

/// Settings for a [`TileStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub backend: BackendKind,
    /// Namespaces kept open at once; the least recently used is closed first.
    pub max_open: usize,
    /// LMDB memory map size in bytes. Ignored by the SQLite backend.
    pub lmdb_map_size: usize,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backend: BackendKind::default(),
            max_open: DEFAULT_MAX_OPEN_NAMESPACES,
            lmdb_map_size: DEFAULT_LMDB_MAP_SIZE,
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_max_open(mut self, max_open: usize) -> Self {
        self.max_open = max_open;
        self
    }

    pub fn with_lmdb_map_size(mut self, bytes: usize) -> Self {
        self.lmdb_map_size = bytes;
        self
    }
}

/// Read-only size report for one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStatistics {
    pub bytes_on_disk: u64,
    pub tile_count: u64,
}

// =============================================================================
// Backend Trait
// =============================================================================

/// One open namespace on a concrete engine.
///
/// Implementations serialise their own writes; every `put` replaces the whole
/// entry in a single transaction.
pub(crate) trait NamespaceBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn put(&self, entry: &TileEntry) -> Result<(), StoreError>;

    fn get(&self, address: TileAddress) -> Result<Option<TileEntry>, StoreError>;

    fn contains(&self, address: TileAddress) -> Result<bool, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    fn tile_count(&self) -> Result<u64, StoreError>;

    /// Push committed data to disk before the handle is dropped.
    fn flush(&self) -> Result<(), StoreError>;
}

/// Open a namespace directory with the configured engine, creating its schema.
pub(crate) fn open_backend(
    config: &StoreConfig,
    name: &str,
    dir: &Path,
) -> Result<Box<dyn NamespaceBackend>, StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::Open {
        namespace: name.to_string(),
        message: e.to_string(),
    })?;
    Ok(match config.backend {
        BackendKind::Lmdb => Box::new(LmdbNamespace::open(name, dir, config.lmdb_map_size)?),
        BackendKind::Sqlite => Box::new(SqliteNamespace::open(name, dir)?),
    })
}
