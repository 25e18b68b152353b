//! Store registry: namespace lifecycle, root lock and size diagnostics.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::tile::{TileAddress, TileEntry};

use super::{open_backend, NamespaceBackend, StoreConfig, StoreStatistics};

/// Lock file guarding a store root against a second process.
pub const LOCK_FILE: &str = ".tilestore.lock";

const MAX_NAME_LEN: usize = 128;

type Handle = Arc<dyn NamespaceBackend>;

// =============================================================================
// TileStore
// =============================================================================

/// Registry of per-origin namespaces under one store root.
///
/// The registry:
/// - Holds an exclusive lock file on the root for its whole lifetime
/// - Opens namespaces lazily, at most one handle per namespace
/// - Closes (after flushing) the least recently used namespace when more than
///   `max_open` would be open
/// - Discards a namespace handle after a backend or corruption error so the
///   next access rebuilds it
///
/// There is no process-wide instance; create one and share it behind an `Arc`.
pub struct TileStore {
    config: StoreConfig,
    open: Mutex<LruCache<String, Handle>>,
    _lock: File,
}

impl std::fmt::Debug for TileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TileStore {
    /// Open (creating if needed) the store root and take its lock.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let capacity = NonZeroUsize::new(config.max_open).ok_or_else(|| StoreError::Open {
            namespace: String::new(),
            message: "max_open must be at least 1".to_string(),
        })?;

        fs::create_dir_all(&config.root)?;
        let lock_path = config.root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        match lock.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(StoreError::Locked {
                    root: config.root.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            root = %config.root.display(),
            backend = %config.backend,
            max_open = config.max_open,
            "Opened tile store"
        );

        Ok(Self {
            config,
            open: Mutex::new(LruCache::new(capacity)),
            _lock: lock,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    // -------------------------------------------------------------------------
    // Tile operations
    // -------------------------------------------------------------------------

    /// Write `entry` into the origin's namespace, replacing any previous entry.
    pub fn put(&self, origin: &str, entry: &TileEntry) -> Result<(), StoreError> {
        let handle = self.handle(origin, true)?.ok_or_else(|| missing(origin))?;
        self.guard(origin, &handle, handle.put(entry))
    }

    pub fn get(&self, origin: &str, address: TileAddress) -> Result<Option<TileEntry>, StoreError> {
        let Some(handle) = self.handle(origin, false)? else {
            return Ok(None);
        };
        self.guard(origin, &handle, handle.get(address))
    }

    pub fn contains(&self, origin: &str, address: TileAddress) -> Result<bool, StoreError> {
        let Some(handle) = self.handle(origin, false)? else {
            return Ok(false);
        };
        self.guard(origin, &handle, handle.contains(address))
    }

    /// Remove every entry of the namespace. Clearing an absent or empty
    /// namespace is a no-op.
    pub fn clear(&self, origin: &str) -> Result<(), StoreError> {
        let Some(handle) = self.handle(origin, false)? else {
            return Ok(());
        };
        self.guard(origin, &handle, handle.clear())?;
        info!(namespace = origin, "Cleared namespace");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    /// Names of all namespaces present under the root, sorted.
    pub fn list_store_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Bytes used on disk and number of tiles stored for one namespace.
    pub fn estimate_size(&self, origin: &str) -> Result<StoreStatistics, StoreError> {
        let Some(handle) = self.handle(origin, false)? else {
            return Ok(StoreStatistics::default());
        };
        let tile_count = self.guard(origin, &handle, handle.tile_count())?;
        let bytes_on_disk = dir_size(&self.namespace_dir(origin))?;
        Ok(StoreStatistics {
            bytes_on_disk,
            tile_count,
        })
    }

    /// Size report for every namespace under the root.
    pub fn statistics(&self) -> Result<Vec<(String, StoreStatistics)>, StoreError> {
        self.list_store_names()?
            .into_iter()
            .map(|name| {
                let stats = self.estimate_size(&name)?;
                Ok((name, stats))
            })
            .collect()
    }

    /// Number of namespaces currently holding an open handle.
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_open(&self, origin: &str) -> bool {
        self.open.lock().contains(origin)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Flush and close every open namespace, oldest first.
    pub fn close_all(&self) -> Result<(), StoreError> {
        let mut open = self.open.lock();
        let mut first_error = None;
        while let Some((name, handle)) = open.pop_lru() {
            if let Err(e) = handle.flush() {
                warn!(namespace = %name, error = %e, "Failed to flush namespace on close");
                first_error.get_or_insert(e);
            } else {
                debug!(namespace = %name, "Closed namespace");
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn namespace_dir(&self, name: &str) -> PathBuf {
        self.config.root.join(name)
    }

    /// Look up or open a namespace handle.
    ///
    /// With `create == false` a namespace that does not exist on disk yields
    /// `None` instead of being created.
    fn handle(&self, name: &str, create: bool) -> Result<Option<Handle>, StoreError> {
        validate_name(name)?;

        let mut open = self.open.lock();
        if let Some(handle) = open.get(name) {
            return Ok(Some(handle.clone()));
        }

        let dir = self.namespace_dir(name);
        if !create && !dir.is_dir() {
            return Ok(None);
        }

        if open.len() >= self.config.max_open {
            if let Some((evicted, handle)) = open.pop_lru() {
                if let Err(e) = handle.flush() {
                    warn!(namespace = %evicted, error = %e, "Failed to flush evicted namespace");
                }
                debug!(namespace = %evicted, "Closed least recently used namespace");
            }
        }

        let handle: Handle = Arc::from(open_backend(&self.config, name, &dir)?);
        info!(namespace = name, backend = %handle.kind(), "Opened namespace");
        open.put(name.to_string(), handle.clone());
        Ok(Some(handle))
    }

    /// Drop the cached handle if `result` says it can no longer be trusted.
    fn guard<T>(
        &self,
        name: &str,
        handle: &Handle,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if let Err(e) = &result {
            if e.poisons_namespace() {
                let mut open = self.open.lock();
                if open.peek(name).is_some_and(|h| Arc::ptr_eq(h, handle)) {
                    open.pop(name);
                    warn!(namespace = name, error = %e, "Discarded namespace handle after storage fault");
                }
            }
        }
        result
    }
}

impl Drop for TileStore {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            warn!(error = %e, "Tile store closed with errors");
        }
    }
}

fn missing(name: &str) -> StoreError {
    StoreError::Open {
        namespace: name.to_string(),
        message: "namespace could not be created".to_string(),
    }
}

/// Namespace names become directory names.
fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

fn dir_size(dir: &Path) -> Result<u64, StoreError> {
    let mut total = 0;
    if !dir.is_dir() {
        return Ok(0);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        total += if metadata.is_dir() {
            dir_size(&entry.path())?
        } else {
            metadata.len()
        };
    }
    Ok(total)
}
