//! Bounded in-memory tile cache.

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::tile::{Tile, TileAddress, TileKey};

/// Default number of tiles kept in memory.
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 500;

/// Outcome of [`MemoryTileCache::claim`].
#[derive(Debug, Clone)]
pub enum Claim {
    /// The caller moved the tile `NEW → LOADING` and must finish it
    Won(Arc<Tile>),
    /// The tile was not `NEW`; someone else loads or already loaded it
    Lost(Arc<Tile>),
}

impl Claim {
    pub fn tile(&self) -> &Arc<Tile> {
        match self {
            Claim::Won(tile) | Claim::Lost(tile) => tile,
        }
    }

    pub fn is_won(&self) -> bool {
        matches!(self, Claim::Won(_))
    }
}

// =============================================================================
// Memory Tile Cache
// =============================================================================

/// Access-ordered map from `"{zoom}/{x}/{y}@{origin}"` to runtime tiles.
///
/// Inserting beyond capacity evicts the least recently used tile that is not
/// pinned (see [`Tile::is_pinned`]). When every other tile is pinned the map
/// runs over capacity until loads finish. Evicted tiles stay valid for
/// whoever still holds them; the cache only forgets them. Losing the cache
/// never loses data since the persistent store is the source of truth.
///
/// # Thread Safety
///
/// One mutex guards the map. Tile claims and reservations are taken under it
/// so that two jobs for the same key can never both win.
pub struct MemoryTileCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    tiles: LruCache<TileKey, Arc<Tile>>,
    capacity: NonZeroUsize,
}

impl CacheInner {
    fn get_or_insert(&mut self, key: &TileKey) -> Arc<Tile> {
        if let Some(tile) = self.tiles.get(key) {
            return tile.clone();
        }
        let tile = Arc::new(Tile::new(key.clone()));
        self.insert(tile.clone());
        tile
    }

    /// Insert `tile` and evict down to capacity, never evicting `tile` itself.
    fn insert(&mut self, tile: Arc<Tile>) -> Vec<Arc<Tile>> {
        let key = tile.key().clone();
        self.tiles.push(key.clone(), tile);
        self.evict_to(self.capacity.get(), Some(&key))
    }

    /// Drop least recently used unpinned tiles until at most `target` remain.
    fn evict_to(&mut self, target: usize, keep: Option<&TileKey>) -> Vec<Arc<Tile>> {
        let excess = self.tiles.len().saturating_sub(target);
        if excess == 0 {
            return Vec::new();
        }
        let victims: Vec<TileKey> = self
            .tiles
            .iter()
            .rev()
            .filter(|(key, tile)| Some(*key) != keep && !tile.is_pinned())
            .map(|(key, _)| key.clone())
            .take(excess)
            .collect();
        let evicted: Vec<Arc<Tile>> = victims
            .iter()
            .filter_map(|key| self.tiles.pop(key))
            .collect();
        for tile in &evicted {
            debug!(key = %tile.key(), "Evicted tile from memory cache");
        }
        if self.tiles.len() > target {
            debug!(
                len = self.tiles.len(),
                target,
                "Memory cache over capacity while loads are pending"
            );
        }
        evicted
    }
}

impl MemoryTileCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CACHE_CAPACITY)
    }

    /// A capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                tiles: LruCache::unbounded(),
                capacity: non_zero(capacity),
            }),
        }
    }

    /// Look up a tile, marking it most recently used.
    ///
    /// A loaded tile whose freshness window has passed is switched to
    /// `EXPIRED` here.
    pub fn get(&self, key: &TileKey) -> Option<Arc<Tile>> {
        let tile = self.inner.lock().tiles.get(key).cloned()?;
        tile.mark_expired_if_stale(Utc::now());
        Some(tile)
    }

    pub fn get_tile(&self, origin: &str, address: TileAddress) -> Option<Arc<Tile>> {
        self.get(&TileKey::new(origin, address))
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.inner.lock().tiles.peek(key).cloned()
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.inner.lock().tiles.contains(key)
    }

    /// Insert or replace a tile. Returns the first tile evicted to make room,
    /// if any.
    pub fn put(&self, tile: Arc<Tile>) -> Option<Arc<Tile>> {
        self.inner.lock().insert(tile).into_iter().next()
    }

    /// Fetch the tile for `key`, inserting a `NEW` one if absent.
    pub fn get_or_insert(&self, key: &TileKey) -> Arc<Tile> {
        self.inner.lock().get_or_insert(key)
    }

    /// Find-or-create the tile for `key` and pin it for a queued load.
    ///
    /// Every reservation must end in [`claim_reserved`](Self::claim_reserved)
    /// or [`release`](Self::release).
    pub fn reserve(&self, key: &TileKey) -> Arc<Tile> {
        let mut inner = self.inner.lock();
        let tile = inner.get_or_insert(key);
        tile.add_pending();
        tile
    }

    /// Drop a reservation without loading. The tile becomes evictable again
    /// on the next insert.
    pub fn release(&self, tile: &Tile) {
        tile.release_pending();
    }

    /// Atomically find-or-create the tile and try to move it `NEW → LOADING`.
    pub fn claim(&self, key: &TileKey) -> Claim {
        let tile = self.inner.lock().get_or_insert(key);
        try_claim(tile)
    }

    /// Turn a reservation into a claim.
    ///
    /// The tile currently cached under the key is the one claimed. A reserved
    /// tile that was removed explicitly is put back first.
    pub fn claim_reserved(&self, tile: &Arc<Tile>) -> Claim {
        let mut inner = self.inner.lock();
        tile.release_pending();
        let current = inner.tiles.get(tile.key()).cloned();
        let current = match current {
            Some(current) => current,
            None => {
                inner.insert(tile.clone());
                tile.clone()
            }
        };
        try_claim(current)
    }

    pub fn remove(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.inner.lock().tiles.pop(key)
    }

    pub fn clear(&self) {
        self.inner.lock().tiles.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tiles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity.get()
    }

    /// Change the bound; shrinking evicts least recently used tiles at once.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = non_zero(capacity);
        let target = inner.capacity.get();
        inner.evict_to(target, None);
    }

    /// Drop least recently used tiles down to half the capacity.
    pub fn trim(&self) -> usize {
        let target = self.capacity() / 2;
        self.trim_to(target)
    }

    /// Drop least recently used tiles until at most `target` remain.
    ///
    /// Pinned tiles are kept so an in-flight claim stays visible to later
    /// requests. Returns the number of tiles dropped.
    pub fn trim_to(&self, target: usize) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.evict_to(target, None).len();
        if dropped > 0 {
            debug!(dropped, remaining = inner.tiles.len(), "Trimmed memory cache");
        }
        dropped
    }

    /// Snapshot of the tiles at `keys` that are present, without touching recency.
    pub(crate) fn peek_many(&self, keys: &[TileKey]) -> Vec<Option<Arc<Tile>>> {
        let inner = self.inner.lock();
        keys.iter().map(|key| inner.tiles.peek(key).cloned()).collect()
    }
}

impl Default for MemoryTileCache {
    fn default() -> Self {
        Self::new()
    }
}

fn try_claim(tile: Arc<Tile>) -> Claim {
    if tile.try_claim() {
        Claim::Won(tile)
    } else {
        Claim::Lost(tile)
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

// =============================================================================
// Tests
// =============================================================================
