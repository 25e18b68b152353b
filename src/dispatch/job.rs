//! Per-tile load job and the listener it reports to.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{error_image, Claim, MemoryTileCache};
use crate::download::{DataSource, LoadMode, TileData, TileDownloader};
use crate::error::{DownloadError, ProtocolViolation};
use crate::origin::OriginProvider;
use crate::tile::{Tile, TileKey};

use super::pool::Job;
use super::worker::WorkerContext;

/// How a tile load job ended, as seen by its listener.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    /// Served from the persistent store
    FromStore,
    /// Fetched or revalidated against the origin
    Downloaded,
    /// Another job had already loaded the tile
    AlreadyLoaded,
    /// Load failed; the tile is `ERROR` with the error image attached
    Failed(DownloadError),
    /// The job was interrupted; the tile is back to `NEW`
    Interrupted,
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            LoadOutcome::FromStore | LoadOutcome::Downloaded | LoadOutcome::AlreadyLoaded
        )
    }

    fn from_source(source: DataSource) -> Self {
        match source {
            DataSource::Store => LoadOutcome::FromStore,
            DataSource::Downloaded | DataSource::Revalidated => LoadOutcome::Downloaded,
        }
    }
}

/// Callback invoked exactly once per job, on the worker thread.
pub trait TileLoadListener: Send + Sync {
    fn tile_load_finished(&self, tile: &Arc<Tile>, outcome: &LoadOutcome);
}

impl<F> TileLoadListener for F
where
    F: Fn(&Arc<Tile>, &LoadOutcome) + Send + Sync,
{
    fn tile_load_finished(&self, tile: &Arc<Tile>, outcome: &LoadOutcome) {
        self(tile, outcome)
    }
}

// =============================================================================
// Tile Load Job
// =============================================================================

/// Loads one tile through memory cache, store and origin.
///
/// Creating the job reserves its tile in the memory cache, which pins it
/// until the job runs or is dropped unrun.
///
/// 1. Claims the tile in the memory cache; if another job owns it, the
///    listener is parked on the tile and notified when that job finishes
/// 2. Attaches a cross-zoom placeholder
/// 3. Tries the store alone, then the full engine flow
/// 4. Moves the tile to its terminal state and notifies every listener
pub struct TileLoadJob {
    key: TileKey,
    tile: Arc<Tile>,
    reserved: bool,
    origin: Arc<dyn OriginProvider>,
    cache: Arc<MemoryTileCache>,
    downloader: Arc<TileDownloader>,
    listener: Arc<dyn TileLoadListener>,
    mode: LoadMode,
}

impl TileLoadJob {
    pub fn new(
        key: TileKey,
        origin: Arc<dyn OriginProvider>,
        cache: Arc<MemoryTileCache>,
        downloader: Arc<TileDownloader>,
        listener: Arc<dyn TileLoadListener>,
    ) -> Self {
        let tile = cache.reserve(&key);
        Self {
            key,
            tile,
            reserved: true,
            origin,
            cache,
            downloader,
            listener,
            mode: LoadMode::StoreThenOrigin,
        }
    }

    /// Use [`LoadMode::OriginOnly`] to bypass stored entries.
    pub fn with_mode(mut self, mode: LoadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    /// The runtime tile this job loads.
    pub fn tile(&self) -> &Arc<Tile> {
        &self.tile
    }

    /// Execute the job on the current thread.
    pub fn execute(mut self, ctx: &WorkerContext) -> LoadOutcome {
        self.reserved = false;
        let tile = match self.cache.claim_reserved(&self.tile) {
            Claim::Won(tile) => tile,
            Claim::Lost(tile) => {
                debug!(key = %self.key, state = ?tile.state(), "Tile owned elsewhere");
                return match tile.park_listener(self.listener.clone()) {
                    Some((listener, outcome)) => {
                        listener.tile_load_finished(&tile, &outcome);
                        outcome
                    }
                    // Reported by the owning job.
                    None => LoadOutcome::AlreadyLoaded,
                };
            }
        };

        self.cache.attach_placeholder(&tile);

        let result = self.load(ctx);
        let (outcome, waiting) = match result {
            Ok(data) => {
                let outcome = LoadOutcome::from_source(data.source);
                (outcome, tile.finish_loaded(data.entry))
            }
            Err(DownloadError::Interrupted) => {
                debug!(key = %self.key, "Tile load interrupted");
                (LoadOutcome::Interrupted, tile.finish_interrupted())
            }
            Err(e) => {
                warn!(
                    key = %self.key,
                    reason = e.reason_code(),
                    error = %e,
                    "Tile load failed"
                );
                let waiting = tile.finish_failed(e.clone(), error_image());
                (LoadOutcome::Failed(e), waiting)
            }
        };

        self.listener.tile_load_finished(&tile, &outcome);
        for listener in waiting {
            listener.tile_load_finished(&tile, &outcome);
        }
        outcome
    }

    fn load(&self, ctx: &WorkerContext) -> Result<TileData, DownloadError> {
        let origin = self.origin.as_ref();
        let address = self.key.address;

        if self.mode != LoadMode::OriginOnly {
            if let Some(data) = self
                .downloader
                .load(origin, address, LoadMode::StoreOnly, ctx)?
            {
                return Ok(data);
            }
        }

        self.downloader
            .load(origin, address, self.mode, ctx)?
            .ok_or(DownloadError::Protocol(ProtocolViolation::NoSource))
    }
}

impl Drop for TileLoadJob {
    fn drop(&mut self) {
        if self.reserved {
            self.cache.release(&self.tile);
        }
    }
}

impl Job for TileLoadJob {
    fn run(self: Box<Self>, ctx: &WorkerContext) {
        self.execute(ctx);
    }
}
