//! Entry point for callers that want tiles: memory lookup plus job submission.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::cache::MemoryTileCache;
use crate::download::{LoadMode, TileDownloader};
use crate::error::DispatchError;
use crate::origin::OriginProvider;
use crate::tile::{Tile, TileAddress, TileKey};

use super::job::{TileLoadJob, TileLoadListener};
use super::pool::JobDispatcher;

/// Ties the memory cache, the download engine and the dispatcher together.
///
/// Every request returns the runtime tile at once; its data, placeholder or
/// error image can be drawn while the job runs. The listener hears about the
/// result exactly once.
pub struct TileLoader {
    cache: Arc<MemoryTileCache>,
    downloader: Arc<TileDownloader>,
    dispatcher: Arc<JobDispatcher>,
}

impl TileLoader {
    pub fn new(
        cache: Arc<MemoryTileCache>,
        downloader: Arc<TileDownloader>,
        dispatcher: Arc<JobDispatcher>,
    ) -> Self {
        Self {
            cache,
            downloader,
            dispatcher,
        }
    }

    pub fn cache(&self) -> &Arc<MemoryTileCache> {
        &self.cache
    }

    pub fn downloader(&self) -> &Arc<TileDownloader> {
        &self.downloader
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    /// Request a tile. Expired tiles are queued for revalidation; failed
    /// tiles stay failed until [`reload`](Self::reload).
    pub fn request(
        &self,
        origin: Arc<dyn OriginProvider>,
        address: TileAddress,
        listener: Arc<dyn TileLoadListener>,
    ) -> Result<Arc<Tile>, DispatchError> {
        let job = self.job(origin, address, listener, LoadMode::StoreThenOrigin);
        let tile = job.tile().clone();
        tile.mark_expired_if_stale(Utc::now());
        if tile.reset_expired() {
            debug!(key = %tile.key(), "Revalidating expired tile");
        }
        self.submit(job)?;
        Ok(tile)
    }

    /// Retry a failed or expired tile.
    pub fn reload(
        &self,
        origin: Arc<dyn OriginProvider>,
        address: TileAddress,
        listener: Arc<dyn TileLoadListener>,
    ) -> Result<Arc<Tile>, DispatchError> {
        self.submit_reload(origin, address, listener, LoadMode::StoreThenOrigin)
    }

    /// Fetch a tile from the origin even if the store holds a fresh copy.
    /// A tile that is already loaded in memory is left alone.
    pub fn force_reload(
        &self,
        origin: Arc<dyn OriginProvider>,
        address: TileAddress,
        listener: Arc<dyn TileLoadListener>,
    ) -> Result<Arc<Tile>, DispatchError> {
        self.submit_reload(origin, address, listener, LoadMode::OriginOnly)
    }

    /// Drop queued jobs; running jobs finish normally.
    pub fn cancel_outstanding(&self) -> usize {
        self.dispatcher.cancel_outstanding_jobs()
    }

    fn submit_reload(
        &self,
        origin: Arc<dyn OriginProvider>,
        address: TileAddress,
        listener: Arc<dyn TileLoadListener>,
        mode: LoadMode,
    ) -> Result<Arc<Tile>, DispatchError> {
        let job = self.job(origin, address, listener, mode);
        let tile = job.tile().clone();
        tile.mark_expired_if_stale(Utc::now());
        tile.reset_for_reload();
        self.submit(job)?;
        Ok(tile)
    }

    /// Build a job; this reserves the tile so it stays cached until the job runs.
    fn job(
        &self,
        origin: Arc<dyn OriginProvider>,
        address: TileAddress,
        listener: Arc<dyn TileLoadListener>,
        mode: LoadMode,
    ) -> TileLoadJob {
        let key = TileKey::new(origin.name(), address);
        TileLoadJob::new(
            key,
            origin,
            self.cache.clone(),
            self.downloader.clone(),
            listener,
        )
        .with_mode(mode)
    }

    fn submit(&self, job: TileLoadJob) -> Result<(), DispatchError> {
        debug!(key = %job.key(), mode = ?job.mode(), "Queueing tile load");
        self.dispatcher.submit(job)
    }
}
