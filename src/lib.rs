//! # atlas-tiles
//!
//! Tile acquisition and caching core for offline map atlases.
//!
//! This library fetches map tiles from remote or local origins, validates
//! them, keeps them in a persistent per-origin store and serves them from a
//! bounded memory cache. Expired tiles are revalidated with HEAD requests or
//! conditional GETs so unchanged tiles are never downloaded twice.
//!
//! ## Features
//!
//! - **Persistent store**: one LMDB or SQLite namespace per origin, with a bounded set of open handles
//! - **Revalidation**: ETag, Last-Modified, If-None-Match and If-Modified-Since strategies
//! - **Expiry**: `Cache-Control: max-age` and `Expires` clamped to configurable bounds
//! - **Memory cache**: LRU of runtime tiles with placeholders synthesized from nearby zoom levels
//! - **Dispatcher**: elastic worker pool with cancellation that never interrupts store I/O
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`tile`] - Tile addresses, persisted entries and runtime tile state
//! - [`origin`] - Origin provider traits, HTTP and local archive origins
//! - [`store`] - Persistent tile store and its backends
//! - [`download`] - Download/update engine, response validation and expiry
//! - [`cache`] - Memory tile cache and placeholder synthesis
//! - [`dispatch`] - Job dispatcher, tile load jobs and the tile loader
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use atlas_tiles::{
//!     DispatcherConfig, HttpOrigin, JobDispatcher, LoadOutcome, MemoryTileCache, StoreConfig,
//!     Tile, TileAddress, TileDownloader, TileLoader, TileStore,
//! };
//!
//! let store = Arc::new(TileStore::open(StoreConfig::new("./tilestore")).unwrap());
//! let downloader = Arc::new(TileDownloader::new(store));
//! let cache = Arc::new(MemoryTileCache::new());
//! let dispatcher = Arc::new(JobDispatcher::new(DispatcherConfig::default()));
//! let loader = TileLoader::new(cache, downloader, dispatcher);
//!
//! let origin = Arc::new(
//!     HttpOrigin::new("osm", "https://tile.example.org/{z}/{x}/{y}.png").unwrap(),
//! );
//! let listener = Arc::new(|tile: &Arc<Tile>, outcome: &LoadOutcome| {
//!     println!("{} finished: {:?}", tile.key(), outcome);
//! });
//! let tile = loader
//!     .request(origin, TileAddress::new(5, 3, 2), listener)
//!     .unwrap();
//! println!("{} is {:?}", tile.key(), tile.state());
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod origin;
pub mod store;
pub mod tile;

// Re-export commonly used types
pub use cache::{error_image, Claim, MemoryTileCache, DEFAULT_MEMORY_CACHE_CAPACITY};
pub use config::{ClearConfig, Cli, Command, CommonConfig, FetchConfig, StatsConfig};
pub use dispatch::{
    DispatcherConfig, Job, JobDispatcher, LoadOutcome, TileLoadJob, TileLoadListener, TileLoader,
    WorkerContext,
};
pub use download::{
    validate_response, DataSource, DownloadSettings, ExpirationPolicy, LoadMode, TileData,
    TileDownloader,
};
pub use error::{DispatchError, DownloadError, FailureClass, ProtocolViolation, StoreError};
pub use origin::{
    format_http_date, parse_http_date, HttpOrigin, LocalArchiveOrigin, OriginConnection,
    OriginProvider, OriginRequest, OriginResponse, UpdateStrategy,
};
pub use store::{BackendKind, StoreConfig, StoreStatistics, TileStore};
pub use tile::{Tile, TileAddress, TileEntry, TileKey, TileState, MAX_ZOOM};
