//! Configuration management for atlas-tiles.
//!
//! This module provides the command-line interface and its conversion into
//! component configurations:
//! - Command-line arguments via clap
//! - Environment variables with `ATLAS_` prefix
//! - Defaults for every optional setting
//!
//! # Environment Variables
//!
//! - `ATLAS_STORE_ROOT` - Persistent store directory (default: ./tilestore)
//! - `ATLAS_STORE_BACKEND` - `lmdb` or `sqlite` (default: lmdb)
//! - `ATLAS_MAX_OPEN_STORES` - Namespaces kept open at once (default: 5)
//! - `ATLAS_LMDB_MAP_SIZE_MB` - LMDB map size in MiB (default: 1024)
//! - `ATLAS_ORIGIN_NAME` - Origin name, also the store namespace
//! - `ATLAS_ORIGIN_URL` - Tile URL template with `{z}`, `{x}`, `{y}`
//! - `ATLAS_ORIGIN_ARCHIVE` - Local `{z}/{x}/{y}.png` tile directory
//! - `ATLAS_UPDATE_STRATEGY` - none, etag, last-modified, if-none-match, if-modified-since
//! - `ATLAS_EXPIRE_DEFAULT_DAYS` / `ATLAS_EXPIRE_MIN_DAYS` / `ATLAS_EXPIRE_MAX_DAYS`
//! - `ATLAS_CONNECT_TIMEOUT` / `ATLAS_READ_TIMEOUT` - Seconds (default: 10)
//! - `ATLAS_WORKERS_CORE` / `ATLAS_WORKERS_MAX` - Pool bounds (default: 2 / 16)
//! - `ATLAS_WORKER_KEEP_ALIVE` - Idle seconds before extra workers retire (default: 30)
//! - `ATLAS_MEMORY_CACHE` - Tiles kept in memory (default: 500)
//! - `ATLAS_USER_AGENT` - User-Agent sent to origins

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cache::DEFAULT_MEMORY_CACHE_CAPACITY;
use crate::dispatch::{DispatcherConfig, DEFAULT_CORE_WORKERS, DEFAULT_MAX_WORKERS};
use crate::download::{
    DownloadSettings, ExpirationPolicy, DEFAULT_EXPIRATION_DAYS, DEFAULT_USER_AGENT,
    MAX_EXPIRATION_DAYS, MIN_EXPIRATION_DAYS,
};
use crate::origin::{HttpOrigin, LocalArchiveOrigin, OriginProvider, UpdateStrategy};
use crate::store::{BackendKind, StoreConfig, DEFAULT_MAX_OPEN_NAMESPACES};
use crate::tile::{TileAddress, MAX_ZOOM};

// =============================================================================
// Default Values
// =============================================================================

/// Default persistent store directory.
pub const DEFAULT_STORE_ROOT: &str = "./tilestore";

/// Default LMDB map size in MiB.
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 1024;

/// Default connect and read timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default idle time in seconds before extra workers retire.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// Upper bound on tiles a single fetch may request.
pub const MAX_FETCH_TILES: u64 = 1 << 20;

// =============================================================================
// CLI Arguments
// =============================================================================

/// atlas-tiles - Tile acquisition and caching for offline map atlases.
#[derive(Parser, Debug, Clone)]
#[command(name = "atlas-tiles")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load a rectangle of tiles into the store.
    Fetch(FetchConfig),
    /// Print tile count and size on disk for every store.
    Stats(StatsConfig),
    /// Remove every tile from the named stores.
    Clear(ClearConfig),
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonConfig {
    /// Directory holding one store per origin.
    #[arg(long, default_value = DEFAULT_STORE_ROOT, env = "ATLAS_STORE_ROOT")]
    pub store_root: PathBuf,

    /// Embedded engine for new stores (lmdb or sqlite).
    #[arg(long, default_value = "lmdb", env = "ATLAS_STORE_BACKEND")]
    pub backend: BackendKind,

    /// Maximum number of stores kept open at once.
    #[arg(long, default_value_t = DEFAULT_MAX_OPEN_NAMESPACES, env = "ATLAS_MAX_OPEN_STORES")]
    pub max_open_stores: usize,

    /// LMDB map size in MiB.
    #[arg(long, default_value_t = DEFAULT_LMDB_MAP_SIZE_MB, env = "ATLAS_LMDB_MAP_SIZE_MB")]
    pub lmdb_map_size_mb: usize,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CommonConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_open_stores == 0 {
            return Err("max_open_stores must be greater than 0".to_string());
        }
        if self.lmdb_map_size_mb == 0 {
            return Err("lmdb_map_size_mb must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.store_root)
            .with_backend(self.backend)
            .with_max_open(self.max_open_stores)
            .with_lmdb_map_size(self.lmdb_map_size_mb * 1024 * 1024)
    }
}

// =============================================================================
// Fetch
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct FetchConfig {
    #[command(flatten)]
    pub common: CommonConfig,

    // =========================================================================
    // Origin
    // =========================================================================
    /// Origin name; tiles are stored in the namespace of the same name.
    #[arg(long, env = "ATLAS_ORIGIN_NAME")]
    pub origin: String,

    /// Tile URL template, e.g. `https://tile.example.org/{z}/{x}/{y}.png`.
    #[arg(long, env = "ATLAS_ORIGIN_URL", conflicts_with = "archive")]
    pub url: Option<String>,

    /// Local tile directory laid out as `{z}/{x}/{y}.{png,jpg,...}`.
    #[arg(long, env = "ATLAS_ORIGIN_ARCHIVE")]
    pub archive: Option<PathBuf>,

    /// How expired tiles are revalidated. Defaults to `none` for URLs and
    /// `last-modified` for archives.
    #[arg(long, env = "ATLAS_UPDATE_STRATEGY")]
    pub update_strategy: Option<UpdateStrategy>,

    // =========================================================================
    // Area
    // =========================================================================
    /// Zoom level to fetch.
    #[arg(long, short)]
    pub zoom: u8,

    #[arg(long)]
    pub min_x: u32,

    #[arg(long)]
    pub max_x: u32,

    #[arg(long)]
    pub min_y: u32,

    #[arg(long)]
    pub max_y: u32,

    /// Fetch from the origin even when the store has a fresh copy.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    // =========================================================================
    // Expiration
    // =========================================================================
    /// Lifetime used when the origin sends no caching headers.
    #[arg(long, default_value_t = DEFAULT_EXPIRATION_DAYS, env = "ATLAS_EXPIRE_DEFAULT_DAYS")]
    pub expire_default_days: i64,

    /// Lower bound on any computed lifetime.
    #[arg(long, default_value_t = MIN_EXPIRATION_DAYS, env = "ATLAS_EXPIRE_MIN_DAYS")]
    pub expire_min_days: i64,

    /// Upper bound on any computed lifetime.
    #[arg(long, default_value_t = MAX_EXPIRATION_DAYS, env = "ATLAS_EXPIRE_MAX_DAYS")]
    pub expire_max_days: i64,

    // =========================================================================
    // Network
    // =========================================================================
    /// Connect timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, env = "ATLAS_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Read timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, env = "ATLAS_READ_TIMEOUT")]
    pub read_timeout: u64,

    #[arg(long, default_value = DEFAULT_USER_AGENT, env = "ATLAS_USER_AGENT")]
    pub user_agent: String,

    // =========================================================================
    // Workers and Memory
    // =========================================================================
    /// Workers kept alive while idle.
    #[arg(long, default_value_t = DEFAULT_CORE_WORKERS, env = "ATLAS_WORKERS_CORE")]
    pub workers_core: usize,

    /// Maximum concurrent workers.
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS, env = "ATLAS_WORKERS_MAX")]
    pub workers_max: usize,

    /// Seconds an extra idle worker waits before exiting.
    #[arg(long, default_value_t = DEFAULT_KEEP_ALIVE_SECS, env = "ATLAS_WORKER_KEEP_ALIVE")]
    pub worker_keep_alive: u64,

    /// Tiles kept in the memory cache.
    #[arg(long, default_value_t = DEFAULT_MEMORY_CACHE_CAPACITY, env = "ATLAS_MEMORY_CACHE")]
    pub memory_cache: usize,
}

impl FetchConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.common.validate()?;

        if self.origin.trim().is_empty() {
            return Err("Origin name is required. Set --origin or ATLAS_ORIGIN_NAME".to_string());
        }
        match (&self.url, &self.archive) {
            (None, None) => {
                return Err(
                    "No tile source. Set --url (ATLAS_ORIGIN_URL) or --archive (ATLAS_ORIGIN_ARCHIVE)"
                        .to_string(),
                )
            }
            (Some(_), Some(_)) => return Err("--url and --archive are mutually exclusive".to_string()),
            _ => {}
        }

        if self.zoom > MAX_ZOOM {
            return Err(format!("zoom must be at most {}", MAX_ZOOM));
        }
        if self.min_x > self.max_x {
            return Err("min_x must not exceed max_x".to_string());
        }
        if self.min_y > self.max_y {
            return Err("min_y must not exceed max_y".to_string());
        }
        let extent = 1u64 << self.zoom;
        if u64::from(self.max_x) >= extent || u64::from(self.max_y) >= extent {
            return Err(format!(
                "tile coordinates must be below {} at zoom {}",
                extent, self.zoom
            ));
        }
        if self.tile_count() > MAX_FETCH_TILES {
            return Err(format!(
                "area covers {} tiles; at most {} per fetch",
                self.tile_count(),
                MAX_FETCH_TILES
            ));
        }

        if self.expire_min_days < 0 {
            return Err("expire_min_days must not be negative".to_string());
        }
        if !(self.expire_min_days <= self.expire_default_days
            && self.expire_default_days <= self.expire_max_days)
        {
            return Err(
                "expiration must satisfy min <= default <= max".to_string(),
            );
        }

        if self.connect_timeout == 0 || self.read_timeout == 0 {
            return Err("timeouts must be greater than 0".to_string());
        }
        if self.workers_max == 0 {
            return Err("workers_max must be greater than 0".to_string());
        }
        if self.workers_core > self.workers_max {
            return Err("workers_core must not exceed workers_max".to_string());
        }
        if self.memory_cache == 0 {
            return Err("memory_cache must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Number of tiles in the requested rectangle.
    pub fn tile_count(&self) -> u64 {
        let width = u64::from(self.max_x.saturating_sub(self.min_x)) + 1;
        let height = u64::from(self.max_y.saturating_sub(self.min_y)) + 1;
        width * height
    }

    /// Tile addresses of the requested rectangle, row by row.
    pub fn addresses(&self) -> impl Iterator<Item = TileAddress> + '_ {
        (self.min_y..=self.max_y).flat_map(move |y| {
            (self.min_x..=self.max_x).map(move |x| TileAddress::new(self.zoom, x, y))
        })
    }

    pub fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            user_agent: self.user_agent.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
        }
    }

    pub fn expiration_policy(&self) -> Result<ExpirationPolicy, String> {
        ExpirationPolicy::new(
            chrono::Duration::days(self.expire_default_days),
            chrono::Duration::days(self.expire_min_days),
            chrono::Duration::days(self.expire_max_days),
        )
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.workers_core, self.workers_max)
            .with_keep_alive(Duration::from_secs(self.worker_keep_alive))
    }

    /// Build the origin provider named by `--url` or `--archive`.
    pub fn build_origin(&self) -> Result<Arc<dyn OriginProvider>, String> {
        if let Some(template) = &self.url {
            let mut origin = HttpOrigin::new(&self.origin, template)?;
            if let Some(strategy) = self.update_strategy {
                origin = origin.with_update_strategy(strategy);
            }
            return Ok(Arc::new(origin));
        }
        if let Some(root) = &self.archive {
            let mut origin = LocalArchiveOrigin::new(&self.origin, root);
            if let Some(strategy) = self.update_strategy {
                origin = origin.with_update_strategy(strategy);
            }
            return Ok(Arc::new(origin));
        }
        Err("no tile source configured".to_string())
    }
}

// =============================================================================
// Stats / Clear
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct StatsConfig {
    #[command(flatten)]
    pub common: CommonConfig,
}

#[derive(Args, Debug, Clone)]
pub struct ClearConfig {
    #[command(flatten)]
    pub common: CommonConfig,

    /// Stores to clear.
    #[arg(required = true)]
    pub names: Vec<String>,
}

// =============================================================================
// Tests
// =============================================================================
