//! atlas-tiles - Tile acquisition and caching for offline map atlases.
//!
//! This binary loads tile rectangles into the persistent store and reports
//! on or clears existing stores.

use clap::Parser;
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atlas_tiles::{
    cache::MemoryTileCache,
    config::{ClearConfig, Cli, Command, FetchConfig, StatsConfig},
    dispatch::{JobDispatcher, LoadOutcome, TileLoadListener, TileLoader},
    download::TileDownloader,
    store::TileStore,
    tile::{Tile, TileAddress},
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Fetch(config) => run_fetch(config),
        Command::Stats(config) => run_stats(config),
        Command::Clear(config) => run_clear(config),
    }
}

// =============================================================================
// Fetch Command
// =============================================================================

fn run_fetch(config: FetchConfig) -> ExitCode {
    init_logging(config.common.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let origin = match config.build_origin() {
        Ok(origin) => origin,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let expiration = match config.expiration_policy() {
        Ok(policy) => policy,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  Store: {} ({})", config.common.store_root.display(), config.common.backend);
    info!("  Origin: {} ({})", origin.name(), origin.update_strategy());
    info!(
        "  Area: zoom {}, x {}..={}, y {}..={} ({} tiles)",
        config.zoom,
        config.min_x,
        config.max_x,
        config.min_y,
        config.max_y,
        config.tile_count()
    );
    info!(
        "  Workers: {} core, {} max",
        config.workers_core, config.workers_max
    );

    let store = match TileStore::open(config.common.store_config()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open tile store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let downloader = Arc::new(TileDownloader::with_settings(
        store.clone(),
        config.download_settings(),
        expiration,
    ));

    let cache = Arc::new(MemoryTileCache::with_capacity(config.memory_cache));
    let dispatcher = Arc::new(JobDispatcher::new(config.dispatcher_config()));
    let loader = TileLoader::new(cache, downloader, dispatcher.clone());

    let (tx, rx) = mpsc::channel::<(TileAddress, LoadOutcome)>();
    let listener: Arc<dyn TileLoadListener> = Arc::new(move |tile: &Arc<Tile>, outcome: &LoadOutcome| {
        let _ = tx.send((tile.address(), outcome.clone()));
    });

    let started = Instant::now();
    let mut submitted = 0u64;
    for address in config.addresses() {
        let result = if config.force {
            loader.force_reload(origin.clone(), address, listener.clone())
        } else {
            loader.request(origin.clone(), address, listener.clone())
        };
        match result {
            Ok(_) => submitted += 1,
            Err(e) => {
                error!(address = %address, error = %e, "Failed to queue tile");
                break;
            }
        }
    }
    drop(listener);

    let mut summary = FetchSummary::default();
    for _ in 0..submitted {
        let Ok((address, outcome)) = rx.recv() else {
            warn!("Workers stopped before every tile reported");
            break;
        };
        if let LoadOutcome::Failed(ref e) = outcome {
            warn!(address = %address, reason = e.reason_code(), "{}", e);
        }
        summary.record(&outcome);
    }

    dispatcher.shutdown_and_wait();
    if let Err(e) = store.close_all() {
        error!("Failed to close tile store: {}", e);
        return ExitCode::FAILURE;
    }

    summary.print(origin.name(), started.elapsed().as_secs_f64());

    if summary.failed() > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Outcome counters for one fetch run.
#[derive(Debug, Default)]
struct FetchSummary {
    from_store: u64,
    downloaded: u64,
    already_loaded: u64,
    interrupted: u64,
    failures: BTreeMap<&'static str, u64>,
}

impl FetchSummary {
    fn record(&mut self, outcome: &LoadOutcome) {
        match outcome {
            LoadOutcome::FromStore => self.from_store += 1,
            LoadOutcome::Downloaded => self.downloaded += 1,
            LoadOutcome::AlreadyLoaded => self.already_loaded += 1,
            LoadOutcome::Interrupted => self.interrupted += 1,
            LoadOutcome::Failed(e) => *self.failures.entry(e.reason_code()).or_default() += 1,
        }
    }

    fn failed(&self) -> u64 {
        self.failures.values().sum()
    }

    fn print(&self, origin: &str, seconds: f64) {
        println!();
        println!("Fetch summary for {}", origin);
        println!("─────────────────────────────────");
        println!("  From store:     {}", self.from_store);
        println!("  Downloaded:     {}", self.downloaded);
        println!("  Already loaded: {}", self.already_loaded);
        println!("  Interrupted:    {}", self.interrupted);
        println!("  Failed:         {}", self.failed());
        for (reason, count) in &self.failures {
            println!("    {:<20} {}", reason, count);
        }
        println!("  Elapsed:        {:.1}s", seconds);
    }
}

// =============================================================================
// Stats Command
// =============================================================================

fn run_stats(config: StatsConfig) -> ExitCode {
    if config.common.verbose {
        init_logging(true);
    }

    if let Err(e) = config.common.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let store = match TileStore::open(config.common.store_config()) {
        Ok(store) => store,
        Err(e) => {
            println!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let statistics = match store.statistics() {
        Ok(statistics) => statistics,
        Err(e) => {
            println!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Tile stores in {}", config.common.store_root.display());
    println!("─────────────────────────────────");
    if statistics.is_empty() {
        println!("  (no stores found)");
    }
    let mut total_bytes = 0u64;
    let mut total_tiles = 0u64;
    for (name, stats) in &statistics {
        println!(
            "  {:<24} {:>10} tiles {:>12}",
            name,
            stats.tile_count,
            format_bytes(stats.bytes_on_disk)
        );
        total_bytes += stats.bytes_on_disk;
        total_tiles += stats.tile_count;
    }
    println!();
    println!("  Total: {} tiles, {}", total_tiles, format_bytes(total_bytes));

    ExitCode::SUCCESS
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

// =============================================================================
// Clear Command
// =============================================================================

fn run_clear(config: ClearConfig) -> ExitCode {
    init_logging(config.common.verbose);

    if let Err(e) = config.common.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let store = match TileStore::open(config.common.store_config()) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open tile store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut status = ExitCode::SUCCESS;
    for name in &config.names {
        match store.clear(name) {
            Ok(()) => println!("✓ Cleared {}", name),
            Err(e) => {
                println!("✗ {}: {}", name, e);
                status = ExitCode::FAILURE;
            }
        }
    }

    if let Err(e) = store.close_all() {
        error!("Failed to close tile store: {}", e);
        return ExitCode::FAILURE;
    }
    status
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "atlas_tiles=debug"
    } else {
        "atlas_tiles=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
