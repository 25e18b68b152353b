//! Job dispatcher and tile load job integration tests.
//!
//! Tests verify:
//! - Concurrent requests for one tile cause a single origin fetch
//! - Every listener is notified exactly once
//! - Failed loads leave the tile in ERROR with the error image attached
//! - Expired tiles are revalidated and reloaded
//! - Cancellation and shutdown leave tiles reloadable

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::header::ETAG;
use http::StatusCode;

use atlas_tiles::cache::{MemoryTileCache, DEFAULT_MEMORY_CACHE_CAPACITY, ERROR_TILE_SIZE};
use atlas_tiles::dispatch::{
    DispatcherConfig, JobDispatcher, LoadOutcome, TileLoadJob, TileLoadListener, TileLoader,
    WorkerContext,
};
use atlas_tiles::download::TileDownloader;
use atlas_tiles::error::{DispatchError, DownloadError, ProtocolViolation};
use atlas_tiles::origin::{OriginProvider, UpdateStrategy};
use atlas_tiles::store::{BackendKind, TileStore};
use atlas_tiles::tile::{Tile, TileAddress, TileKey, TileState};

use super::test_utils::{
    blue_png, expired_entry, fresh_entry, oversized_png, png_response, red_png, status_response,
    temp_store, tiny_lmdb_store, MockOrigin,
};

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<TileStore>,
    loader: TileLoader,
}

fn harness(core: usize, max: usize) -> Harness {
    harness_with_cache(core, max, DEFAULT_MEMORY_CACHE_CAPACITY)
}

fn harness_with_cache(core: usize, max: usize, cache_capacity: usize) -> Harness {
    let (dir, store) = temp_store(BackendKind::Lmdb);
    let downloader = Arc::new(TileDownloader::new(Arc::clone(&store)));
    let cache = Arc::new(MemoryTileCache::with_capacity(cache_capacity));
    let dispatcher = Arc::new(JobDispatcher::new(DispatcherConfig::new(core, max)));
    Harness {
        _dir: dir,
        store,
        loader: TileLoader::new(cache, downloader, dispatcher),
    }
}

type Reports = mpsc::Receiver<(TileKey, LoadOutcome)>;

fn channel_listener() -> (Arc<dyn TileLoadListener>, Reports) {
    let (tx, rx) = mpsc::channel();
    let listener: Arc<dyn TileLoadListener> =
        Arc::new(move |tile: &Arc<Tile>, outcome: &LoadOutcome| {
            let _ = tx.send((tile.key().clone(), outcome.clone()));
        });
    (listener, rx)
}

fn origin_arc(origin: &MockOrigin) -> Arc<dyn OriginProvider> {
    Arc::new(origin.clone())
}

// =============================================================================
// Single Flight
// =============================================================================

#[test]
fn test_concurrent_requests_fetch_once() {
    let h = harness(4, 8);
    let origin = MockOrigin::new("demo")
        .with_get(png_response(red_png()))
        .with_delay(Duration::from_millis(100));
    let address = TileAddress::new(5, 3, 2);

    let notified = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    for _ in 0..8 {
        let counter = Arc::clone(&notified);
        let tx = tx.clone();
        let listener: Arc<dyn TileLoadListener> =
            Arc::new(move |_tile: &Arc<Tile>, outcome: &LoadOutcome| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(outcome.clone());
            });
        h.loader
            .request(origin_arc(&origin), address, listener)
            .unwrap();
    }

    for _ in 0..8 {
        let outcome = rx.recv_timeout(WAIT).expect("listener notified");
        assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
    }
    // Nothing is reported twice.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(notified.load(Ordering::SeqCst), 8);

    assert_eq!(origin.get_count(), 1);
    let tile = h.loader.cache().get(&TileKey::new("demo", address)).unwrap();
    assert_eq!(tile.state(), TileState::Loaded);
    assert_eq!(tile.data().unwrap(), red_png());
    assert!(h.store.contains("demo", address).unwrap());
}

#[test]
fn test_full_cache_keeps_in_flight_tile() {
    let h = harness_with_cache(2, 4, 1);
    let origin = MockOrigin::new("demo")
        .with_get(png_response(red_png()))
        .with_delay(Duration::from_millis(300));
    let a = TileAddress::new(5, 3, 2);
    let b = TileAddress::new(5, 4, 2);
    let (listener, rx) = channel_listener();

    let first = h
        .loader
        .request(origin_arc(&origin), a, listener.clone())
        .unwrap();
    h.loader
        .request(origin_arc(&origin), b, listener.clone())
        .unwrap();
    let second = h
        .loader
        .request(origin_arc(&origin), a, listener)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let mut reports = Vec::new();
    for _ in 0..3 {
        let (key, outcome) = rx.recv_timeout(WAIT).expect("listener notified");
        assert!(outcome.is_success(), "unexpected outcome: {:?}", outcome);
        reports.push((key, outcome));
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    assert_eq!(reports.iter().filter(|(key, _)| key.address == a).count(), 2);
    assert_eq!(origin.get_count(), 2);
    assert_eq!(first.state(), TileState::Loaded);
    assert_eq!(first.data().unwrap(), red_png());
}

#[test]
fn test_many_tiles_loaded_in_parallel() {
    let h = harness(2, 6);
    let origin = MockOrigin::new("demo")
        .with_get(png_response(red_png()))
        .with_delay(Duration::from_millis(20));
    let (listener, rx) = channel_listener();

    for x in 0..4 {
        for y in 0..4 {
            h.loader
                .request(origin_arc(&origin), TileAddress::new(2, x, y), listener.clone())
                .unwrap();
        }
    }

    let mut keys = Vec::new();
    for _ in 0..16 {
        let (key, outcome) = rx.recv_timeout(WAIT).expect("listener notified");
        assert!(matches!(outcome, LoadOutcome::Downloaded));
        keys.push(key);
    }
    keys.sort_by_key(|k| k.address);
    keys.dedup();
    assert_eq!(keys.len(), 16);
    assert_eq!(origin.get_count(), 16);
    assert!(h.loader.dispatcher().worker_count() <= 6);
    assert_eq!(h.store.estimate_size("demo").unwrap().tile_count, 16);
}

// =============================================================================
// Outcomes
// =============================================================================

#[test]
fn test_store_hit_outcome() {
    let h = harness(1, 2);
    let address = TileAddress::new(4, 1, 1);
    h.store.put("demo", &fresh_entry(address, blue_png())).unwrap();
    let origin = MockOrigin::new("demo").with_get(png_response(red_png()));
    let (listener, rx) = channel_listener();

    let tile = h.loader.request(origin_arc(&origin), address, listener).unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();

    assert!(matches!(outcome, LoadOutcome::FromStore));
    assert_eq!(tile.state(), TileState::Loaded);
    assert_eq!(tile.data().unwrap(), blue_png());
    assert_eq!(origin.get_count(), 0);
}

#[test]
fn test_failed_load_sets_error_image() {
    let h = harness(1, 2);
    let address = TileAddress::new(3, 1, 1);
    let origin = MockOrigin::new("demo").with_get(status_response(StatusCode::INTERNAL_SERVER_ERROR));
    let (listener, rx) = channel_listener();

    let tile = h
        .loader
        .request(origin_arc(&origin), address, listener.clone())
        .unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();

    match outcome {
        LoadOutcome::Failed(DownloadError::Protocol(ProtocolViolation::HttpStatus(500))) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(tile.state(), TileState::Error);
    let image = tile.placeholder().expect("error image attached");
    assert_eq!(image.dimensions(), (ERROR_TILE_SIZE, ERROR_TILE_SIZE));
    assert_eq!(tile.last_error().unwrap().reason_code(), "http_status");
    assert!(!h.store.contains("demo", address).unwrap());

    // A plain request does not retry a failed tile.
    h.loader
        .request(origin_arc(&origin), address, listener.clone())
        .unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome, LoadOutcome::Failed(_)));
    assert_eq!(origin.get_count(), 1);

    // An explicit reload does.
    origin.set_get(png_response(red_png()));
    h.loader
        .reload(origin_arc(&origin), address, listener)
        .unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome, LoadOutcome::Downloaded));
    assert_eq!(tile.state(), TileState::Loaded);
    assert!(tile.placeholder().is_none());
    assert!(tile.last_error().is_none());
}

#[test]
fn test_unpersisted_tile_reported_as_storage_fault() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = tiny_lmdb_store(&dir);
    let loader = TileLoader::new(
        Arc::new(MemoryTileCache::new()),
        Arc::new(TileDownloader::new(Arc::clone(&store))),
        Arc::new(JobDispatcher::new(DispatcherConfig::new(1, 1))),
    );
    let address = TileAddress::new(3, 1, 1);
    let origin = MockOrigin::new("demo").with_get(png_response(oversized_png()));
    let (listener, rx) = channel_listener();

    let tile = loader
        .request(origin_arc(&origin), address, listener)
        .unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();

    match outcome {
        LoadOutcome::Failed(DownloadError::Storage(_)) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(tile.state(), TileState::Error);
    assert_eq!(tile.last_error().unwrap().reason_code(), "storage");
    assert!(!store.contains("demo", address).unwrap());
}

#[test]
fn test_expired_tile_revalidated() {
    let h = harness(1, 2);
    let address = TileAddress::new(5, 3, 2);
    let stored = expired_entry(address, red_png(), chrono::Duration::hours(1))
        .with_etag(Some("\"abc\"".to_string()));
    h.store.put("demo", &stored).unwrap();

    let origin = MockOrigin::new("demo")
        .with_strategy(UpdateStrategy::ETag)
        .with_head(status_response(StatusCode::OK).with_header(ETAG, "\"abc\""));
    let (listener, rx) = channel_listener();

    let tile = h.loader.request(origin_arc(&origin), address, listener).unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();

    assert!(matches!(outcome, LoadOutcome::Downloaded));
    assert_eq!(origin.head_count(), 1);
    assert_eq!(origin.get_count(), 0);
    assert_eq!(tile.state(), TileState::Loaded);
    assert_eq!(tile.data().unwrap(), red_png());
    assert!(tile.entry().unwrap().time_expires > Utc::now());
}

#[test]
fn test_force_reload_bypasses_store() {
    let h = harness(1, 2);
    let address = TileAddress::new(4, 2, 2);
    h.store.put("demo", &fresh_entry(address, red_png())).unwrap();
    let origin = MockOrigin::new("demo").with_get(png_response(blue_png()));
    let (listener, rx) = channel_listener();

    let tile = h
        .loader
        .force_reload(origin_arc(&origin), address, listener)
        .unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();

    assert!(matches!(outcome, LoadOutcome::Downloaded));
    assert_eq!(tile.data().unwrap(), blue_png());
    assert_eq!(h.store.get("demo", address).unwrap().unwrap().data, blue_png());
}

// =============================================================================
// Placeholders and Interruption
// =============================================================================

#[test]
fn test_interrupted_job_keeps_ancestor_placeholder() {
    let h = harness(1, 2);
    let origin = MockOrigin::new("demo").with_get(png_response(red_png()));
    let parent = TileAddress::new(1, 0, 0);
    let (listener, rx) = channel_listener();

    h.loader
        .request(origin_arc(&origin), parent, listener.clone())
        .unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome, LoadOutcome::Downloaded));

    let child = TileKey::new("demo", TileAddress::new(2, 1, 1));
    let job = TileLoadJob::new(
        child.clone(),
        origin_arc(&origin),
        Arc::clone(h.loader.cache()),
        Arc::clone(h.loader.downloader()),
        listener,
    );
    let ctx = WorkerContext::detached();
    ctx.interrupt();

    let outcome = job.execute(&ctx);
    assert!(matches!(outcome, LoadOutcome::Interrupted));
    let (_, reported) = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(reported, LoadOutcome::Interrupted));

    let tile = h.loader.cache().get(&child).unwrap();
    assert_eq!(tile.state(), TileState::New);
    assert!(tile.placeholder().is_some());
    assert!(tile.data().is_none());
    assert_eq!(origin.get_count(), 1);
}

#[test]
fn test_cancel_outstanding_leaves_tiles_new() {
    let h = harness(1, 1);
    let origin = MockOrigin::new("demo").with_get(png_response(red_png()));
    let (listener, rx) = channel_listener();

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    h.loader
        .dispatcher()
        .submit(move |_ctx: &WorkerContext| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        })
        .unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let mut tiles = Vec::new();
    for x in 0..5 {
        tiles.push(
            h.loader
                .request(origin_arc(&origin), TileAddress::new(3, x, 0), listener.clone())
                .unwrap(),
        );
    }
    assert_eq!(h.loader.cancel_outstanding(), 5);
    release_tx.send(()).unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(tiles.iter().all(|t| t.state() == TileState::New));
    assert_eq!(origin.get_count(), 0);

    // Dropped tiles can be requested again.
    h.loader
        .request(origin_arc(&origin), TileAddress::new(3, 0, 0), listener)
        .unwrap();
    let (_, outcome) = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome, LoadOutcome::Downloaded));
}

#[test]
fn test_shutdown_rejects_requests() {
    let h = harness(1, 2);
    let origin = MockOrigin::new("demo").with_get(png_response(red_png()));
    let (listener, _rx) = channel_listener();

    h.loader.dispatcher().shutdown_and_wait();
    assert!(h.loader.dispatcher().is_shut_down());

    let err = h
        .loader
        .request(origin_arc(&origin), TileAddress::new(0, 0, 0), listener)
        .unwrap_err();
    assert_eq!(err, DispatchError::ShutDown);
}
