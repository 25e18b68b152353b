//! Persistent tile store integration tests.
//!
//! Tests verify, for both backends:
//! - Entries survive closing and reopening the store
//! - Namespaces evicted from the open set keep their data
//! - Clearing is idempotent
//! - Concurrent writers from several threads

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tempfile::TempDir;

use atlas_tiles::error::StoreError;
use atlas_tiles::store::{BackendKind, StoreConfig, TileStore};
use atlas_tiles::tile::{TileAddress, TileEntry};

use super::test_utils::{blue_png, fresh_entry, open_store, red_png, same_millis};

const BACKENDS: [BackendKind; 2] = [BackendKind::Lmdb, BackendKind::Sqlite];

#[test]
fn test_entries_survive_reopen() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let address = TileAddress::new(5, 3, 2);
        let modified = Utc::now() - chrono::Duration::days(4);
        let entry = fresh_entry(address, red_png())
            .with_etag(Some("\"abc\"".to_string()))
            .with_last_modified(Some(modified));

        {
            let store = open_store(&dir, backend);
            store.put("osm", &entry).unwrap();
            store.close_all().unwrap();
        }

        let store = open_store(&dir, backend);
        let loaded = store.get("osm", address).unwrap().expect("entry persisted");
        assert_eq!(loaded.data, red_png(), "{backend}");
        assert_eq!(loaded.etag.as_deref(), Some("\"abc\""));
        assert!(same_millis(loaded.time_downloaded, entry.time_downloaded));
        assert!(same_millis(loaded.time_expires, entry.time_expires));
        assert!(same_millis(loaded.time_last_modified.unwrap(), modified));
    }
}

#[test]
fn test_empty_entry_round_trips() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, backend);
        let address = TileAddress::new(9, 100, 200);
        let now = Utc::now();
        store
            .put("osm", &TileEntry::empty(address, now, now + chrono::Duration::days(1)))
            .unwrap();

        let loaded = store.get("osm", address).unwrap().unwrap();
        assert!(loaded.is_empty());
        assert!(store.contains("osm", address).unwrap());
    }
}

#[test]
fn test_put_replaces_entry() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, backend);
        let address = TileAddress::new(2, 1, 1);

        store.put("osm", &fresh_entry(address, red_png())).unwrap();
        store.put("osm", &fresh_entry(address, blue_png())).unwrap();

        assert_eq!(store.get("osm", address).unwrap().unwrap().data, blue_png());
        assert_eq!(store.estimate_size("osm").unwrap().tile_count, 1);
    }
}

#[test]
fn test_evicted_namespaces_keep_data() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path())
            .with_backend(backend)
            .with_max_open(2)
            .with_lmdb_map_size(16 * 1024 * 1024);
        let store = TileStore::open(config).unwrap();
        let address = TileAddress::new(1, 1, 0);

        for name in ["a", "b", "c", "d"] {
            store.put(name, &fresh_entry(address, red_png())).unwrap();
            assert!(store.open_count() <= 2);
        }
        assert!(!store.is_open("a"));

        for name in ["a", "b", "c", "d"] {
            assert!(store.contains(name, address).unwrap(), "{backend} {name}");
        }
        assert_eq!(store.list_store_names().unwrap(), vec!["a", "b", "c", "d"]);
    }
}

#[test]
fn test_clear_is_idempotent() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, backend);
        let address = TileAddress::new(3, 4, 5);

        store.clear("never-written").unwrap();
        assert!(store.list_store_names().unwrap().is_empty());

        store.put("osm", &fresh_entry(address, red_png())).unwrap();
        store.clear("osm").unwrap();
        store.clear("osm").unwrap();

        assert!(!store.contains("osm", address).unwrap());
        assert_eq!(store.estimate_size("osm").unwrap().tile_count, 0);

        store.put("osm", &fresh_entry(address, blue_png())).unwrap();
        assert_eq!(store.get("osm", address).unwrap().unwrap().data, blue_png());
    }
}

#[test]
fn test_statistics_report_every_namespace() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, BackendKind::Sqlite);
    for x in 0..3 {
        store
            .put("osm", &fresh_entry(TileAddress::new(2, x, 0), red_png()))
            .unwrap();
    }
    store
        .put("topo", &fresh_entry(TileAddress::new(0, 0, 0), blue_png()))
        .unwrap();

    let stats = store.statistics().unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].0, "osm");
    assert_eq!(stats[0].1.tile_count, 3);
    assert!(stats[0].1.bytes_on_disk > 0);
    assert_eq!(stats[1].0, "topo");
    assert_eq!(stats[1].1.tile_count, 1);
}

#[test]
fn test_concurrent_writers() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, backend);

        let handles: Vec<_> = (0..4u32)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..10u32 {
                        let address = TileAddress::new(6, worker, i);
                        store.put("osm", &fresh_entry(address, red_png())).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.estimate_size("osm").unwrap().tile_count, 40);
    }
}

#[test]
fn test_store_root_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let _store = open_store(&dir, BackendKind::Lmdb);

    let second = TileStore::open(StoreConfig::new(dir.path()));
    assert!(matches!(second, Err(StoreError::Locked { .. })));
}
