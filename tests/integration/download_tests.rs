//! Download/update engine integration tests.
//!
//! Tests verify:
//! - Fresh store entries are served without touching the origin
//! - Expired entries are revalidated with the origin's update strategy
//! - Invalid responses are rejected and never stored
//! - Cancellation is honoured before origin I/O

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::StatusCode;

use atlas_tiles::dispatch::WorkerContext;
use atlas_tiles::download::{DataSource, ExpirationPolicy, LoadMode, TileDownloader};
use atlas_tiles::error::{DownloadError, ProtocolViolation};
use atlas_tiles::origin::{format_http_date, OriginResponse, UpdateStrategy};
use atlas_tiles::store::BackendKind;
use atlas_tiles::tile::TileAddress;

use super::test_utils::{
    blue_png, expired_entry, fresh_entry, oversized_png, png_response, red_png, status_response,
    temp_store, tiny_lmdb_store, MockOrigin,
};

const DEMO: TileAddress = TileAddress::new(5, 3, 2);

fn downloader(backend: BackendKind) -> (tempfile::TempDir, TileDownloader) {
    let (dir, store) = temp_store(backend);
    (dir, TileDownloader::new(store))
}

// =============================================================================
// Store Hits
// =============================================================================

#[test]
fn test_fresh_entry_served_from_store() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    downloader
        .store()
        .put("demo", &fresh_entry(DEMO, red_png()))
        .unwrap();
    let origin = MockOrigin::new("demo").with_get(png_response(blue_png()));

    let data = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap()
        .unwrap();

    assert_eq!(data.source, DataSource::Store);
    assert_eq!(data.bytes(), &red_png());
    assert_eq!(origin.get_count(), 0);
    assert_eq!(origin.head_count(), 0);
}

#[test]
fn test_store_only_ignores_missing_and_expired() {
    let (_dir, downloader) = downloader(BackendKind::Sqlite);
    let origin = MockOrigin::new("demo").with_get(png_response(red_png()));
    let ctx = WorkerContext::detached();

    assert!(downloader
        .load(&origin, DEMO, LoadMode::StoreOnly, &ctx)
        .unwrap()
        .is_none());

    downloader
        .store()
        .put("demo", &expired_entry(DEMO, red_png(), Duration::hours(1)))
        .unwrap();
    assert!(downloader
        .load(&origin, DEMO, LoadMode::StoreOnly, &ctx)
        .unwrap()
        .is_none());
    assert_eq!(origin.get_count(), 0);
}

#[test]
fn test_origin_only_bypasses_fresh_entry() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    downloader
        .store()
        .put("demo", &fresh_entry(DEMO, red_png()))
        .unwrap();
    let origin = MockOrigin::new("demo").with_get(png_response(blue_png()));

    let data = downloader
        .load(&origin, DEMO, LoadMode::OriginOnly, &WorkerContext::detached())
        .unwrap()
        .unwrap();

    assert_eq!(data.source, DataSource::Downloaded);
    assert_eq!(data.bytes(), &blue_png());
    let stored = downloader.store().get("demo", DEMO).unwrap().unwrap();
    assert_eq!(stored.data, blue_png());
}

// =============================================================================
// Full Fetch
// =============================================================================

#[test]
fn test_download_stores_validators() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let modified = Utc::now() - Duration::days(3);
    let origin = MockOrigin::new("demo").with_get(
        png_response(red_png())
            .with_header(ETAG, "\"v1\"")
            .with_header(LAST_MODIFIED, &format_http_date(modified)),
    );

    let data = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap()
        .unwrap();
    assert_eq!(data.source, DataSource::Downloaded);

    let stored = downloader.store().get("demo", DEMO).unwrap().unwrap();
    assert_eq!(stored.data, red_png());
    assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
    assert_eq!(
        stored.time_last_modified.map(|t| t.timestamp()),
        Some(modified.timestamp())
    );
    assert!(stored.time_expires > Utc::now() + Duration::days(27));

    let request = origin.last_request().unwrap();
    assert!(request.header(&http::header::USER_AGENT).is_some());
}

#[test]
fn test_max_age_bounded_by_policy() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let origin = MockOrigin::new("demo")
        .with_get(png_response(red_png()).with_header(CACHE_CONTROL, "public, max-age=3600"));

    // Default bounds lift one hour to the seven day minimum.
    downloader
        .load(&origin, DEMO, LoadMode::OriginOnly, &WorkerContext::detached())
        .unwrap();
    let stored = downloader.store().get("demo", DEMO).unwrap().unwrap();
    assert!(stored.time_expires >= Utc::now() + Duration::days(6));

    downloader.set_expiration_policy(
        ExpirationPolicy::new(Duration::days(1), Duration::zero(), Duration::days(2)).unwrap(),
    );
    downloader
        .load(&origin, DEMO, LoadMode::OriginOnly, &WorkerContext::detached())
        .unwrap();
    let stored = downloader.store().get("demo", DEMO).unwrap().unwrap();
    let remaining = stored.time_expires - Utc::now();
    assert!(remaining <= Duration::hours(1));
    assert!(remaining > Duration::minutes(55));
}

#[test]
fn test_content_length_mismatch_rejected() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let origin = MockOrigin::new("demo").with_get(
        OriginResponse::new(StatusCode::OK)
            .with_header(CONTENT_TYPE, "image/png")
            .with_header(CONTENT_LENGTH, "100")
            .with_body(vec![0u8; 90]),
    );

    let err = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap_err();

    match err {
        DownloadError::Protocol(ProtocolViolation::ContentLength { expected, actual }) => {
            assert_eq!(expected, 100);
            assert_eq!(actual, 90);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!downloader.store().contains("demo", DEMO).unwrap());
}

#[test]
fn test_rejections_are_not_retryable() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let ctx = WorkerContext::detached();

    let origin = MockOrigin::new("demo").with_get(status_response(StatusCode::NOT_FOUND));
    let err = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &ctx)
        .unwrap_err();
    assert_eq!(err.reason_code(), "http_status");
    assert!(!err.is_retryable());

    let origin = MockOrigin::new("demo").with_get(
        OriginResponse::new(StatusCode::OK)
            .with_header(CONTENT_TYPE, "text/html")
            .with_body(Bytes::from_static(b"<html></html>")),
    );
    let err = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &ctx)
        .unwrap_err();
    assert_eq!(err.reason_code(), "content_type");

    let origin = MockOrigin::new("demo").with_get(
        OriginResponse::new(StatusCode::OK)
            .with_header(CONTENT_TYPE, "image/png")
            .with_body(Bytes::from_static(b"definitely not an image")),
    );
    let err = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &ctx)
        .unwrap_err();
    assert_eq!(err.reason_code(), "unknown_image_format");

    assert!(!downloader.store().contains("demo", DEMO).unwrap());
}

#[test]
fn test_connection_failure_is_transient() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let origin = MockOrigin::new("demo");

    let err = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(!downloader.store().contains("demo", DEMO).unwrap());
}

#[test]
fn test_no_source() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let origin = MockOrigin::new("demo").without_source();

    let err = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap_err();
    assert!(matches!(
        err,
        DownloadError::Protocol(ProtocolViolation::NoSource)
    ));
}

#[test]
fn test_interrupted_before_io() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let origin = MockOrigin::new("demo").with_get(png_response(red_png()));
    let ctx = WorkerContext::detached();
    ctx.interrupt();

    let err = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &ctx)
        .unwrap_err();
    assert!(matches!(err, DownloadError::Interrupted));
    assert_eq!(origin.get_count(), 0);
}

// =============================================================================
// Revalidation
// =============================================================================

#[test]
fn test_etag_unchanged_refreshes_without_get() {
    for backend in [BackendKind::Lmdb, BackendKind::Sqlite] {
        let (_dir, downloader) = downloader(backend);
        let stored = expired_entry(DEMO, red_png(), Duration::hours(1))
            .with_etag(Some("\"abc\"".to_string()));
        downloader.store().put("demo", &stored).unwrap();

        let origin = MockOrigin::new("demo")
            .with_strategy(UpdateStrategy::ETag)
            .with_head(status_response(StatusCode::OK).with_header(ETAG, "\"abc\""))
            .with_get(png_response(blue_png()));

        let before = Utc::now();
        let data = downloader
            .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
            .unwrap()
            .unwrap();

        assert_eq!(data.source, DataSource::Revalidated);
        assert_eq!(data.bytes(), &red_png());
        assert_eq!(origin.head_count(), 1);
        assert_eq!(origin.get_count(), 0);

        let refreshed = downloader.store().get("demo", DEMO).unwrap().unwrap();
        assert_eq!(refreshed.data, red_png());
        assert_eq!(refreshed.etag.as_deref(), Some("\"abc\""));
        assert!(refreshed.time_downloaded.timestamp_millis() >= before.timestamp_millis());
        assert!(!refreshed.is_expired());
    }
}

#[test]
fn test_etag_changed_downloads() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let stored = expired_entry(DEMO, red_png(), Duration::hours(1))
        .with_etag(Some("\"abc\"".to_string()));
    downloader.store().put("demo", &stored).unwrap();

    let origin = MockOrigin::new("demo")
        .with_strategy(UpdateStrategy::ETag)
        .with_head(status_response(StatusCode::OK).with_header(ETAG, "\"def\""))
        .with_get(png_response(blue_png()).with_header(ETAG, "\"def\""));

    let data = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap()
        .unwrap();

    assert_eq!(data.source, DataSource::Downloaded);
    assert_eq!(data.bytes(), &blue_png());
    assert_eq!(origin.head_count(), 1);
    assert_eq!(origin.get_count(), 1);
    let stored = downloader.store().get("demo", DEMO).unwrap().unwrap();
    assert_eq!(stored.etag.as_deref(), Some("\"def\""));
}

#[test]
fn test_head_failure_falls_back_to_get() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let stored = expired_entry(DEMO, red_png(), Duration::hours(1))
        .with_etag(Some("\"abc\"".to_string()));
    downloader.store().put("demo", &stored).unwrap();

    // No HEAD response scripted: the HEAD fails as a connection error.
    let origin = MockOrigin::new("demo")
        .with_strategy(UpdateStrategy::ETag)
        .with_get(png_response(blue_png()));

    let data = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap()
        .unwrap();
    assert_eq!(data.source, DataSource::Downloaded);
    assert_eq!(origin.get_count(), 1);
}

#[test]
fn test_last_modified_unchanged() {
    let (_dir, downloader) = downloader(BackendKind::Sqlite);
    let modified = Utc::now() - Duration::days(10);
    let stored = expired_entry(DEMO, red_png(), Duration::minutes(5))
        .with_last_modified(Some(modified));
    downloader.store().put("demo", &stored).unwrap();

    let origin = MockOrigin::new("demo")
        .with_strategy(UpdateStrategy::LastModified)
        .with_head(
            status_response(StatusCode::OK)
                .with_header(LAST_MODIFIED, &format_http_date(modified - Duration::days(1))),
        );

    let data = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap()
        .unwrap();
    assert_eq!(data.source, DataSource::Revalidated);
    assert_eq!(origin.get_count(), 0);
}

#[test]
fn test_if_none_match_not_modified() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let stored = expired_entry(DEMO, red_png(), Duration::hours(1))
        .with_etag(Some("\"v1\"".to_string()));
    downloader.store().put("demo", &stored).unwrap();

    let origin = MockOrigin::new("demo")
        .with_strategy(UpdateStrategy::IfNoneMatch)
        .with_get(status_response(StatusCode::NOT_MODIFIED));

    let data = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap()
        .unwrap();

    assert_eq!(data.source, DataSource::Revalidated);
    assert_eq!(data.bytes(), &red_png());
    assert_eq!(origin.get_count(), 1);
    let request = origin.last_request().unwrap();
    assert_eq!(request.header(&IF_NONE_MATCH), Some("\"v1\""));
    assert!(!downloader.store().get("demo", DEMO).unwrap().unwrap().is_expired());
}

#[test]
fn test_if_modified_since_sends_date_and_accepts_new_body() {
    let (_dir, downloader) = downloader(BackendKind::Lmdb);
    let modified = Utc::now() - Duration::days(10);
    let stored = expired_entry(DEMO, red_png(), Duration::hours(1))
        .with_last_modified(Some(modified));
    downloader.store().put("demo", &stored).unwrap();

    let origin = MockOrigin::new("demo")
        .with_strategy(UpdateStrategy::IfModifiedSince)
        .with_get(png_response(blue_png()));

    let data = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap()
        .unwrap();

    assert_eq!(data.source, DataSource::Downloaded);
    assert_eq!(data.bytes(), &blue_png());
    let request = origin.last_request().unwrap();
    assert_eq!(
        request.header(&IF_MODIFIED_SINCE),
        Some(format_http_date(modified).as_str())
    );
}

#[test]
fn test_strategy_none_refetches() {
    let (_dir, downloader) = downloader(BackendKind::Sqlite);
    let stored = expired_entry(DEMO, red_png(), Duration::hours(1))
        .with_etag(Some("\"abc\"".to_string()));
    downloader.store().put("demo", &stored).unwrap();

    let origin = MockOrigin::new("demo").with_get(png_response(blue_png()));

    let data = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap()
        .unwrap();

    assert_eq!(data.source, DataSource::Downloaded);
    assert_eq!(origin.head_count(), 0);
    assert_eq!(origin.get_count(), 1);
    assert!(origin.requests()[0].header(&IF_NONE_MATCH).is_none());

    let stored = downloader.store().get("demo", DEMO).unwrap().unwrap();
    assert_eq!(stored.data, blue_png());
    assert!(stored.etag.is_none());
}

#[test]
fn test_shared_store_across_downloaders() {
    let (_dir, store) = temp_store(BackendKind::Lmdb);
    let first = TileDownloader::new(Arc::clone(&store));
    let second = TileDownloader::new(store);
    let origin = MockOrigin::new("demo").with_get(png_response(red_png()));
    let ctx = WorkerContext::detached();

    first
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &ctx)
        .unwrap();
    let data = second
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &ctx)
        .unwrap()
        .unwrap();
    assert_eq!(data.source, DataSource::Store);
    assert_eq!(origin.get_count(), 1);
}

// =============================================================================
// Storage Faults
// =============================================================================

#[test]
fn test_failed_store_write_fails_the_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let downloader = TileDownloader::new(tiny_lmdb_store(&dir));
    let origin = MockOrigin::new("demo").with_get(png_response(oversized_png()));

    let err = downloader
        .load(&origin, DEMO, LoadMode::StoreThenOrigin, &WorkerContext::detached())
        .unwrap_err();

    assert!(matches!(err, DownloadError::Storage(_)), "unexpected error: {:?}", err);
    assert_eq!(err.reason_code(), "storage");
    assert!(!err.is_retryable());
    assert_eq!(origin.get_count(), 1);
    assert!(!downloader.store().contains("demo", DEMO).unwrap());
}

#[test]
fn test_store_recovers_after_write_fault() {
    let dir = tempfile::TempDir::new().unwrap();
    let downloader = TileDownloader::new(tiny_lmdb_store(&dir));
    let origin = MockOrigin::new("demo").with_get(png_response(oversized_png()));
    let ctx = WorkerContext::detached();

    assert!(downloader.load(&origin, DEMO, LoadMode::OriginOnly, &ctx).is_err());
    assert!(!downloader.store().is_open("demo"));

    origin.set_get(png_response(red_png()));
    let data = downloader
        .load(&origin, DEMO, LoadMode::OriginOnly, &ctx)
        .unwrap()
        .unwrap();
    assert_eq!(data.source, DataSource::Downloaded);
    assert!(downloader.store().is_open("demo"));
    assert!(downloader.store().contains("demo", DEMO).unwrap());
}
