//! Store-vs-origin decisions, conditional revalidation and persistence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::{ACCEPT, IF_MODIFIED_SINCE, IF_NONE_MATCH, USER_AGENT};
use http::StatusCode;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::dispatch::WorkerContext;
use crate::error::{DownloadError, ProtocolViolation};
use crate::origin::{
    format_http_date, OriginProvider, OriginRequest, OriginResponse, UpdateStrategy,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT,
};
use crate::store::TileStore;
use crate::tile::{TileAddress, TileEntry};

use super::expiry::ExpirationPolicy;
use super::validate::validate_response;

/// Default `User-Agent` sent to origins.
pub const DEFAULT_USER_AGENT: &str = concat!("atlas-tiles/", env!("CARGO_PKG_VERSION"));

// =============================================================================
// Request Types
// =============================================================================

/// Which tiers a load may consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Persistent store only; never touches the network
    StoreOnly,
    /// Fresh stored entry if present, otherwise revalidate or fetch
    StoreThenOrigin,
    /// Always fetch from the origin; the result is still persisted
    OriginOnly,
}

impl LoadMode {
    fn reads_store(&self) -> bool {
        !matches!(self, LoadMode::OriginOnly)
    }
}

/// Where returned tile bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Fresh entry in the persistent store
    Store,
    /// Full download from the origin
    Downloaded,
    /// Expired stored entry the origin confirmed unchanged
    Revalidated,
}

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct TileData {
    pub entry: TileEntry,
    pub source: DataSource,
}

impl TileData {
    fn new(entry: TileEntry, source: DataSource) -> Self {
        Self { entry, source }
    }

    pub fn bytes(&self) -> &bytes::Bytes {
        &self.entry.data
    }
}

/// Request settings applied to every origin request.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

// =============================================================================
// TileDownloader
// =============================================================================

/// The only component that writes network results into the persistent store.
///
/// For each request it:
/// 1. Serves a fresh stored entry when the mode allows it
/// 2. Revalidates an expired entry using the origin's [`UpdateStrategy`]
/// 3. Otherwise performs a full, validated download and persists it
///
/// Store reads and writes run inside worker critical sections; cancellation
/// is checked before and after network I/O and before the store write. A
/// failed store write fails the load with [`DownloadError::Storage`].
pub struct TileDownloader {
    store: Arc<TileStore>,
    settings: DownloadSettings,
    expiration: RwLock<ExpirationPolicy>,
}

impl TileDownloader {
    pub fn new(store: Arc<TileStore>) -> Self {
        Self::with_settings(store, DownloadSettings::default(), ExpirationPolicy::default())
    }

    pub fn with_settings(
        store: Arc<TileStore>,
        settings: DownloadSettings,
        expiration: ExpirationPolicy,
    ) -> Self {
        Self {
            store,
            settings,
            expiration: RwLock::new(expiration),
        }
    }

    pub fn store(&self) -> &Arc<TileStore> {
        &self.store
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    pub fn expiration_policy(&self) -> ExpirationPolicy {
        *self.expiration.read()
    }

    /// Replace the expiration bounds. Entries already written keep theirs.
    pub fn set_expiration_policy(&self, policy: ExpirationPolicy) {
        *self.expiration.write() = policy;
    }

    /// Load one tile.
    ///
    /// Returns `Ok(None)` only in [`LoadMode::StoreOnly`] when the store has
    /// no fresh entry.
    pub fn load(
        &self,
        origin: &dyn OriginProvider,
        address: TileAddress,
        mode: LoadMode,
        ctx: &WorkerContext,
    ) -> Result<Option<TileData>, DownloadError> {
        ctx.check()?;

        let stored = if mode.reads_store() {
            self.read_store(origin.name(), address, ctx)
        } else {
            None
        };

        match stored {
            Some(entry) if !entry.is_expired() => {
                debug!(origin = origin.name(), zoom = address.zoom, x = address.x, y = address.y, "Store hit");
                Ok(Some(TileData::new(entry, DataSource::Store)))
            }
            _ if mode == LoadMode::StoreOnly => Ok(None),
            Some(entry) => self.revalidate(origin, entry, ctx).map(Some),
            None => self.download(origin, address, None, ctx).map(Some),
        }
    }

    // -------------------------------------------------------------------------
    // Revalidation
    // -------------------------------------------------------------------------

    fn revalidate(
        &self,
        origin: &dyn OriginProvider,
        stored: TileEntry,
        ctx: &WorkerContext,
    ) -> Result<TileData, DownloadError> {
        let strategy = origin.update_strategy();
        let address = stored.address;
        debug!(
            origin = origin.name(),
            zoom = address.zoom,
            x = address.x,
            y = address.y,
            strategy = %strategy,
            "Stored tile expired, revalidating"
        );

        match strategy {
            UpdateStrategy::None => self.download(origin, address, None, ctx),
            UpdateStrategy::ETag | UpdateStrategy::LastModified => {
                match self.head(origin, address, ctx)? {
                    Some(head) if unchanged(strategy, &stored, &head) => {
                        self.refresh(origin.name(), &stored, &head, ctx)
                    }
                    _ => self.download(origin, address, None, ctx),
                }
            }
            UpdateStrategy::IfNoneMatch | UpdateStrategy::IfModifiedSince => {
                self.download(origin, address, Some(&stored), ctx)
            }
        }
    }

    /// Lightweight existence check. Non-success statuses and transport
    /// failures yield `None` so the caller falls back to a full fetch.
    fn head(
        &self,
        origin: &dyn OriginProvider,
        address: TileAddress,
        ctx: &WorkerContext,
    ) -> Result<Option<OriginResponse>, DownloadError> {
        let Some(mut conn) = origin.open_connection(address)? else {
            return Ok(None);
        };
        let request = self.build_request(origin, OriginRequest::head(), None);

        ctx.check()?;
        let result = conn.execute(&request);
        ctx.check()?;

        match result {
            Ok(response) if response.status.is_success() => Ok(Some(response)),
            Ok(response) => {
                debug!(origin = origin.name(), status = response.status.as_u16(), "HEAD not usable");
                Ok(None)
            }
            Err(DownloadError::Transient(message)) => {
                debug!(origin = origin.name(), error = %message, "HEAD failed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Renew bookkeeping of an unchanged entry and persist it.
    fn refresh(
        &self,
        origin: &str,
        stored: &TileEntry,
        response: &OriginResponse,
        ctx: &WorkerContext,
    ) -> Result<TileData, DownloadError> {
        let now = Utc::now();
        let expires = self.expiration.read().compute(&response.headers, now);
        let mut entry = stored.refreshed(now, expires);
        if let Some(etag) = response.etag() {
            entry.etag = Some(etag.to_string());
        }
        if let Some(modified) = response.last_modified() {
            entry.time_last_modified = Some(modified);
        }

        debug!(
            origin,
            zoom = entry.address.zoom,
            x = entry.address.x,
            y = entry.address.y,
            "Tile unchanged at origin, refreshed expiry"
        );

        ctx.check()?;
        self.write_store(origin, &entry, ctx)?;
        Ok(TileData::new(entry, DataSource::Revalidated))
    }

    // -------------------------------------------------------------------------
    // Full fetch
    // -------------------------------------------------------------------------

    /// Fetch, validate and persist. With `conditional` set, the stored entry's
    /// validator is attached and a 304 answer refreshes it instead.
    fn download(
        &self,
        origin: &dyn OriginProvider,
        address: TileAddress,
        conditional: Option<&TileEntry>,
        ctx: &WorkerContext,
    ) -> Result<TileData, DownloadError> {
        let mut conn = origin
            .open_connection(address)?
            .ok_or(ProtocolViolation::NoSource)?;
        let validator = conditional.and_then(|stored| validator(origin.update_strategy(), stored));
        let request = self.build_request(origin, OriginRequest::get(), validator);

        ctx.check()?;
        let response = conn.execute(&request)?;
        ctx.check()?;

        if let Some(stored) = conditional {
            if response.status == StatusCode::NOT_MODIFIED {
                return self.refresh(origin.name(), stored, &response, ctx);
            }
        }

        if let Err(violation) = validate_response(&response) {
            warn!(
                origin = origin.name(),
                zoom = address.zoom,
                x = address.x,
                y = address.y,
                reason = violation.code(),
                error = %violation,
                "Rejected origin response"
            );
            return Err(violation.into());
        }

        let now = Utc::now();
        let expires = self.expiration.read().compute(&response.headers, now);
        let entry = TileEntry::new(address, response.body.clone(), now, expires)
            .with_etag(response.etag().map(str::to_string))
            .with_last_modified(response.last_modified());

        debug!(
            origin = origin.name(),
            zoom = address.zoom,
            x = address.x,
            y = address.y,
            bytes = entry.data.len(),
            "Downloaded tile"
        );

        ctx.check()?;
        self.write_store(origin.name(), &entry, ctx)?;
        Ok(TileData::new(entry, DataSource::Downloaded))
    }

    fn build_request(
        &self,
        origin: &dyn OriginProvider,
        mut request: OriginRequest,
        validator: Option<(http::HeaderName, String)>,
    ) -> OriginRequest {
        request.connect_timeout = self.settings.connect_timeout;
        request.read_timeout = self.settings.read_timeout;
        request.set_header(USER_AGENT, &self.settings.user_agent);
        request.set_header(ACCEPT, "image/*");
        if let Some((name, value)) = validator {
            request.set_header(name, &value);
        }
        origin.prepare_request(&mut request);
        request
    }

    // -------------------------------------------------------------------------
    // Store access
    // -------------------------------------------------------------------------

    /// A store failure here is a miss: the tile is fetched again.
    fn read_store(&self, origin: &str, address: TileAddress, ctx: &WorkerContext) -> Option<TileEntry> {
        match ctx.critical(|| self.store.get(origin, address)) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(origin, zoom = address.zoom, x = address.x, y = address.y, error = %e, "Store read failed");
                None
            }
        }
    }

    /// A tile that could not be persisted is a storage fault, not a download.
    fn write_store(&self, origin: &str, entry: &TileEntry, ctx: &WorkerContext) -> Result<(), DownloadError> {
        let address = entry.address;
        ctx.critical(|| self.store.put(origin, entry)).map_err(|e| {
            warn!(origin, zoom = address.zoom, x = address.x, y = address.y, error = %e, "Store write failed");
            DownloadError::Storage(e)
        })
    }
}

fn unchanged(strategy: UpdateStrategy, stored: &TileEntry, head: &OriginResponse) -> bool {
    match strategy {
        UpdateStrategy::ETag => match (stored.etag.as_deref(), head.etag()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        },
        UpdateStrategy::LastModified => match (stored.time_last_modified, head.last_modified()) {
            (Some(ours), Some(theirs)) => theirs <= ours,
            _ => false,
        },
        _ => false,
    }
}

/// Conditional header for the `If-*` strategies, if the entry has a validator.
fn validator(strategy: UpdateStrategy, stored: &TileEntry) -> Option<(http::HeaderName, String)> {
    match strategy {
        UpdateStrategy::IfNoneMatch => stored.etag.clone().map(|etag| (IF_NONE_MATCH, etag)),
        UpdateStrategy::IfModifiedSince => {
            let since: DateTime<Utc> = stored.time_last_modified.unwrap_or(stored.time_downloaded);
            Some((IF_MODIFIED_SINCE, format_http_date(since)))
        }
        _ => None,
    }
}
