//! Runtime tile object shared between the memory cache, load jobs and callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use parking_lot::Mutex;

use crate::dispatch::{LoadOutcome, TileLoadListener};
use crate::error::DownloadError;

use super::address::{TileAddress, TileKey};
use super::entry::TileEntry;

/// Load state of a runtime tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    /// Referenced but no load attempt has claimed it
    New,
    /// A job owns the tile and is performing I/O
    Loading,
    /// Data is present and fresh
    Loaded,
    /// Last load attempt failed; an error image is attached
    Error,
    /// Data is present but its freshness window has passed
    Expired,
}

impl TileState {
    /// States a load attempt can end in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TileState::Loaded | TileState::Error | TileState::Expired)
    }

    /// States whose data can be drawn.
    pub fn has_data(&self) -> bool {
        matches!(self, TileState::Loaded | TileState::Expired)
    }
}

struct TileInner {
    state: TileState,
    entry: Option<TileEntry>,
    placeholder: Option<Arc<RgbaImage>>,
    last_error: Option<DownloadError>,
    waiting: Vec<Arc<dyn TileLoadListener>>,
}

/// A tile as seen by the running process.
///
/// All state transitions happen under the tile's own lock. Listeners that
/// arrive while another job is loading the tile are parked here and invoked
/// by that job when it finishes.
///
/// A tile with queued load jobs or a load in flight is pinned: the memory
/// cache never evicts it, so every request for its key meets the same object.
pub struct Tile {
    key: TileKey,
    inner: Mutex<TileInner>,
    pending: AtomicUsize,
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl Tile {
    pub fn new(key: TileKey) -> Self {
        Self {
            key,
            inner: Mutex::new(TileInner {
                state: TileState::New,
                entry: None,
                placeholder: None,
                last_error: None,
                waiting: Vec::new(),
            }),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn address(&self) -> TileAddress {
        self.key.address
    }

    pub fn origin(&self) -> &str {
        &self.key.origin
    }

    pub fn state(&self) -> TileState {
        self.inner.lock().state
    }

    /// The tile's persisted bytes, if any are known.
    pub fn data(&self) -> Option<Bytes> {
        self.inner.lock().entry.as_ref().map(|e| e.data.clone())
    }

    pub fn entry(&self) -> Option<TileEntry> {
        self.inner.lock().entry.clone()
    }

    /// Stand-in image: a cross-zoom preview while loading, or the error image.
    pub fn placeholder(&self) -> Option<Arc<RgbaImage>> {
        self.inner.lock().placeholder.clone()
    }

    pub fn last_error(&self) -> Option<DownloadError> {
        self.inner.lock().last_error.clone()
    }

    /// Number of queued load jobs holding this tile.
    pub fn pending_loads(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the memory cache must keep this tile.
    pub fn is_pinned(&self) -> bool {
        self.pending_loads() > 0 || self.state() == TileState::Loading
    }

    pub(crate) fn add_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// `NEW → LOADING`. Returns false if the tile is in any other state.
    pub(crate) fn try_claim(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TileState::New {
            return false;
        }
        inner.state = TileState::Loading;
        inner.last_error = None;
        true
    }

    /// Attach a preview image; ignored once the tile has real data or failed.
    pub(crate) fn set_placeholder(&self, image: Arc<RgbaImage>) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, TileState::New | TileState::Loading) {
            return false;
        }
        inner.placeholder = Some(image);
        true
    }

    /// Install data and mark the tile loaded, returning the parked listeners.
    pub(crate) fn finish_loaded(&self, entry: TileEntry) -> Vec<Arc<dyn TileLoadListener>> {
        let mut inner = self.inner.lock();
        inner.state = TileState::Loaded;
        inner.entry = Some(entry);
        inner.placeholder = None;
        inner.last_error = None;
        std::mem::take(&mut inner.waiting)
    }

    /// Mark the attempt failed with an error image attached.
    pub(crate) fn finish_failed(
        &self,
        error: DownloadError,
        error_image: Arc<RgbaImage>,
    ) -> Vec<Arc<dyn TileLoadListener>> {
        let mut inner = self.inner.lock();
        inner.state = TileState::Error;
        inner.placeholder = Some(error_image);
        inner.last_error = Some(error);
        std::mem::take(&mut inner.waiting)
    }

    /// Return an interrupted tile to `NEW` so a later request can reload it.
    pub(crate) fn finish_interrupted(&self) -> Vec<Arc<dyn TileLoadListener>> {
        let mut inner = self.inner.lock();
        inner.state = TileState::New;
        std::mem::take(&mut inner.waiting)
    }

    /// Park a listener until the current owner finishes.
    ///
    /// If no load is in flight the listener is handed back together with the
    /// outcome it should be notified with right away.
    pub(crate) fn park_listener(
        &self,
        listener: Arc<dyn TileLoadListener>,
    ) -> Option<(Arc<dyn TileLoadListener>, LoadOutcome)> {
        let mut inner = self.inner.lock();
        let outcome = match inner.state {
            TileState::Loading => {
                inner.waiting.push(listener);
                return None;
            }
            TileState::Loaded | TileState::Expired => LoadOutcome::AlreadyLoaded,
            TileState::Error => LoadOutcome::Failed(
                inner
                    .last_error
                    .clone()
                    .unwrap_or(DownloadError::Transient("previous load failed".into())),
            ),
            TileState::New => LoadOutcome::Interrupted,
        };
        Some((listener, outcome))
    }

    /// `LOADED → EXPIRED` once the entry's freshness window has passed.
    pub fn mark_expired_if_stale(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        let stale = inner.state == TileState::Loaded
            && inner.entry.as_ref().is_some_and(|e| e.is_expired_at(now));
        if stale {
            inner.state = TileState::Expired;
        }
        stale
    }

    /// `EXPIRED → NEW` so the next load revalidates it. Old data stays visible.
    pub fn reset_expired(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TileState::Expired {
            inner.state = TileState::New;
            return true;
        }
        false
    }

    /// Allow an expired or failed tile to be claimed again. Known data stays
    /// visible until the reload replaces it.
    pub fn reset_for_reload(&self) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.state, TileState::Expired | TileState::Error) {
            inner.state = TileState::New;
            return true;
        }
        false
    }
}
