use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::address::TileAddress;

/// Persisted tile bytes plus freshness metadata.
///
/// `data` is always present; a zero-length payload records a tile the origin
/// reported as empty. Writes replace the whole entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEntry {
    pub address: TileAddress,
    pub data: Bytes,
    pub time_downloaded: DateTime<Utc>,
    pub time_last_modified: Option<DateTime<Utc>>,
    pub time_expires: DateTime<Utc>,
    pub etag: Option<String>,
}

impl TileEntry {
    /// Entry downloaded at `downloaded` that stays fresh until `expires`.
    pub fn new(
        address: TileAddress,
        data: impl Into<Bytes>,
        downloaded: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            address,
            data: data.into(),
            time_downloaded: downloaded,
            time_last_modified: None,
            time_expires: expires,
            etag: None,
        }
    }

    /// Entry recording that the origin has no content for this address.
    pub fn empty(address: TileAddress, downloaded: DateTime<Utc>, expires: DateTime<Utc>) -> Self {
        Self::new(address, Bytes::new(), downloaded, expires)
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_last_modified(mut self, last_modified: Option<DateTime<Utc>>) -> Self {
        self.time_last_modified = last_modified;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.time_expires
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Same payload and validators with renewed download/expiry bookkeeping.
    pub fn refreshed(&self, downloaded: DateTime<Utc>, expires: DateTime<Utc>) -> Self {
        Self {
            time_downloaded: downloaded,
            time_expires: expires,
            ..self.clone()
        }
    }
}
