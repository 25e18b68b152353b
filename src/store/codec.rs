//! Byte layouts shared by the store backends.
//!
//! Keys are 9 bytes, big-endian so that LMDB iterates tiles ordered by
//! zoom, then column, then row:
//!
//! ```text
//! ┌──────┬────────────┬────────────┐
//! │ zoom │   x (u32)  │   y (u32)  │
//! │  1B  │     4B     │     4B     │
//! └──────┴────────────┴────────────┘
//! ```
//!
//! LMDB values carry a length-prefixed JSON header followed by the raw tile
//! bytes, so the payload is never re-encoded.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tile::{TileAddress, TileEntry};

pub(crate) const KEY_LEN: usize = 9;

/// Freshness metadata persisted next to the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryMeta {
    pub downloaded: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub expires: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl EntryMeta {
    pub fn of(entry: &TileEntry) -> Self {
        Self {
            downloaded: entry.time_downloaded,
            last_modified: entry.time_last_modified,
            expires: entry.time_expires,
            etag: entry.etag.clone(),
        }
    }

    pub fn into_entry(self, address: TileAddress, data: Bytes) -> TileEntry {
        TileEntry::new(address, data, self.downloaded, self.expires)
            .with_last_modified(self.last_modified)
            .with_etag(self.etag)
    }
}

pub(crate) fn encode_key(address: TileAddress) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[0] = address.zoom;
    key[1..5].copy_from_slice(&address.x.to_be_bytes());
    key[5..9].copy_from_slice(&address.y.to_be_bytes());
    key
}

#[cfg(test)]
pub(crate) fn decode_key(key: &[u8]) -> Option<TileAddress> {
    if key.len() != KEY_LEN {
        return None;
    }
    let x = u32::from_be_bytes(key[1..5].try_into().ok()?);
    let y = u32::from_be_bytes(key[5..9].try_into().ok()?);
    Some(TileAddress::new(key[0], x, y))
}

pub(crate) fn encode_value(entry: &TileEntry) -> Result<Vec<u8>, String> {
    let meta = serde_json::to_vec(&EntryMeta::of(entry)).map_err(|e| e.to_string())?;
    let meta_len = u32::try_from(meta.len()).map_err(|_| "metadata too large".to_string())?;

    let mut value = Vec::with_capacity(4 + meta.len() + entry.data.len());
    value.extend_from_slice(&meta_len.to_le_bytes());
    value.extend_from_slice(&meta);
    value.extend_from_slice(&entry.data);
    Ok(value)
}

pub(crate) fn decode_value(address: TileAddress, value: &[u8]) -> Result<TileEntry, String> {
    if value.len() < 4 {
        return Err(format!("value of {} bytes has no header", value.len()));
    }
    let meta_len = u32::from_le_bytes([value[0], value[1], value[2], value[3]]) as usize;
    let body = &value[4..];
    if body.len() < meta_len {
        return Err(format!(
            "header declares {} bytes but only {} remain",
            meta_len,
            body.len()
        ));
    }
    let meta: EntryMeta = serde_json::from_slice(&body[..meta_len]).map_err(|e| e.to_string())?;
    Ok(meta.into_entry(address, Bytes::copy_from_slice(&body[meta_len..])))
}

/// SHA-256 of the payload, used to share identical images between tiles.
pub(crate) fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
