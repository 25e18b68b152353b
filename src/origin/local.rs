//! Local tile archive origin.
//!
//! Serves `{root}/{z}/{x}/{y}.{ext}` files with HTTP-like semantics so the
//! download engine can treat archives and servers the same way: missing files
//! answer 404, modification times become `Last-Modified`, and conditional
//! headers are honoured.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use http::header::{
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use http::StatusCode;

use crate::error::DownloadError;
use crate::tile::TileAddress;

use super::{
    format_http_date, parse_http_date, OriginConnection, OriginProvider, OriginRequest,
    OriginResponse, UpdateStrategy,
};

/// File extensions probed for each tile, in order.
const TILE_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

/// Directory tree of pre-rendered tiles.
pub struct LocalArchiveOrigin {
    name: String,
    root: PathBuf,
    strategy: UpdateStrategy,
}

impl LocalArchiveOrigin {
    /// Archives default to Last-Modified revalidation against file mtimes.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            strategy: UpdateStrategy::LastModified,
        }
    }

    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, address: TileAddress) -> Option<(PathBuf, &'static str)> {
        let dir = self
            .root
            .join(address.zoom.to_string())
            .join(address.x.to_string());
        TILE_EXTENSIONS.iter().find_map(|(ext, mime)| {
            let path = dir.join(format!("{}.{}", address.y, ext));
            path.is_file().then_some((path, *mime))
        })
    }
}

impl OriginProvider for LocalArchiveOrigin {
    fn name(&self) -> &str {
        &self.name
    }

    fn update_strategy(&self) -> UpdateStrategy {
        self.strategy
    }

    fn open_connection(
        &self,
        address: TileAddress,
    ) -> Result<Option<Box<dyn OriginConnection>>, DownloadError> {
        Ok(self.locate(address).map(|(path, content_type)| {
            Box::new(ArchiveConnection { path, content_type }) as Box<dyn OriginConnection>
        }))
    }
}

struct ArchiveConnection {
    path: PathBuf,
    content_type: &'static str,
}

impl ArchiveConnection {
    /// Weak validator derived from size and mtime.
    fn etag(len: u64, modified: DateTime<Utc>) -> String {
        format!("W/\"{:x}-{:x}\"", len, modified.timestamp())
    }
}

impl OriginConnection for ArchiveConnection {
    fn execute(&mut self, request: &OriginRequest) -> Result<OriginResponse, DownloadError> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(OriginResponse::new(StatusCode::NOT_FOUND));
            }
            Err(e) => return Err(DownloadError::Transient(e.to_string())),
        };

        let modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let etag = Self::etag(metadata.len(), modified);
        let last_modified = format_http_date(modified);

        let unchanged_by_etag = request
            .header(&IF_NONE_MATCH)
            .is_some_and(|v| v.trim() == etag);
        let unchanged_by_date = request
            .header(&IF_MODIFIED_SINCE)
            .and_then(parse_http_date)
            .is_some_and(|since| modified.timestamp() <= since.timestamp());

        if unchanged_by_etag || unchanged_by_date {
            return Ok(OriginResponse::new(StatusCode::NOT_MODIFIED)
                .with_header(ETAG, &etag)
                .with_header(LAST_MODIFIED, &last_modified));
        }

        let mut response = OriginResponse::new(StatusCode::OK)
            .with_header(CONTENT_TYPE, self.content_type)
            .with_header(CONTENT_LENGTH, &metadata.len().to_string())
            .with_header(ETAG, &etag)
            .with_header(LAST_MODIFIED, &last_modified);

        if !request.is_head() {
            let body = fs::read(&self.path).map_err(|e| DownloadError::Transient(e.to_string()))?;
            response = response.with_body(body);
        }

        Ok(response)
    }
}
