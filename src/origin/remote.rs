//! Remote tile server origin over blocking HTTP.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue, StatusCode};
use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use crate::error::{DownloadError, ProtocolViolation};
use crate::tile::TileAddress;

use super::{OriginConnection, OriginProvider, OriginRequest, OriginResponse, UpdateStrategy};

/// Upper bound on a single tile body; anything larger is not a map tile.
const MAX_TILE_BYTES: u64 = 32 * 1024 * 1024;

/// Tile server addressed by a URL template.
///
/// The template may contain `{z}` (or `{zoom}`), `{x}` and `{y}`:
///
/// ```
/// use atlas_tiles::origin::{HttpOrigin, OriginProvider};
///
/// let origin = HttpOrigin::new("osm", "https://tile.example.org/{z}/{x}/{y}.png").unwrap();
/// assert_eq!(origin.name(), "osm");
/// ```
pub struct HttpOrigin {
    name: String,
    url_template: String,
    strategy: UpdateStrategy,
    agents: Arc<AgentPool>,
}

/// HTTP agents keyed by `(connect, read)` timeouts, so each request runs with
/// the timeouts it carries while connections are still pooled.
#[derive(Default)]
struct AgentPool {
    agents: Mutex<HashMap<(Duration, Duration), ureq::Agent>>,
}

impl AgentPool {
    fn agent(&self, connect: Duration, read: Duration) -> ureq::Agent {
        self.agents
            .lock()
            .entry((connect, read))
            .or_insert_with(|| {
                debug!(connect_ms = connect.as_millis() as u64, read_ms = read.as_millis() as u64, "Building HTTP agent");
                ureq::AgentBuilder::new()
                    .timeout_connect(connect)
                    .timeout_read(read)
                    .build()
            })
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.agents.lock().len()
    }
}

impl HttpOrigin {
    /// Create an origin, validating that the template expands to a URL.
    pub fn new(name: impl Into<String>, url_template: impl Into<String>) -> Result<Self, String> {
        let url_template = url_template.into();
        let sample = expand_template(&url_template, TileAddress::new(0, 0, 0));
        Url::parse(&sample).map_err(|e| format!("invalid URL template {url_template:?}: {e}"))?;

        Ok(Self {
            name: name.into(),
            url_template,
            strategy: UpdateStrategy::None,
            agents: Arc::default(),
        })
    }

    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Concrete URL for a tile.
    pub fn tile_url(&self, address: TileAddress) -> String {
        expand_template(&self.url_template, address)
    }
}

fn expand_template(template: &str, address: TileAddress) -> String {
    template
        .replace("{zoom}", &address.zoom.to_string())
        .replace("{z}", &address.zoom.to_string())
        .replace("{x}", &address.x.to_string())
        .replace("{y}", &address.y.to_string())
}

impl OriginProvider for HttpOrigin {
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
        let url = self.tile_url(address);
        if Url::parse(&url).is_err() {
            return Ok(None);
        }
        Ok(Some(Box::new(HttpConnection {
            agents: Arc::clone(&self.agents),
            url,
        })))
    }
}

struct HttpConnection {
    agents: Arc<AgentPool>,
    url: String,
}

impl OriginConnection for HttpConnection {
    fn execute(&mut self, request: &OriginRequest) -> Result<OriginResponse, DownloadError> {
        let mut call = self
            .agents
            .agent(request.connect_timeout, request.read_timeout)
            .request(request.method.as_str(), &self.url);
        for (name, value) in &request.headers {
            if let Ok(value) = value.to_str() {
                call = call.set(name.as_str(), value);
            }
        }

        trace!(url = %self.url, method = %request.method, "origin request");

        let response = match call.call() {
            Ok(response) => response,
            // 4xx/5xx still carry headers the engine wants to see
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(e)) => return Err(DownloadError::Transient(e.to_string())),
        };

        let code = response.status();
        let status = StatusCode::from_u16(code)
            .map_err(|_| DownloadError::Protocol(ProtocolViolation::HttpStatus(code)))?;

        let mut result = OriginResponse::new(status);
        for name in response.headers_names() {
            let Some(value) = response.header(&name) else {
                continue;
            };
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                result.headers.append(name, value);
            }
        }

        if !request.is_head() {
            let body = read_body(response.into_reader(), MAX_TILE_BYTES)
                .map_err(|e| DownloadError::Transient(format!("reading {}: {}", self.url, e)))?
                .ok_or(ProtocolViolation::BodyTooLarge(MAX_TILE_BYTES))?;
            result.body = body.into();
        }

        Ok(result)
    }
}

/// Read at most `limit` bytes. `None` means the body is longer than that.
fn read_body(reader: impl Read, limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    reader.take(limit + 1).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(body))
}
