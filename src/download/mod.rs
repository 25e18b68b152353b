//! Download/update engine.
//!
//! Decides per request whether stored bytes can be served, whether an
//! expired entry can be revalidated cheaply, or whether a full download is
//! needed, and is the single writer of network results into the store.
//!
//! ```text
//!            ┌──────────── fresh ────────────▶ TileData(Store)
//!  store ────┤
//!   get      ├── expired ─▶ strategy ─┬─ unchanged ─▶ refresh ─▶ TileData(Revalidated)
//!            │                        └─ changed ───┐
//!            └── missing ───────────────────────────┴─▶ GET ─▶ validate ─▶ put ─▶ TileData(Downloaded)
//! ```

mod engine;
mod expiry;
mod validate;

pub use engine::{
    DataSource, DownloadSettings, LoadMode, TileData, TileDownloader, DEFAULT_USER_AGENT,
};
pub use expiry::{
    ExpirationPolicy, DEFAULT_EXPIRATION_DAYS, MAX_EXPIRATION_DAYS, MIN_EXPIRATION_DAYS,
};
pub use validate::validate_response;
