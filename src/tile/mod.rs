//! Tile identity, persisted entries and the runtime tile object.
//!
//! # Components
//!
//! - [`TileAddress`]: `(zoom, x, y)` coordinate within one origin
//! - [`TileKey`]: origin name plus address, rendered as `"{zoom}/{x}/{y}@{origin}"`
//! - [`TileEntry`]: tile bytes with download, modification and expiry times and an ETag
//! - [`Tile`]: shared runtime object carrying a [`TileState`], the loaded entry and
//!   an optional placeholder image
//!
//! # State Machine
//!
//! ```text
//!   NEW ──claim──▶ LOADING ──▶ LOADED ──(freshness passed)──▶ EXPIRED
//!    ▲                │
//!    │                ├──────▶ ERROR
//!    └─(interrupted)──┘
//! ```

mod address;
mod entry;
mod state;

pub use address::{TileAddress, TileKey, MAX_ZOOM};
pub use entry::TileEntry;
pub use state::{Tile, TileState};
