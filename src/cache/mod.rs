//! Memory tile cache fronting the persistent store.
//!
//! # Components
//!
//! - [`MemoryTileCache`]: bounded, access-ordered map of runtime [`Tile`](crate::tile::Tile)s
//!   with atomic claim for load jobs
//! - Placeholder synthesis: previews built from finer or coarser zoom levels
//! - [`error_image`]: shared stand-in for tiles whose load failed

mod memory;
mod placeholder;

pub use memory::{Claim, MemoryTileCache, DEFAULT_MEMORY_CACHE_CAPACITY};
pub use placeholder::{error_image, ERROR_TILE_SIZE, MAX_COARSER_LEVELS, MAX_FINER_LEVELS};
