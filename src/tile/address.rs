//! Tile identity.
//!
//! A [`TileAddress`] names a tile within one origin's pyramid; a [`TileKey`]
//! adds the origin name and is what the memory cache is keyed by.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Highest zoom level whose coordinates still fit in `u32`.
pub const MAX_ZOOM: u8 = 31;

/// Immutable `(zoom, x, y)` tile coordinate.
///
/// Range checking (`x, y < 2^zoom`) belongs to the coordinate layer; this
/// type only refuses to derive addresses that would overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileAddress {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    pub const fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }

    /// The ancestor `levels` zoom levels coarser, if it exists.
    pub fn ancestor(&self, levels: u8) -> Option<TileAddress> {
        if levels > self.zoom || levels >= 32 {
            return None;
        }
        Some(TileAddress::new(
            self.zoom - levels,
            self.x >> levels,
            self.y >> levels,
        ))
    }

    /// Top-left descendant `levels` zoom levels finer.
    fn first_descendant(&self, levels: u8) -> Option<TileAddress> {
        let zoom = self.zoom.checked_add(levels)?;
        if zoom > MAX_ZOOM {
            return None;
        }
        let x = self.x.checked_mul(1u32 << levels)?;
        let y = self.y.checked_mul(1u32 << levels)?;
        Some(TileAddress::new(zoom, x, y))
    }

    /// All `2^levels × 2^levels` descendants, row-major.
    pub fn descendants(&self, levels: u8) -> Option<Vec<TileAddress>> {
        let first = self.first_descendant(levels)?;
        let factor = 1u32 << levels;
        let mut tiles = Vec::with_capacity((factor * factor) as usize);
        for dy in 0..factor {
            for dx in 0..factor {
                tiles.push(TileAddress::new(first.zoom, first.x + dx, first.y + dy));
            }
        }
        Some(tiles)
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Cache identity: origin name plus address.
///
/// Displays as `"{zoom}/{x}/{y}@{origin}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub origin: Arc<str>,
    pub address: TileAddress,
}

impl TileKey {
    pub fn new(origin: impl Into<Arc<str>>, address: TileAddress) -> Self {
        Self {
            origin: origin.into(),
            address,
        }
    }

    /// Key of the same tile position in another zoom level of this origin.
    pub fn with_address(&self, address: TileAddress) -> Self {
        Self {
            origin: self.origin.clone(),
            address,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.origin)
    }
}
