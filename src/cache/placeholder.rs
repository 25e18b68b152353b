//! Cross-zoom placeholder synthesis and the error image.
//!
//! While a tile loads, a preview is built from tiles already in memory:
//!
//! ```text
//!  finer (≤ 2 levels)                 coarser (≤ 4 levels)
//!  ┌────┬────┐                        ┌──────────────┐
//!  │ c0 │ c1 │  each child scaled     │   ancestor   │  crop the target's
//!  ├────┼────┤  by 1/2^d and          │  ┌──┐        │  sub-region and scale
//!  │ c2 │ c3 │  placed in its cell    │  └──┘        │  it up by 2^d
//!  └────┴────┘                        └──────────────┘
//! ```
//!
//! Finer levels are tried first and only if every child is `LOADED`.

use std::sync::{Arc, OnceLock};

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use tracing::debug;

use crate::tile::{Tile, TileKey, TileState};

use super::memory::MemoryTileCache;

/// Finer zoom levels searched for children.
pub const MAX_FINER_LEVELS: u8 = 2;

/// Coarser zoom levels searched for an ancestor.
pub const MAX_COARSER_LEVELS: u8 = 4;

/// Edge length of the generated error image.
pub const ERROR_TILE_SIZE: u32 = 256;

impl MemoryTileCache {
    /// Build a preview for `key` from neighbouring zoom levels, if possible.
    pub fn synthesize_placeholder(&self, key: &TileKey) -> Option<RgbaImage> {
        (1..=MAX_FINER_LEVELS)
            .find_map(|levels| self.from_descendants(key, levels))
            .or_else(|| {
                (1..=MAX_COARSER_LEVELS).find_map(|levels| self.from_ancestor(key, levels))
            })
    }

    /// Synthesize and attach a placeholder to `tile`. The tile keeps its state.
    pub fn attach_placeholder(&self, tile: &Tile) -> bool {
        match self.synthesize_placeholder(tile.key()) {
            Some(image) => {
                debug!(key = %tile.key(), "Attached cross-zoom placeholder");
                tile.set_placeholder(Arc::new(image))
            }
            None => false,
        }
    }

    fn from_descendants(&self, key: &TileKey, levels: u8) -> Option<RgbaImage> {
        let addresses = key.address.descendants(levels)?;
        let keys: Vec<TileKey> = addresses.iter().map(|a| key.with_address(*a)).collect();

        let tiles = self
            .peek_many(&keys)
            .into_iter()
            .collect::<Option<Vec<Arc<Tile>>>>()?;
        if tiles.iter().any(|t| t.state() != TileState::Loaded) {
            return None;
        }

        let children = tiles
            .iter()
            .map(|t| decode(t))
            .collect::<Option<Vec<RgbaImage>>>()?;

        let size = children[0].width();
        let factor = 1u32 << levels;
        let cell = size / factor;
        if cell == 0 {
            return None;
        }

        let mut canvas = RgbaImage::new(size, size);
        for (i, child) in children.iter().enumerate() {
            let scaled = imageops::resize(child, cell, cell, FilterType::Triangle);
            let dx = (i as u32 % factor) * cell;
            let dy = (i as u32 / factor) * cell;
            imageops::overlay(&mut canvas, &scaled, dx as i64, dy as i64);
        }
        Some(canvas)
    }

    fn from_ancestor(&self, key: &TileKey, levels: u8) -> Option<RgbaImage> {
        let address = key.address;
        let ancestor_address = address.ancestor(levels)?;
        let ancestor = self.peek(&key.with_address(ancestor_address))?;
        if ancestor.state() != TileState::Loaded {
            return None;
        }
        let image = decode(&ancestor)?;

        let (width, height) = image.dimensions();
        let sub_w = width >> levels;
        let sub_h = height >> levels;
        if sub_w == 0 || sub_h == 0 {
            return None;
        }
        let offset_x = (address.x - (ancestor_address.x << levels)) * sub_w;
        let offset_y = (address.y - (ancestor_address.y << levels)) * sub_h;

        let region = imageops::crop_imm(&image, offset_x, offset_y, sub_w, sub_h).to_image();
        Some(imageops::resize(&region, width, height, FilterType::Triangle))
    }
}

fn decode(tile: &Tile) -> Option<RgbaImage> {
    let data = tile.data()?;
    if data.is_empty() {
        return None;
    }
    image::load_from_memory(&data).ok().map(|img| img.to_rgba8())
}

/// Shared image attached to tiles whose load failed.
pub fn error_image() -> Arc<RgbaImage> {
    static IMAGE: OnceLock<Arc<RgbaImage>> = OnceLock::new();
    IMAGE
        .get_or_init(|| {
            let size = ERROR_TILE_SIZE;
            let background = Rgba([240, 228, 228, 255]);
            let stroke = Rgba([200, 40, 40, 255]);
            Arc::new(RgbaImage::from_fn(size, size, |x, y| {
                let on_diagonal = x.abs_diff(y) <= 1 || (x + y).abs_diff(size - 1) <= 1;
                let on_border = x < 2 || y < 2 || x >= size - 2 || y >= size - 2;
                if on_diagonal || on_border {
                    stroke
                } else {
                    background
                }
            }))
        })
        .clone()
}
