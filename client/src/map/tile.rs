//! Tile addressing and texture-coordinate math
//! Uses the z/x/y scheme of slippy-map tile stores (y grows southwards)

use std::fmt;

/// Unique identifier for a map tile
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TileKey {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Direct parent one zoom level up, `None` at the root
    pub fn parent(&self) -> Option<TileKey> {
        self.parent_at_zoom(self.z.checked_sub(1)?)
    }

    /// Get parent tile at a lower zoom level
    pub fn parent_at_zoom(&self, target_z: u8) -> Option<TileKey> {
        if target_z >= self.z {
            return None;
        }
        let diff = self.z - target_z;
        Some(TileKey {
            x: self.x >> diff,
            y: self.y >> diff,
            z: target_z,
        })
    }

    /// The four tiles covering this one at the next zoom level. Only
    /// meaningful below [`MAX_ADDRESSABLE_ZOOM`].
    pub fn children(&self) -> [TileKey; 4] {
        let (x, y, z) = (self.x << 1, self.y << 1, self.z + 1);
        [
            TileKey::new(z, x, y),
            TileKey::new(z, x, y + 1),
            TileKey::new(z, x + 1, y),
            TileKey::new(z, x + 1, y + 1),
        ]
    }

    /// Same-zoom tiles around this one. X wraps around the antimeridian,
    /// rows outside the grid are skipped.
    pub fn neighbors(&self) -> Vec<TileKey> {
        let mut keys = Vec::with_capacity(8);
        for dy in -1_i64..=1 {
            let ty = self.y as i64 + dy;
            if !is_valid_tile_y(ty, self.z) {
                continue;
            }
            let Ok(ty) = u32::try_from(ty) else {
                continue;
            };
            for dx in -1_i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let Some(tx) = wrap_tile_x(self.x as i64 + dx, self.z) else {
                    continue;
                };
                let key = TileKey::new(self.z, tx, ty);
                // At zoom 0 and 1 wrapping folds neighbours onto each other
                if key != *self && !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Quadrant bits selecting which quarter of the parent covers this tile
    pub fn quadrant(&self) -> (u32, u32) {
        (self.x & 1, self.y & 1)
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Deepest zoom whose whole grid a `u32` coordinate can address
pub const MAX_ADDRESSABLE_ZOOM: u8 = 32;

/// Tiles along one axis at `zoom`, `None` once that no longer fits an `i64`
fn grid_span(zoom: u8) -> Option<i64> {
    1_i64.checked_shl(u32::from(zoom)).filter(|n| *n > 0)
}

/// Wrap X coordinate for infinite horizontal scrolling. `None` when the
/// result does not fit a tile coordinate.
pub fn wrap_tile_x(x: i64, zoom: u8) -> Option<u32> {
    let wrapped = match grid_span(zoom) {
        Some(max_tiles) => x.rem_euclid(max_tiles),
        None => x,
    };
    u32::try_from(wrapped).ok()
}

/// Check if Y coordinate is valid (no wrapping for latitude)
pub fn is_valid_tile_y(y: i64, zoom: u8) -> bool {
    y >= 0 && grid_span(zoom).is_none_or(|max_tiles| y < max_tiles)
}

/// Normalized texture sub-rectangle `(u0, v0)..(u1, v1)`.
///
/// The v axis points up (image rows are stored bottom row first) while tile
/// y points down, so the northern half of a tile is `v` in `[0.5, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UvRect {
    pub u0: f32,
    pub v0: f32,
    pub u1: f32,
    pub v1: f32,
}

impl UvRect {
    pub const FULL: UvRect = UvRect {
        u0: 0.0,
        v0: 0.0,
        u1: 1.0,
        v1: 1.0,
    };

    pub fn width(&self) -> f32 {
        self.u1 - self.u0
    }

    pub fn height(&self) -> f32 {
        self.v1 - self.v0
    }

    /// Quarter of `self` covered by the child tile `child`
    pub fn child_quadrant(&self, child: &TileKey) -> UvRect {
        let (qx, qy) = child.quadrant();
        let half_w = self.width() * 0.5;
        let half_h = self.height() * 0.5;
        let u0 = self.u0 + qx as f32 * half_w;
        let v0 = self.v0 + (qy ^ 1) as f32 * half_h;
        UvRect {
            u0,
            v0,
            u1: u0 + half_w,
            v1: v0 + half_h,
        }
    }

    pub fn as_tuple(&self) -> (f32, f32, f32, f32) {
        (self.u0, self.v0, self.u1, self.v1)
    }
}

impl Default for UvRect {
    fn default() -> Self {
        Self::FULL
    }
}

/// Calculate sub-region UV coordinates when using an ancestor tile as fallback
pub fn calculate_sub_region(target: &TileKey, ancestor: &TileKey) -> UvRect {
    if ancestor.z >= target.z {
        return UvRect::FULL;
    }

    let zoom_diff = target.z - ancestor.z;
    let subdivisions = 1_u32 << zoom_diff;

    let local_x = target.x % subdivisions;
    let local_y = subdivisions - 1 - target.y % subdivisions;

    let size = 1.0 / subdivisions as f32;
    let u0 = local_x as f32 * size;
    let v0 = local_y as f32 * size;

    UvRect {
        u0,
        v0,
        u1: u0 + size,
        v1: v0 + size,
    }
}
