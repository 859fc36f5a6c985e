//! Tile registry: one `Tile` per key, addressed by a stable handle

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbImage;

use super::tile::{TileKey, UvRect};

/// Stable reference to a tile owned by the store. Handles are never reused
/// while the cache lives.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TileHandle(u32);

impl TileHandle {
    pub(crate) fn from_index(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Public view of a tile's lifecycle stage
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TileStatus {
    New,
    HasTexture,
    RefersToTexture,
    NoData,
}

/// Imagery held by a `HasTexture` tile
pub enum TexturePayload<T> {
    /// CPU pixels waiting for the render thread
    Decoded(Arc<RgbImage>),
    /// Uploaded; pixels dropped
    Realized(T),
    /// Dropped by the admission bound, must be decoded again before use
    Evicted,
}

impl<T> TexturePayload<T> {
    pub fn is_resident(&self) -> bool {
        !matches!(self, TexturePayload::Evicted)
    }
}

/// Per-tile lifecycle. Leaves `New` exactly once and never returns to it.
pub enum TileState<T> {
    New,
    HasTexture(TexturePayload<T>),
    RefersToTexture { ancestor: TileHandle, uv: UvRect },
    NoData,
}

impl<T> TileState<T> {
    pub fn status(&self) -> TileStatus {
        match self {
            TileState::New => TileStatus::New,
            TileState::HasTexture(_) => TileStatus::HasTexture,
            TileState::RefersToTexture { .. } => TileStatus::RefersToTexture,
            TileState::NoData => TileStatus::NoData,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, TileState::New)
    }
}

pub struct Tile<T> {
    pub key: TileKey,
    pub state: TileState<T>,
    pub visible: bool,
    /// Visible `RefersToTexture` tiles drawing from this tile's texture
    pub visible_refs: u32,
}

impl<T> Tile<T> {
    fn new(key: TileKey) -> Self {
        Self {
            key,
            state: TileState::New,
            visible: false,
            visible_refs: 0,
        }
    }

    /// Visible itself or needed by a visible descendant
    pub fn is_shown(&self) -> bool {
        self.visible || self.visible_refs > 0
    }

    pub fn uv(&self) -> UvRect {
        match &self.state {
            TileState::RefersToTexture { uv, .. } => *uv,
            _ => UvRect::FULL,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(&self.state, TileState::HasTexture(payload) if payload.is_resident())
    }
}

/// Deduplicated arena of every tile ever requested
pub struct TileStore<T> {
    tiles: Vec<Tile<T>>,
    index: HashMap<TileKey, TileHandle>,
}

impl<T> TileStore<T> {
    pub fn new() -> Self {
        Self {
            tiles: Vec::new(),
            index: HashMap::with_capacity(256),
        }
    }

    pub fn find(&self, key: &TileKey) -> Option<TileHandle> {
        self.index.get(key).copied()
    }

    /// Look a key up, creating a `New` tile if unseen. The flag reports
    /// whether the tile was created by this call.
    pub fn get_or_insert(&mut self, key: TileKey) -> (TileHandle, bool) {
        if let Some(handle) = self.find(&key) {
            return (handle, false);
        }
        let index = u32::try_from(self.tiles.len()).unwrap_or_else(|_| {
            log::error!("Tile store exhausted at {} tiles", self.tiles.len());
            panic!("tile store cannot address more tiles");
        });
        let handle = TileHandle::from_index(index);
        self.tiles.push(Tile::new(key));
        self.index.insert(key, handle);
        (handle, true)
    }

    pub fn tile(&self, handle: TileHandle) -> &Tile<T> {
        &self.tiles[handle.index()]
    }

    pub fn tile_mut(&mut self, handle: TileHandle) -> &mut Tile<T> {
        &mut self.tiles[handle.index()]
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TileHandle, &Tile<T>)> {
        self.tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| (TileHandle::from_index(i as u32), tile))
    }
}

impl<T> Default for TileStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
