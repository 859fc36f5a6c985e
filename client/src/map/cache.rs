//! Admission bound for decoded tile payloads
//!
//! Tracks which tiles hold pixels or a realized texture and picks eviction
//! victims among tiles that are no longer shown, oldest-hidden first.

use std::collections::HashSet;

use super::store::TileHandle;

/// Resident payload bookkeeping with hide-order LRU
#[derive(Debug)]
pub struct Residency {
    resident: HashSet<TileHandle>,
    /// Resident tiles that are not shown, least recently hidden first
    hidden_order: Vec<TileHandle>,
    max_resident: usize,
    evictions: u64,
}

impl Residency {
    /// Create a new bound
    /// - max_resident: Maximum number of tiles holding decoded imagery
    pub fn new(max_resident: usize) -> Self {
        Self {
            resident: HashSet::with_capacity(max_resident),
            hidden_order: Vec::with_capacity(max_resident),
            max_resident,
            evictions: 0,
        }
    }

    pub fn contains(&self, handle: &TileHandle) -> bool {
        self.resident.contains(handle)
    }

    /// Record a freshly decoded payload and return the tiles whose payload
    /// must be dropped to get back under the bound. The new tile itself may
    /// be among them when it is not shown.
    pub fn admit(&mut self, handle: TileHandle, shown: bool) -> Vec<TileHandle> {
        if self.resident.insert(handle) && !shown {
            self.hidden_order.push(handle);
        }
        self.enforce()
    }

    /// Tile became shown; it is no longer an eviction candidate
    pub fn mark_shown(&mut self, handle: TileHandle) {
        if let Some(pos) = self.hidden_order.iter().position(|h| h == &handle) {
            self.hidden_order.remove(pos);
        }
    }

    /// Tile stopped being shown; it becomes the newest eviction candidate
    pub fn mark_hidden(&mut self, handle: TileHandle) -> Vec<TileHandle> {
        if !self.resident.contains(&handle) {
            return Vec::new();
        }
        self.mark_shown(handle);
        self.hidden_order.push(handle);
        self.enforce()
    }

    /// Evict the oldest hidden tiles while over capacity
    fn enforce(&mut self) -> Vec<TileHandle> {
        let mut victims = Vec::new();
        while self.resident.len() > self.max_resident {
            if self.hidden_order.is_empty() {
                log::warn!(
                    "{} shown tiles exceed the resident bound of {}",
                    self.resident.len(),
                    self.max_resident
                );
                break;
            }
            let oldest = self.hidden_order.remove(0);
            self.resident.remove(&oldest);
            self.evictions += 1;
            log::debug!("Evicted tile payload {:?}", oldest);
            victims.push(oldest);
        }
        victims
    }

    pub fn len(&self) -> usize {
        self.resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resident.is_empty()
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Drop all bookkeeping
    pub fn clear(&mut self) {
        self.resident.clear();
        self.hidden_order.clear();
    }
}

/// Cache statistics for debugging/UI
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub tile_count: usize,
    pub resident_count: usize,
    pub max_resident: usize,
    pub evictions: u64,
    pub visible_queue: usize,
    pub invisible_queue: usize,
    pub refresh_queue: usize,
    pub new_tiles: usize,
    pub textured_tiles: usize,
    pub referring_tiles: usize,
    pub no_data_tiles: usize,
}

impl CacheStats {
    pub fn resident_usage_percent(&self) -> f32 {
        if self.max_resident == 0 {
            0.0
        } else {
            (self.resident_count as f32 / self.max_resident as f32) * 100.0
        }
    }

    /// Tiles still waiting for the loader
    pub fn pending(&self) -> usize {
        self.visible_queue + self.invisible_queue + self.refresh_queue
    }
}
