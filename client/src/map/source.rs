//! Where compressed tile images come from

use std::fs;
use std::io;
use std::path::PathBuf;

use super::config::CacheConfig;
use super::tile::TileKey;

/// Blocking provider of compressed tile bytes. Called from the loader
/// thread only, never with the cache lock held.
pub trait TileSource: Send + Sync {
    /// `Ok(None)` when the store has no image for `key`
    fn fetch(&self, key: &TileKey) -> io::Result<Option<Vec<u8>>>;

    /// Human readable location of `key`, for diagnostics
    fn describe(&self, key: &TileKey) -> String {
        key.to_string()
    }
}

/// Tiles laid out as `{root}/{z}/{x}/{y}.{ext}` on local disk
#[derive(Clone, Debug)]
pub struct DiskTileSource {
    root: PathBuf,
    extension: String,
    zoom_digits: usize,
}

impl DiskTileSource {
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            root: root.into(),
            extension: extension.to_string(),
            zoom_digits: 0,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            root: config.root.clone(),
            extension: config.extension.clone(),
            zoom_digits: config.zoom_digits,
        }
    }

    /// File path for a tile
    pub fn tile_path(&self, key: &TileKey) -> PathBuf {
        self.root
            .join(format!("{:0width$}", key.z, width = self.zoom_digits))
            .join(key.x.to_string())
            .join(format!("{}.{}", key.y, self.extension))
    }
}

impl TileSource for DiskTileSource {
    fn fetch(&self, key: &TileKey) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.tile_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn describe(&self, key: &TileKey) -> String {
        self.tile_path(key).display().to_string()
    }
}
