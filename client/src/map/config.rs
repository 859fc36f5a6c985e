//! Cache configuration

use std::path::PathBuf;

/// Default number of tiles allowed to hold decoded imagery
pub const DEFAULT_MAX_RESIDENT: usize = 256;

/// Deepest zoom level the prefetcher will request
pub const DEFAULT_MAX_ZOOM: u8 = 19;

/// Which related tiles are requested when a tile becomes visible
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PrefetchPolicy {
    /// The (up to) eight same-zoom tiles around it
    pub neighbors: bool,
    /// The tile one zoom level up
    pub parent: bool,
    /// The four tiles one zoom level down
    pub children: bool,
}

impl PrefetchPolicy {
    pub fn none() -> Self {
        Self {
            neighbors: false,
            parent: false,
            children: false,
        }
    }
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            neighbors: true,
            parent: true,
            children: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Root of the `{z}/{x}/{y}.{ext}` tree
    pub root: PathBuf,
    /// Image file extension, without the dot
    pub extension: String,
    /// Zero-pad the zoom directory to this many digits (0 = no padding)
    pub zoom_digits: usize,
    pub max_resident: usize,
    pub max_zoom: u8,
    pub prefetch: PrefetchPolicy,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>, max_resident: usize) -> Self {
        Self {
            root: root.into(),
            max_resident,
            ..Self::default()
        }
    }

    pub fn with_prefetch(mut self, prefetch: PrefetchPolicy) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_max_zoom(mut self, max_zoom: u8) -> Self {
        self.max_zoom = max_zoom;
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn with_zoom_digits(mut self, digits: usize) -> Self {
        self.zoom_digits = digits;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tiles"),
            extension: "png".to_string(),
            zoom_digits: 0,
            max_resident: DEFAULT_MAX_RESIDENT,
            max_zoom: DEFAULT_MAX_ZOOM,
            prefetch: PrefetchPolicy::default(),
        }
    }
}
