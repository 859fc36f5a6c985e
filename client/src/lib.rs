//! Tile texture cache for a pannable, zoomable slippy map.
//!
//! Tiles are addressed by zoom/x/y, loaded from disk on a background thread
//! (on-screen tiles first), and tiles without imagery borrow a cropped
//! region of their nearest textured ancestor.

pub mod map;

pub use map::cache::CacheStats;
pub use map::config::{CacheConfig, PrefetchPolicy};
pub use map::renderer::{RealizedTile, TextureRealizer, WgpuRealizer};
pub use map::source::{DiskTileSource, TileSource};
pub use map::store::{TileHandle, TileStatus};
pub use map::tile::{TileKey, UvRect};
pub use map::TileTextures;

/// Install `env_logger` as the log backend, defaulting to `info` unless
/// `RUST_LOG` says otherwise. Returns false if a logger was already set.
pub fn init_logging() -> bool {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init()
        .is_ok()
}
