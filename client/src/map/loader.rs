//! Background tile loader: one worker thread draining the load queues
//!
//! The worker never holds the cache lock while reading or decoding. A tile
//! stays linked in its queue for the whole load and is unlinked, from
//! whichever queue it ended up in, when its final state is published.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use image::RgbImage;
use log::{debug, info, warn};

use super::fallback;
use super::queue::QueueKind;
use super::source::TileSource;
use super::store::{TexturePayload, TileHandle, TileState};
use super::tile::TileKey;
use super::Shared;

/// Name of the worker thread; texture realization refuses to run on it
pub const LOADER_THREAD_NAME: &str = "tile-loader";

/// Result of a tile load operation
#[derive(Debug)]
pub enum TileLoadResult {
    Decoded(RgbImage),
    Missing,
    Failed(String),
}

enum Work {
    Load(TileHandle),
    Refresh(TileHandle),
}

pub(crate) fn spawn<T: Send + 'static>(shared: Arc<Shared<T>>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(LOADER_THREAD_NAME.to_string())
        .spawn(move || worker_thread(shared))
}

fn worker_thread<T: Send + 'static>(shared: Arc<Shared<T>>) {
    info!("Tile loader started");
    while let Some(work) = next_work(&shared) {
        match work {
            Work::Load(handle) => load_tile(&shared, handle),
            Work::Refresh(handle) => refresh_tile(&shared, handle),
        }
    }
    info!("Tile loader stopped");
}

/// Block until there is something to do. Visible tiles first, then evicted
/// payloads somebody is waiting on, then read-ahead.
fn next_work<T>(shared: &Shared<T>) -> Option<Work> {
    let mut inner = shared.lock();
    loop {
        if inner.shutdown {
            return None;
        }
        if let Some(handle) = inner.queues.head(QueueKind::Visible) {
            return Some(Work::Load(handle));
        }
        if let Some(handle) = inner.queues.refresh_head() {
            return Some(Work::Refresh(handle));
        }
        if let Some(handle) = inner.queues.head(QueueKind::Invisible) {
            return Some(Work::Load(handle));
        }
        inner = shared.wait(inner);
    }
}

/// Bring a `New` tile to its final state. Also used by the fallback path to
/// load an ancestor synchronously.
pub(crate) fn load_tile<T>(shared: &Shared<T>, handle: TileHandle) {
    let key = shared.lock().store.tile(handle).key;

    let state = match fetch_and_decode(shared.source.as_ref(), &key) {
        TileLoadResult::Decoded(image) => {
            debug!("Loaded tile {} ({}x{})", key, image.width(), image.height());
            TileState::HasTexture(TexturePayload::Decoded(Arc::new(image)))
        }
        TileLoadResult::Missing => {
            debug!("No image for tile {}, falling back", key);
            fallback::resolve(shared, key)
        }
        TileLoadResult::Failed(err) => {
            warn!("Failed to load tile {}: {}", key, err);
            fallback::resolve(shared, key)
        }
    };

    let mut inner = shared.lock();
    inner.complete(handle, state);
    inner.validate();
    drop(inner);
    // someone may be waiting for the visible queue to drain
    shared.loaded.notify_all();
}

/// Decode an evicted payload again
fn refresh_tile<T>(shared: &Shared<T>, handle: TileHandle) {
    let key = shared.lock().store.tile(handle).key;

    let image = match fetch_and_decode(shared.source.as_ref(), &key) {
        TileLoadResult::Decoded(image) => Some(image),
        TileLoadResult::Missing => {
            warn!("Image for tile {} disappeared after eviction", key);
            None
        }
        TileLoadResult::Failed(err) => {
            warn!("Failed to reload tile {}: {}", key, err);
            None
        }
    };

    let mut inner = shared.lock();
    inner.finish_refresh(handle, image);
    drop(inner);
    shared.loaded.notify_all();
}

pub fn fetch_and_decode(source: &dyn TileSource, key: &TileKey) -> TileLoadResult {
    let data = match source.fetch(key) {
        Ok(Some(data)) => data,
        Ok(None) => return TileLoadResult::Missing,
        Err(e) => return TileLoadResult::Failed(format!("{}: {}", source.describe(key), e)),
    };
    match decode_tile_image(&data) {
        Ok(image) => TileLoadResult::Decoded(image),
        Err(e) => TileLoadResult::Failed(format!("{}: {}", source.describe(key), e)),
    }
}

/// Decode a compressed tile into 8-bit RGB, bottom row first
pub fn decode_tile_image(data: &[u8]) -> Result<RgbImage, image::ImageError> {
    let img = image::load_from_memory(data)?;
    let mut rgb = img.to_rgb8();
    // Textures are addressed with the origin at the bottom-left
    image::imageops::flip_vertical_in_place(&mut rgb);
    Ok(rgb)
}

/// Calculate memory size for a decoded tile
pub fn tile_memory_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3 // RGB8 = 3 bytes per pixel
}
