//! Tile texture cache with a background loader and ancestor fallback
//!
//! The render thread looks tiles up with [`TileTextures::get`], marks the
//! ones on screen with [`TileTextures::set_visible`], waits for them with
//! [`TileTextures::wait_visible_loaded`] and then draws each tile from
//! [`TileTextures::texture_source`] using [`TileTextures::uv`].

pub mod cache;
pub mod config;
pub mod fallback;
pub mod loader;
pub mod queue;
pub mod renderer;
pub mod source;
pub mod store;
pub mod tile;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context};
use image::RgbImage;
use log::{debug, error, info};

use cache::{CacheStats, Residency};
use config::CacheConfig;
use loader::LOADER_THREAD_NAME;
use queue::{LoadQueues, QueueKind};
use renderer::TextureRealizer;
use source::{DiskTileSource, TileSource};
use store::{TexturePayload, TileHandle, TileState, TileStatus, TileStore};
use tile::{TileKey, UvRect, MAX_ADDRESSABLE_ZOOM};

/// Everything guarded by the cache lock
pub(crate) struct Inner<T> {
    pub(crate) store: TileStore<T>,
    pub(crate) queues: LoadQueues,
    residency: Residency,
    /// Textures evicted by the loader, released on the render thread
    retired: Vec<T>,
    /// Evicted tiles whose imagery could not be read again
    lost: HashSet<TileHandle>,
    pub(crate) shutdown: bool,
}

/// State shared between the render thread and the loader thread
pub(crate) struct Shared<T> {
    inner: Mutex<Inner<T>>,
    /// Broadcast whenever a queue head changes or a load completes
    pub(crate) loaded: Condvar,
    pub(crate) source: Box<dyn TileSource>,
    config: CacheConfig,
}

impl<T> Shared<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, Inner<T>>) -> MutexGuard<'a, Inner<T>> {
        self.loaded.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Inner<T> {
    fn new(max_resident: usize) -> Self {
        Self {
            store: TileStore::new(),
            queues: LoadQueues::new(),
            residency: Residency::new(max_resident),
            retired: Vec::new(),
            lost: HashSet::new(),
            shutdown: false,
        }
    }

    /// Look up or create a tile. New tiles join the tail of the invisible
    /// queue; the caller is responsible for waking the loader.
    pub(crate) fn get_locked(&mut self, key: TileKey) -> (TileHandle, bool) {
        let (handle, created) = self.store.get_or_insert(key);
        if created {
            self.queues.push_back(QueueKind::Invisible, handle);
        }
        (handle, created)
    }

    /// Publish the final state of a loaded tile and unlink it from
    /// whichever queue it sits in now.
    pub(crate) fn complete(&mut self, handle: TileHandle, state: TileState<T>) {
        let tile = self.store.tile_mut(handle);
        if !tile.state.is_new() {
            debug_assert!(false, "tile {} loaded twice", tile.key);
            error!("Tile {} loaded twice, keeping first result", tile.key);
            return;
        }
        tile.state = state;
        let visible = tile.visible;
        let shown = tile.is_shown();

        if self.queues.unlink(handle).is_none() {
            debug_assert!(false, "loaded tile {handle:?} was not queued");
            error!("Loaded tile {:?} was not queued", handle);
        }

        let tile = self.store.tile(handle);
        let textured = matches!(tile.state, TileState::HasTexture(_));
        let ancestor = match tile.state {
            TileState::RefersToTexture { ancestor, .. } => Some(ancestor),
            _ => None,
        };

        if textured {
            let victims = self.residency.admit(handle, shown);
            self.evict(victims);
        } else if let (Some(ancestor), true) = (ancestor, visible) {
            self.add_visible_ref(ancestor, true);
        }
    }

    /// Install a re-decoded payload for an evicted tile
    pub(crate) fn finish_refresh(&mut self, handle: TileHandle, image: Option<RgbImage>) {
        self.queues.complete_refresh(handle);
        let Some(image) = image else {
            self.lost.insert(handle);
            return;
        };
        let tile = self.store.tile_mut(handle);
        let shown = tile.is_shown();
        if matches!(tile.state, TileState::HasTexture(TexturePayload::Evicted)) {
            tile.state = TileState::HasTexture(TexturePayload::Decoded(Arc::new(image)));
            let victims = self.residency.admit(handle, shown);
            self.evict(victims);
        }
    }

    /// Drop the payload of each victim, keeping its classification
    fn evict(&mut self, victims: Vec<TileHandle>) {
        for handle in victims {
            if let TileState::HasTexture(payload) = &mut self.store.tile_mut(handle).state {
                if let TexturePayload::Realized(texture) =
                    mem::replace(payload, TexturePayload::Evicted)
                {
                    self.retired.push(texture);
                }
            }
        }
    }

    /// Ask the loader to decode an evicted payload again
    fn request_refresh(&mut self, handle: TileHandle) -> bool {
        let tile = self.store.tile(handle);
        if !matches!(tile.state, TileState::HasTexture(TexturePayload::Evicted))
            || self.lost.contains(&handle)
        {
            return false;
        }
        if self.queues.request_refresh(handle) {
            debug!("Reloading evicted tile {}", tile.key);
        }
        true
    }

    /// React to a tile starting or stopping to be shown
    fn shown_changed(&mut self, handle: TileHandle, was_shown: bool) {
        let shown = self.store.tile(handle).is_shown();
        if shown == was_shown {
            return;
        }
        if shown {
            self.residency.mark_shown(handle);
            self.request_refresh(handle);
        } else {
            let victims = self.residency.mark_hidden(handle);
            self.evict(victims);
        }
    }

    fn add_visible_ref(&mut self, ancestor: TileHandle, increment: bool) {
        let was_shown = self.store.tile(ancestor).is_shown();
        let tile = self.store.tile_mut(ancestor);
        if increment {
            tile.visible_refs += 1;
        } else {
            debug_assert!(tile.visible_refs > 0, "visible ref count underflow");
            tile.visible_refs = tile.visible_refs.saturating_sub(1);
        }
        self.shown_changed(ancestor, was_shown);
    }

    /// Check queue invariants (debug builds only)
    pub(crate) fn validate(&self) {
        if cfg!(debug_assertions) {
            let store = &self.store;
            if let Err(e) = self.queues.validate(|h| store.tile(h).visible) {
                panic!("load queues corrupted: {e}");
            }
        }
    }
}

/// Tile texture cache: store, load queues, admission bound and the loader
/// thread behind one lock.
///
/// `T` is the render-side texture handle produced by a [`TextureRealizer`].
pub struct TileTextures<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Clone + Send + 'static> TileTextures<T> {
    /// Serve tiles from `{root}/{z}/{x}/{y}.png`, keeping at most
    /// `max_resident` decoded tiles in memory.
    pub fn init(root: impl Into<PathBuf>, max_resident: usize) -> anyhow::Result<Self> {
        Self::with_config(CacheConfig::new(root, max_resident))
    }

    pub fn with_config(config: CacheConfig) -> anyhow::Result<Self> {
        if !config.root.is_dir() {
            bail!("tile root {} is not a directory", config.root.display());
        }
        let source = DiskTileSource::from_config(&config);
        Self::with_source(config, source)
    }

    /// Serve tiles from a custom source. `config.root` is not consulted.
    pub fn with_source(config: CacheConfig, source: impl TileSource + 'static) -> anyhow::Result<Self> {
        if config.max_resident == 0 {
            bail!("max_resident must be at least 1");
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::new(config.max_resident)),
            loaded: Condvar::new(),
            source: Box::new(source),
            config,
        });
        let worker = loader::spawn(shared.clone()).context("failed to spawn tile loader thread")?;

        info!(
            "Tile cache ready (max {} resident tiles)",
            shared.config.max_resident
        );
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Find or create the tile for `key`. New tiles are queued for
    /// background loading.
    pub fn get(&self, key: TileKey) -> TileHandle {
        let (handle, created) = self.shared.lock().get_locked(key);
        if created {
            self.shared.loaded.notify_all();
        }
        handle
    }

    pub fn key(&self, handle: TileHandle) -> TileKey {
        self.shared.lock().store.tile(handle).key
    }

    pub fn status(&self, handle: TileHandle) -> TileStatus {
        self.shared.lock().store.tile(handle).state.status()
    }

    pub fn is_visible(&self, handle: TileHandle) -> bool {
        self.shared.lock().store.tile(handle).visible
    }

    /// Whether the tile currently holds pixels or a realized texture
    pub fn is_resident(&self, handle: TileHandle) -> bool {
        self.shared.lock().store.tile(handle).is_resident()
    }

    /// Mark a tile as on or off screen.
    ///
    /// Unloaded tiles move to the matching load queue. A tile becoming
    /// visible also requests its neighbours, parent and children as
    /// read-ahead, per the configured [`config::PrefetchPolicy`].
    pub fn set_visible(&self, handle: TileHandle, visible: bool) {
        let mut inner = self.shared.lock();
        let tile = inner.store.tile(handle);
        if tile.visible == visible {
            return;
        }
        let key = tile.key;
        let was_shown = tile.is_shown();
        let is_new = tile.state.is_new();
        let ancestor = match tile.state {
            TileState::RefersToTexture { ancestor, .. } => Some(ancestor),
            _ => None,
        };

        inner.store.tile_mut(handle).visible = visible;

        if is_new {
            let target = QueueKind::for_visibility(visible);
            let left = inner.queues.move_to(target, handle);
            debug_assert_eq!(left, Some(QueueKind::for_visibility(!visible)));
            if left.is_none() {
                error!("Unloaded tile {} was not queued", key);
                inner.queues.push_back(target, handle);
            }
        } else {
            debug_assert!(inner.queues.membership(handle).is_none());
        }

        inner.shown_changed(handle, was_shown);
        if let Some(ancestor) = ancestor {
            inner.add_visible_ref(ancestor, visible);
        }

        if visible {
            for related in self.prefetch_keys(&key) {
                inner.get_locked(related);
            }
        }

        inner.validate();
        drop(inner);
        self.shared.loaded.notify_all();
    }

    fn prefetch_keys(&self, key: &TileKey) -> Vec<TileKey> {
        let policy = self.shared.config.prefetch;
        let mut keys = Vec::new();
        if policy.neighbors {
            keys.extend(key.neighbors());
        }
        if policy.parent {
            keys.extend(key.parent());
        }
        if policy.children && key.z < self.shared.config.max_zoom.min(MAX_ADDRESSABLE_ZOOM) {
            keys.extend(key.children());
        }
        keys
    }

    /// Block until no visible tile is waiting to be loaded (and no evicted
    /// payload is waiting to be decoded again).
    pub fn wait_visible_loaded(&self) {
        let mut inner = self.shared.lock();
        while !inner.shutdown
            && (!inner.queues.is_empty(QueueKind::Visible) || inner.queues.refresh_len() > 0)
        {
            inner = self.shared.wait(inner);
        }
    }

    /// Block until the loader has nothing left to do
    pub fn wait_idle(&self) {
        let mut inner = self.shared.lock();
        while !inner.shutdown && (!inner.queues.is_idle() || inner.queues.refresh_len() > 0) {
            inner = self.shared.wait(inner);
        }
    }

    /// Texture rectangle to sample for this tile
    pub fn uv(&self, handle: TileHandle) -> UvRect {
        self.shared.lock().store.tile(handle).uv()
    }

    /// Tile whose texture covers this tile's area, if any
    pub fn texture_source(&self, handle: TileHandle) -> Option<TileHandle> {
        match self.shared.lock().store.tile(handle).state {
            TileState::HasTexture(_) => Some(handle),
            TileState::RefersToTexture { ancestor, .. } => Some(ancestor),
            TileState::New | TileState::NoData => None,
        }
    }

    /// Turn a tile's decoded pixels into a render texture, caching the
    /// result on the tile. Must be called on the render thread. Returns
    /// `None` for tiles without imagery of their own and for evicted tiles,
    /// which are queued to be decoded again. An upload that loses a race with
    /// eviction is handed straight back to [`TextureRealizer::release`].
    pub fn realize_texture<R>(&self, handle: TileHandle, realizer: &mut R) -> Option<T>
    where
        R: TextureRealizer<Texture = T>,
    {
        debug_assert_ne!(
            thread::current().name(),
            Some(LOADER_THREAD_NAME),
            "textures must be realized on the render thread"
        );
        self.collect_retired(realizer);

        let (key, image) = {
            let mut inner = self.shared.lock();
            let tile = inner.store.tile(handle);
            let key = tile.key;
            let image = match &tile.state {
                TileState::HasTexture(TexturePayload::Realized(texture)) => {
                    return Some(texture.clone());
                }
                TileState::HasTexture(TexturePayload::Decoded(image)) => Some(image.clone()),
                TileState::HasTexture(TexturePayload::Evicted) => None,
                _ => return None,
            };
            match image {
                Some(image) => (key, image),
                None => {
                    if inner.request_refresh(handle) {
                        drop(inner);
                        self.shared.loaded.notify_all();
                    }
                    return None;
                }
            }
        };

        let texture = match realizer.realize(&key, &image) {
            Ok(texture) => texture,
            Err(e) => {
                error!("Failed to realize texture for tile {}: {:#}", key, e);
                return None;
            }
        };

        let mut inner = self.shared.lock();
        let mut cached = false;
        if let TileState::HasTexture(payload) = &mut inner.store.tile_mut(handle).state {
            if matches!(&*payload, TexturePayload::Decoded(current) if Arc::ptr_eq(current, &image)) {
                *payload = TexturePayload::Realized(texture.clone());
                cached = true;
            }
        }
        if cached {
            return Some(texture);
        }

        // The loader replaced the payload while we were uploading
        debug!("Tile {} changed during upload, discarding texture", key);
        let refresh = inner.request_refresh(handle);
        drop(inner);
        if refresh {
            self.shared.loaded.notify_all();
        }
        realizer.release(texture);
        None
    }

    /// Hand textures evicted by the loader back to the realizer
    pub fn collect_retired<R>(&self, realizer: &mut R) -> usize
    where
        R: TextureRealizer<Texture = T>,
    {
        let retired = mem::take(&mut self.shared.lock().retired);
        let count = retired.len();
        for texture in retired {
            realizer.release(texture);
        }
        count
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let inner = self.shared.lock();
        let mut stats = CacheStats {
            tile_count: inner.store.len(),
            resident_count: inner.residency.len(),
            max_resident: inner.residency.max_resident(),
            evictions: inner.residency.evictions(),
            visible_queue: inner.queues.len(QueueKind::Visible),
            invisible_queue: inner.queues.len(QueueKind::Invisible),
            refresh_queue: inner.queues.refresh_len(),
            ..Default::default()
        };
        for (_, tile) in inner.store.iter() {
            match tile.state.status() {
                TileStatus::New => stats.new_tiles += 1,
                TileStatus::HasTexture => stats.textured_tiles += 1,
                TileStatus::RefersToTexture => stats.referring_tiles += 1,
                TileStatus::NoData => stats.no_data_tiles += 1,
            }
        }
        stats
    }

    /// Stop the loader and release all tiles
    pub fn shutdown(mut self) {
        self.stop();
    }

    #[cfg(test)]
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&Inner<T>) -> R) -> R {
        f(&self.shared.lock())
    }
}

impl<T: Send + 'static> TileTextures<T> {
    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.lock().shutdown = true;
        self.shared.loaded.notify_all();
        if worker.join().is_err() {
            error!("Tile loader thread panicked");
        }

        let mut inner = self.shared.lock();
        let mut abandoned = 0;
        for kind in [QueueKind::Visible, QueueKind::Invisible] {
            while inner.queues.pop_front(kind).is_some() {
                abandoned += 1;
            }
        }
        inner.residency.clear();
        info!(
            "Tile cache shut down ({} tiles, {} never loaded)",
            inner.store.len(),
            abandoned
        );
        inner.store = TileStore::new();
        inner.retired.clear();
    }
}

impl<T: Send + 'static> Drop for TileTextures<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
