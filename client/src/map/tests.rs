//! Scenarios exercising the loader thread against the render-side API

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use image::{ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

use super::config::{CacheConfig, PrefetchPolicy};
use super::queue::QueueKind;
use super::renderer::TextureRealizer;
use super::source::TileSource;
use super::store::{TileHandle, TileStatus};
use super::tile::{calculate_sub_region, TileKey, UvRect};
use super::TileTextures;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn png(color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(4, 4, Rgb(color));
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Blocks the loader inside `fetch` for one key until released
struct Gate {
    key: TileKey,
    state: Mutex<(bool, bool)>, // (entered, open)
    cond: Condvar,
}

impl Gate {
    fn new(key: TileKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new((false, false)),
            cond: Condvar::new(),
        })
    }

    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        self.cond.notify_all();
        while !state.1 {
            state = self.cond.wait(state).unwrap();
        }
    }

    fn wait_entered(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.0 {
            state = self.cond.wait(state).unwrap();
        }
    }

    fn release(&self) {
        self.state.lock().unwrap().1 = true;
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct FetchLog(Mutex<Vec<TileKey>>);

impl FetchLog {
    fn keys(&self) -> Vec<TileKey> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

struct MemorySource {
    tiles: HashMap<TileKey, Vec<u8>>,
    log: Arc<FetchLog>,
    gate: Option<Arc<Gate>>,
}

impl MemorySource {
    fn new(keys: &[TileKey]) -> Self {
        let tiles = keys
            .iter()
            .enumerate()
            .map(|(i, key)| (*key, png([i as u8 * 40, 128, 255 - i as u8])))
            .collect();
        Self {
            tiles,
            log: Arc::new(FetchLog::default()),
            gate: None,
        }
    }

    fn with_bytes(mut self, key: TileKey, bytes: &[u8]) -> Self {
        self.tiles.insert(key, bytes.to_vec());
        self
    }

    fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl TileSource for MemorySource {
    fn fetch(&self, key: &TileKey) -> io::Result<Option<Vec<u8>>> {
        self.log.0.lock().unwrap().push(*key);
        if let Some(gate) = self.gate.as_ref().filter(|g| g.key == *key) {
            gate.pass();
        }
        Ok(self.tiles.get(key).cloned())
    }
}

fn cache_with(
    source: MemorySource,
    max_resident: usize,
    prefetch: PrefetchPolicy,
) -> (TileTextures<u32>, Arc<FetchLog>) {
    init_logger();
    let log = source.log.clone();
    let config = CacheConfig::new("unused", max_resident).with_prefetch(prefetch);
    let cache = TileTextures::with_source(config, source).unwrap();
    (cache, log)
}

#[derive(Default)]
struct FakeRealizer {
    uploads: u32,
    released: Vec<u32>,
}

impl TextureRealizer for FakeRealizer {
    type Texture = u32;

    fn realize(&mut self, _key: &TileKey, image: &RgbImage) -> anyhow::Result<u32> {
        anyhow::ensure!(image.width() > 0, "empty image");
        self.uploads += 1;
        Ok(self.uploads)
    }

    fn release(&mut self, texture: u32) {
        self.released.push(texture);
    }
}

fn assert_queue_invariants(cache: &TileTextures<u32>) {
    cache.with_inner(|inner| {
        assert!(inner.queues.validate(|h| inner.store.tile(h).visible).is_ok());
        for (handle, tile) in inner.store.iter() {
            let membership = inner.queues.membership(handle);
            if tile.state.is_new() {
                assert_eq!(membership, Some(QueueKind::for_visibility(tile.visible)));
            } else {
                assert_eq!(membership, None, "finished tile {} still queued", tile.key);
            }
        }
    });
}

#[test]
fn test_root_without_image_has_no_data() {
    let (cache, _) = cache_with(MemorySource::new(&[]), 8, PrefetchPolicy::none());
    let root = cache.get(TileKey::new(0, 0, 0));
    cache.wait_idle();

    assert_eq!(cache.status(root), TileStatus::NoData);
    assert_eq!(cache.uv(root), UvRect::FULL);
    assert_eq!(cache.texture_source(root), None);
}

#[test]
fn test_missing_tile_refers_to_textured_parent() {
    let parent_key = TileKey::new(4, 1, 1);
    let (cache, _) = cache_with(MemorySource::new(&[parent_key]), 8, PrefetchPolicy::none());

    let child = cache.get(TileKey::new(5, 3, 3));
    cache.wait_idle();

    let parent = cache.get(parent_key);
    assert_eq!(cache.status(parent), TileStatus::HasTexture);
    assert_eq!(cache.status(child), TileStatus::RefersToTexture);
    assert_eq!(cache.texture_source(child), Some(parent));
    assert_eq!(cache.uv(child).as_tuple(), (0.5, 0.0, 1.0, 0.5));
    assert_eq!(cache.uv(parent), UvRect::FULL);
}

#[test]
fn test_deep_fallback_points_at_textured_ancestor() {
    let ancestor_key = TileKey::new(2, 1, 1);
    let (cache, log) = cache_with(MemorySource::new(&[ancestor_key]), 8, PrefetchPolicy::none());

    let target_key = TileKey::new(5, 13, 10);
    let target = cache.get(target_key);
    cache.wait_idle();

    assert_eq!(cache.status(target), TileStatus::RefersToTexture);
    assert_eq!(cache.texture_source(target), Some(cache.get(ancestor_key)));
    assert_eq!(cache.uv(target), calculate_sub_region(&target_key, &ancestor_key));

    // 5, 4, 3 missing, 2 textured: nothing above the ancestor is touched
    assert_eq!(log.count(), 4);
    assert!(log.keys().iter().all(|k| k.z >= 2));

    // Intermediate tiles collapse onto the same ancestor
    let mid = cache.get(TileKey::new(4, 6, 5));
    assert_eq!(cache.texture_source(mid), Some(cache.get(ancestor_key)));
}

#[test]
fn test_fallback_depth_is_bounded_and_memoized() {
    let (cache, log) = cache_with(MemorySource::new(&[]), 8, PrefetchPolicy::none());

    let tile = cache.get(TileKey::new(6, 40, 21));
    cache.wait_idle();
    assert_eq!(cache.status(tile), TileStatus::NoData);
    // The tile itself plus at most z ancestors
    assert_eq!(log.count(), 7);

    // A sibling reuses the resolved parent
    let sibling = cache.get(TileKey::new(6, 41, 21));
    cache.wait_idle();
    assert_eq!(cache.status(sibling), TileStatus::NoData);
    assert_eq!(log.count(), 8);
}

#[test]
fn test_fallback_is_deterministic() {
    let ancestor = TileKey::new(1, 0, 1);
    let target = TileKey::new(7, 37, 101);
    let mut results = Vec::new();
    for _ in 0..2 {
        let (cache, _) = cache_with(MemorySource::new(&[ancestor]), 8, PrefetchPolicy::none());
        let handle = cache.get(target);
        cache.wait_idle();
        results.push(cache.uv(handle));
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0].width(), 1.0 / 64.0);
}

#[test]
fn test_corrupt_image_falls_back() {
    let root = TileKey::new(0, 0, 0);
    let broken = TileKey::new(1, 0, 0);
    let source = MemorySource::new(&[root]).with_bytes(broken, b"\x89PNG\r\n garbage");
    let (cache, _) = cache_with(source, 8, PrefetchPolicy::none());

    let tile = cache.get(broken);
    cache.wait_idle();
    assert_eq!(cache.status(tile), TileStatus::RefersToTexture);
    assert_eq!(cache.texture_source(tile), Some(cache.get(root)));
}

#[test]
fn test_concurrent_get_creates_one_tile_per_key() {
    let (cache, _) = cache_with(MemorySource::new(&[]), 8, PrefetchPolicy::none());
    let keys: Vec<TileKey> = (0..16)
        .flat_map(|x| (0..4).map(move |y| TileKey::new(6, x, y)))
        .collect();

    let results: Vec<Vec<(TileKey, TileHandle)>> = thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let cache = &cache;
                let keys = &keys;
                s.spawn(move || {
                    let mut order = keys.clone();
                    order.rotate_left(i * 7);
                    if i % 2 == 1 {
                        order.reverse();
                    }
                    order.into_iter().map(|k| (k, cache.get(k))).collect()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let mut seen: HashMap<TileKey, TileHandle> = HashMap::new();
    for (key, handle) in results.into_iter().flatten() {
        assert_eq!(*seen.entry(key).or_insert(handle), handle);
    }
    assert_eq!(seen.len(), keys.len());

    cache.wait_idle();
    cache.with_inner(|inner| {
        for (key, handle) in &seen {
            assert_eq!(inner.store.find(key), Some(*handle));
        }
    });
    assert_queue_invariants(&cache);
}

#[test]
fn test_visible_tiles_load_before_background_tiles() {
    let keys: Vec<TileKey> = (0..5).map(|x| TileKey::new(3, x, 0)).collect();
    let gate = Gate::new(keys[0]);
    let source = MemorySource::new(&keys).with_gate(gate.clone());
    let (cache, log) = cache_with(source, 16, PrefetchPolicy::none());

    cache.get(keys[0]);
    gate.wait_entered();

    for key in &keys[1..] {
        cache.get(*key);
    }
    let urgent = cache.get(keys[4]);
    cache.set_visible(urgent, true);
    assert_eq!(cache.stats().visible_queue, 1);

    gate.release();
    cache.wait_idle();

    assert_eq!(log.keys(), vec![keys[0], keys[4], keys[1], keys[2], keys[3]]);
    assert_queue_invariants(&cache);
}

#[test]
fn test_visibility_flip_during_load_unlinks_from_current_queue() {
    let key = TileKey::new(3, 1, 1);
    let gate = Gate::new(key);
    let source = MemorySource::new(&[key]).with_gate(gate.clone());
    let (cache, _) = cache_with(source, 8, PrefetchPolicy::none());

    let tile = cache.get(key);
    gate.wait_entered();

    cache.set_visible(tile, true);
    cache.with_inner(|inner| {
        assert_eq!(inner.queues.membership(tile), Some(QueueKind::Visible));
    });
    cache.set_visible(tile, false);
    cache.with_inner(|inner| {
        assert_eq!(inner.queues.membership(tile), Some(QueueKind::Invisible));
        assert!(inner.queues.is_empty(QueueKind::Visible));
    });

    gate.release();
    cache.wait_idle();

    assert_eq!(cache.status(tile), TileStatus::HasTexture);
    cache.with_inner(|inner| {
        assert_eq!(inner.queues.membership(tile), None);
        assert!(inner.queues.is_idle());
    });
    assert_queue_invariants(&cache);
}

#[test]
fn test_wait_visible_loaded_covers_every_visible_tile() {
    let keys = [TileKey::new(2, 1, 1), TileKey::new(3, 2, 2)];
    let (cache, _) = cache_with(MemorySource::new(&keys), 64, PrefetchPolicy::default());

    let visible: Vec<TileHandle> = [(4, 4, 4), (4, 5, 4), (4, 4, 5), (4, 5, 5)]
        .iter()
        .map(|&(z, x, y)| cache.get(TileKey::new(z, x, y)))
        .collect();
    for tile in &visible {
        cache.set_visible(*tile, true);
    }
    cache.wait_visible_loaded();

    cache.with_inner(|inner| {
        for (_, tile) in inner.store.iter() {
            if tile.visible {
                assert!(!tile.state.is_new(), "visible tile {} not loaded", tile.key);
            }
        }
    });
    for tile in &visible {
        assert_eq!(cache.status(*tile), TileStatus::RefersToTexture);
    }
    assert_queue_invariants(&cache);
}

#[test]
fn test_set_visible_prefetches_related_tiles() {
    let (cache, _) = cache_with(MemorySource::new(&[]), 8, PrefetchPolicy::default());
    let center = TileKey::new(3, 4, 4);
    let tile = cache.get(center);
    cache.set_visible(tile, true);

    let mut expected = center.neighbors();
    expected.extend(center.parent());
    expected.extend(center.children());
    assert_eq!(expected.len(), 13);
    cache.with_inner(|inner| {
        for key in &expected {
            assert!(inner.store.find(key).is_some(), "{key} was not requested");
        }
    });

    // Hiding a tile requests nothing; repeating it is a no-op
    cache.wait_idle();
    let before = cache.stats().tile_count;
    cache.set_visible(tile, false);
    cache.set_visible(tile, false);
    assert!(!cache.is_visible(tile));
    assert_eq!(cache.stats().tile_count, before);
    assert_queue_invariants(&cache);
}

#[test]
fn test_prefetch_respects_max_zoom() {
    init_logger();
    let config = CacheConfig::new("unused", 8)
        .with_prefetch(PrefetchPolicy {
            neighbors: false,
            parent: false,
            children: true,
        })
        .with_max_zoom(3);
    let cache: TileTextures<u32> = TileTextures::with_source(config, MemorySource::new(&[])).unwrap();

    let key = TileKey::new(3, 0, 0);
    let tile = cache.get(key);
    cache.set_visible(tile, true);
    cache.wait_idle();
    cache.with_inner(|inner| {
        for child in key.children() {
            assert!(inner.store.find(&child).is_none());
        }
    });
}

#[test]
fn test_finished_tile_visibility_does_not_touch_queues() {
    let key = TileKey::new(1, 1, 1);
    let (cache, _) = cache_with(MemorySource::new(&[key]), 8, PrefetchPolicy::none());
    let tile = cache.get(key);
    cache.wait_idle();

    cache.set_visible(tile, true);
    assert!(cache.is_visible(tile));
    cache.with_inner(|inner| assert_eq!(inner.queues.membership(tile), None));
    cache.set_visible(tile, false);
    assert_queue_invariants(&cache);
}

#[test]
fn test_resident_bound_spares_visible_tiles() {
    let keys: Vec<TileKey> = (0..4).map(|x| TileKey::new(2, x, 0)).collect();
    let (cache, _) = cache_with(MemorySource::new(&keys), 2, PrefetchPolicy::none());

    let first = cache.get(keys[0]);
    cache.set_visible(first, true);
    cache.wait_visible_loaded();

    let others: Vec<TileHandle> = keys[1..].iter().map(|k| cache.get(*k)).collect();
    cache.wait_idle();

    let stats = cache.stats();
    assert_eq!(stats.resident_count, 2);
    assert_eq!(stats.evictions, 2);
    assert!(cache.is_resident(first));
    assert!(!cache.is_resident(others[0]));
    assert!(!cache.is_resident(others[1]));
    assert!(cache.is_resident(others[2]));
    // Eviction keeps the classification
    assert_eq!(cache.status(others[0]), TileStatus::HasTexture);

    // Showing an evicted tile decodes it again
    cache.set_visible(others[0], true);
    cache.wait_visible_loaded();
    assert!(cache.is_resident(others[0]));
    assert!(cache.is_resident(first));
    assert!(!cache.is_resident(others[2]));
    assert_eq!(cache.stats().resident_count, 2);
}

#[test]
fn test_ancestor_of_visible_tile_is_pinned() {
    let parent_key = TileKey::new(1, 0, 0);
    let other_key = TileKey::new(1, 1, 0);
    let (cache, _) = cache_with(
        MemorySource::new(&[parent_key, other_key]),
        1,
        PrefetchPolicy::none(),
    );

    let child = cache.get(TileKey::new(2, 0, 0));
    cache.set_visible(child, true);
    cache.wait_visible_loaded();
    let parent = cache.get(parent_key);
    assert_eq!(cache.texture_source(child), Some(parent));

    let other = cache.get(other_key);
    cache.wait_idle();
    assert!(cache.is_resident(parent));
    assert!(!cache.is_resident(other));

    // Once nothing visible needs it, the parent is an ordinary candidate
    cache.set_visible(child, false);
    cache.set_visible(other, true);
    cache.wait_visible_loaded();
    assert!(cache.is_resident(other));
    assert!(!cache.is_resident(parent));
}

#[test]
fn test_realize_texture_caches_handle() {
    let root = TileKey::new(0, 0, 0);
    let (cache, _) = cache_with(MemorySource::new(&[root]), 8, PrefetchPolicy::none());
    let mut realizer = FakeRealizer::default();

    let tile = cache.get(root);
    let child = cache.get(TileKey::new(1, 1, 1));
    cache.wait_idle();

    assert_eq!(cache.realize_texture(tile, &mut realizer), Some(1));
    assert_eq!(cache.realize_texture(tile, &mut realizer), Some(1));
    assert_eq!(realizer.uploads, 1);
    assert!(cache.is_resident(tile));

    // Referring tiles draw through their ancestor instead
    assert_eq!(cache.realize_texture(child, &mut realizer), None);
    let source = cache.texture_source(child).unwrap();
    assert_eq!(cache.realize_texture(source, &mut realizer), Some(1));
}

#[test]
fn test_evicted_texture_is_released_on_render_thread() {
    let a_key = TileKey::new(1, 0, 0);
    let b_key = TileKey::new(1, 1, 0);
    let (cache, _) = cache_with(MemorySource::new(&[a_key, b_key]), 1, PrefetchPolicy::none());
    let mut realizer = FakeRealizer::default();

    let a = cache.get(a_key);
    cache.wait_idle();
    assert_eq!(cache.realize_texture(a, &mut realizer), Some(1));

    let b = cache.get(b_key);
    cache.wait_idle();
    assert!(!cache.is_resident(a));
    assert!(cache.is_resident(b));

    assert_eq!(cache.collect_retired(&mut realizer), 1);
    assert_eq!(realizer.released, vec![1]);

    // Asking for the evicted tile schedules a reload
    assert_eq!(cache.realize_texture(a, &mut realizer), None);
    cache.wait_idle();
    assert!(cache.is_resident(a));
    assert_eq!(cache.realize_texture(a, &mut realizer), Some(2));
}

/// Loads another tile in the middle of an upload, evicting the one being
/// uploaded when the cache holds a single payload
struct EvictingRealizer<'a> {
    cache: &'a TileTextures<u32>,
    intruder: TileKey,
    inner: FakeRealizer,
}

impl TextureRealizer for EvictingRealizer<'_> {
    type Texture = u32;

    fn realize(&mut self, key: &TileKey, image: &RgbImage) -> anyhow::Result<u32> {
        self.cache.get(self.intruder);
        self.cache.wait_idle();
        self.inner.realize(key, image)
    }

    fn release(&mut self, texture: u32) {
        self.inner.release(texture);
    }
}

#[test]
fn test_upload_racing_eviction_is_released() {
    let a_key = TileKey::new(1, 0, 0);
    let b_key = TileKey::new(1, 1, 0);
    let (cache, _) = cache_with(MemorySource::new(&[a_key, b_key]), 1, PrefetchPolicy::none());

    let a = cache.get(a_key);
    cache.wait_idle();
    assert!(cache.is_resident(a));

    let mut realizer = EvictingRealizer {
        cache: &cache,
        intruder: b_key,
        inner: FakeRealizer::default(),
    };
    assert_eq!(cache.realize_texture(a, &mut realizer), None);
    assert_eq!(realizer.inner.uploads, 1);
    assert_eq!(realizer.inner.released, vec![1]);
    assert_eq!(cache.status(a), TileStatus::HasTexture);

    // The discarded upload queued a reload; the next attempt sticks
    cache.wait_idle();
    assert!(cache.is_resident(a));
    assert_eq!(cache.realize_texture(a, &mut realizer), Some(2));
    assert_eq!(cache.realize_texture(a, &mut realizer), Some(2));
    assert_eq!(cache.collect_retired(&mut realizer), 0);
}

#[test]
fn test_set_visible_beyond_addressable_zoom() {
    let (cache, _) = cache_with(MemorySource::new(&[]), 8, PrefetchPolicy::default());
    let tile = cache.get(TileKey::new(64, 0, 0));
    cache.set_visible(tile, true);
    cache.wait_visible_loaded();

    assert!(cache.is_visible(tile));
    assert_eq!(cache.status(tile), TileStatus::NoData);
    cache.with_inner(|inner| {
        assert!(inner.store.find(&TileKey::new(64, 1, 1)).is_some());
        assert!(inner.store.find(&TileKey::new(63, 0, 0)).is_some());
        assert!(inner.store.find(&TileKey::new(65, 0, 0)).is_none());
    });
    assert_queue_invariants(&cache);
}

#[test]
fn test_disk_backed_cache() {
    init_logger();
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("3").join("2");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("1.png"), png([10, 20, 30])).unwrap();

    let cache: TileTextures<u32> = TileTextures::init(temp_dir.path(), 8).unwrap();
    let tile = cache.get(TileKey::new(3, 2, 1));
    let child = cache.get(TileKey::new(4, 5, 2));
    cache.wait_idle();

    assert_eq!(cache.status(tile), TileStatus::HasTexture);
    assert_eq!(cache.texture_source(child), Some(tile));
    assert_eq!(cache.uv(child).as_tuple(), (0.5, 0.5, 1.0, 1.0));
    cache.shutdown();
}

#[test]
fn test_init_rejects_bad_configuration() {
    init_logger();
    let temp_dir = TempDir::new().unwrap();
    assert!(TileTextures::<u32>::init(temp_dir.path().join("missing"), 8).is_err());
    assert!(TileTextures::<u32>::init(temp_dir.path(), 0).is_err());
}

#[test]
fn test_shutdown_with_pending_work() {
    let (cache, _) = cache_with(MemorySource::new(&[]), 8, PrefetchPolicy::default());
    for x in 0..32 {
        let tile = cache.get(TileKey::new(10, x, 7));
        cache.set_visible(tile, true);
    }
    cache.shutdown();
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "loaded twice")]
fn test_second_completion_panics_in_debug() {
    use super::store::TileState;
    use super::Inner;

    let mut inner: Inner<u32> = Inner::new(4);
    let (tile, _) = inner.get_locked(TileKey::new(2, 1, 1));
    inner.complete(tile, TileState::NoData);
    inner.complete(tile, TileState::NoData);
}

#[test]
#[cfg(not(debug_assertions))]
fn test_second_completion_keeps_first_result() {
    use super::store::{TexturePayload, TileState};
    use super::Inner;

    let mut inner: Inner<u32> = Inner::new(4);
    let (tile, _) = inner.get_locked(TileKey::new(2, 1, 1));
    inner.complete(tile, TileState::NoData);
    let image = Arc::new(RgbImage::new(1, 1));
    inner.complete(tile, TileState::HasTexture(TexturePayload::Decoded(image)));

    assert_eq!(inner.store.tile(tile).state.status(), TileStatus::NoData);
    assert!(inner.residency.is_empty());
    assert_eq!(inner.queues.membership(tile), None);
}

#[test]
#[cfg(not(debug_assertions))]
fn test_completing_unqueued_tile_still_publishes() {
    use super::store::{TexturePayload, TileState};
    use super::Inner;

    let mut inner: Inner<u32> = Inner::new(4);
    // Inserted behind the queues' back
    let (tile, _) = inner.store.get_or_insert(TileKey::new(2, 3, 0));
    let image = Arc::new(RgbImage::new(1, 1));
    inner.complete(tile, TileState::HasTexture(TexturePayload::Decoded(image)));

    assert_eq!(inner.store.tile(tile).state.status(), TileStatus::HasTexture);
    assert_eq!(inner.residency.len(), 1);
    assert!(inner.queues.is_idle());
}

#[test]
#[cfg(not(debug_assertions))]
fn test_set_visible_requeues_lost_unloaded_tile() {
    let busy = TileKey::new(3, 0, 0);
    let key = TileKey::new(3, 5, 5);
    let gate = Gate::new(busy);
    let source = MemorySource::new(&[busy, key]).with_gate(gate.clone());
    let (cache, _) = cache_with(source, 8, PrefetchPolicy::none());

    cache.get(busy);
    gate.wait_entered();
    let tile = cache.get(key);
    assert_eq!(cache.shared.lock().queues.unlink(tile), Some(QueueKind::Invisible));

    cache.set_visible(tile, true);
    cache.with_inner(|inner| {
        assert_eq!(inner.queues.membership(tile), Some(QueueKind::Visible));
    });

    gate.release();
    cache.wait_idle();
    assert_eq!(cache.status(tile), TileStatus::HasTexture);
    assert_queue_invariants(&cache);
}
