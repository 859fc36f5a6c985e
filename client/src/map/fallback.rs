//! Ancestor fallback for tiles without imagery of their own
//!
//! A missing tile borrows a quarter of its parent's texture. Reference
//! chains are collapsed: a tile whose parent itself refers to an ancestor
//! points straight at that ancestor with a correspondingly smaller
//! rectangle, so every `RefersToTexture` is exactly one hop from a texture.

use super::loader;
use super::store::{TileHandle, TileState, TileStore};
use super::tile::{TileKey, UvRect};
use super::Shared;

/// Resolve the final state of `key` after its own image turned out to be
/// unavailable. Loads the parent on the calling thread first if needed, so
/// recursion is bounded by the zoom level.
pub(crate) fn resolve<T>(shared: &Shared<T>, key: TileKey) -> TileState<T> {
    let Some(parent_key) = key.parent() else {
        return TileState::NoData;
    };

    let (parent, parent_is_new) = {
        let mut inner = shared.lock();
        let (parent, created) = inner.get_locked(parent_key);
        if created {
            shared.loaded.notify_all();
        }
        (parent, inner.store.tile(parent).state.is_new())
    };

    if parent_is_new {
        loader::load_tile(shared, parent);
    }

    let inner = shared.lock();
    derive_state(&inner.store, &key, parent)
}

/// State of `key` given its already-resolved parent
pub fn derive_state<T>(store: &TileStore<T>, key: &TileKey, parent: TileHandle) -> TileState<T> {
    match &store.tile(parent).state {
        TileState::HasTexture(_) => TileState::RefersToTexture {
            ancestor: parent,
            uv: UvRect::FULL.child_quadrant(key),
        },
        TileState::RefersToTexture { ancestor, uv } => TileState::RefersToTexture {
            ancestor: *ancestor,
            uv: uv.child_quadrant(key),
        },
        TileState::NoData => TileState::NoData,
        TileState::New => {
            debug_assert!(false, "parent of {key} still unloaded during fallback");
            log::error!("Parent of tile {} still unloaded during fallback", key);
            TileState::NoData
        }
    }
}
