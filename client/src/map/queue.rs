//! Load queues: visible-priority and background FIFOs over tile handles
//!
//! Links live inside the queue, indexed by handle, so callers can only move
//! tiles through `push_back`, `unlink`, `move_to` and `pop_front`. A tile is
//! linked into at most one queue at a time and the queue it sits in is
//! recorded alongside its links.

use std::collections::{HashSet, VecDeque};

use super::store::TileHandle;

/// Which priority queue a tile waits in
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueKind {
    /// On-screen tiles, drained first
    Visible,
    /// Speculative read-ahead
    Invisible,
}

impl QueueKind {
    pub fn for_visibility(visible: bool) -> Self {
        if visible {
            QueueKind::Visible
        } else {
            QueueKind::Invisible
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Link {
    prev: Option<TileHandle>,
    next: Option<TileHandle>,
    queue: Option<QueueKind>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Ends {
    head: Option<TileHandle>,
    tail: Option<TileHandle>,
    len: usize,
}

/// Intrusive-style doubly linked queues plus the refresh list for evicted
/// payloads that need decoding again.
#[derive(Debug, Default)]
pub struct LoadQueues {
    links: Vec<Link>,
    visible: Ends,
    invisible: Ends,
    refresh: VecDeque<TileHandle>,
    refresh_pending: HashSet<TileHandle>,
}

impl LoadQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn ends(&self, kind: QueueKind) -> &Ends {
        match kind {
            QueueKind::Visible => &self.visible,
            QueueKind::Invisible => &self.invisible,
        }
    }

    fn ends_mut(&mut self, kind: QueueKind) -> &mut Ends {
        match kind {
            QueueKind::Visible => &mut self.visible,
            QueueKind::Invisible => &mut self.invisible,
        }
    }

    fn link(&self, handle: TileHandle) -> Link {
        self.links.get(handle.index()).copied().unwrap_or_default()
    }

    fn link_mut(&mut self, handle: TileHandle) -> &mut Link {
        let index = handle.index();
        if index >= self.links.len() {
            self.links.resize(index + 1, Link::default());
        }
        &mut self.links[index]
    }

    /// Queue the tile is currently linked into
    pub fn membership(&self, handle: TileHandle) -> Option<QueueKind> {
        self.link(handle).queue
    }

    pub fn head(&self, kind: QueueKind) -> Option<TileHandle> {
        self.ends(kind).head
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.ends(kind).len
    }

    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.ends(kind).head.is_none()
    }

    /// True when neither priority queue holds a tile
    pub fn is_idle(&self) -> bool {
        self.is_empty(QueueKind::Visible) && self.is_empty(QueueKind::Invisible)
    }

    /// Append to the tail of `kind`. The tile must not be queued already.
    pub fn push_back(&mut self, kind: QueueKind, handle: TileHandle) {
        debug_assert!(
            self.membership(handle).is_none(),
            "tile {handle:?} is already queued"
        );
        let tail = self.ends(kind).tail;
        *self.link_mut(handle) = Link {
            prev: tail,
            next: None,
            queue: Some(kind),
        };
        match tail {
            Some(tail) => self.link_mut(tail).next = Some(handle),
            None => self.ends_mut(kind).head = Some(handle),
        }
        let ends = self.ends_mut(kind);
        ends.tail = Some(handle);
        ends.len += 1;
    }

    /// Detach a tile from whichever queue holds it
    pub fn unlink(&mut self, handle: TileHandle) -> Option<QueueKind> {
        let link = self.link(handle);
        let kind = link.queue?;

        match link.prev {
            Some(prev) => self.link_mut(prev).next = link.next,
            None => self.ends_mut(kind).head = link.next,
        }
        match link.next {
            Some(next) => self.link_mut(next).prev = link.prev,
            None => self.ends_mut(kind).tail = link.prev,
        }
        self.ends_mut(kind).len -= 1;
        *self.link_mut(handle) = Link::default();
        Some(kind)
    }

    /// Relink a queued tile at the tail of `kind`. Returns the queue it left.
    pub fn move_to(&mut self, kind: QueueKind, handle: TileHandle) -> Option<QueueKind> {
        let old = self.unlink(handle);
        if old.is_some() {
            self.push_back(kind, handle);
        }
        old
    }

    /// Detach and return the head of `kind`
    pub fn pop_front(&mut self, kind: QueueKind) -> Option<TileHandle> {
        let head = self.head(kind)?;
        self.unlink(head);
        Some(head)
    }

    /// Ask for an evicted payload to be decoded again. Duplicates are ignored.
    pub fn request_refresh(&mut self, handle: TileHandle) -> bool {
        if self.refresh_pending.insert(handle) {
            self.refresh.push_back(handle);
            true
        } else {
            false
        }
    }

    pub fn refresh_head(&self) -> Option<TileHandle> {
        self.refresh.front().copied()
    }

    pub fn complete_refresh(&mut self, handle: TileHandle) {
        if self.refresh_pending.remove(&handle) {
            self.refresh.retain(|h| *h != handle);
        }
    }

    pub fn refresh_len(&self) -> usize {
        self.refresh.len()
    }

    /// Iterate a queue from head to tail
    pub fn iter(&self, kind: QueueKind) -> impl Iterator<Item = TileHandle> + '_ {
        std::iter::successors(self.head(kind), move |h| self.link(*h).next)
    }

    /// Check the structural invariants of both queues. `is_visible` reports
    /// the visibility flag of a tile so membership can be cross-checked.
    pub fn validate(&self, is_visible: impl Fn(TileHandle) -> bool) -> Result<(), String> {
        for kind in [QueueKind::Visible, QueueKind::Invisible] {
            let ends = self.ends(kind);
            if ends.head.is_some() != ends.tail.is_some() {
                return Err(format!("{kind:?} queue has only one end set"));
            }
            if let Some(head) = ends.head {
                if self.link(head).prev.is_some() {
                    return Err(format!("{kind:?} head {head:?} has a predecessor"));
                }
            }
            if let Some(tail) = ends.tail {
                if self.link(tail).next.is_some() {
                    return Err(format!("{kind:?} tail {tail:?} has a successor"));
                }
            }

            let mut count = 0;
            let mut prev = None;
            for handle in self.iter(kind) {
                let link = self.link(handle);
                if link.queue != Some(kind) || link.prev != prev {
                    return Err(format!("{handle:?} is mislinked in {kind:?} queue"));
                }
                if is_visible(handle) != (kind == QueueKind::Visible) {
                    return Err(format!("{handle:?} sits in the wrong queue ({kind:?})"));
                }
                prev = Some(handle);
                count += 1;
                if count > ends.len {
                    return Err(format!("{kind:?} queue is longer than recorded"));
                }
            }
            if count != ends.len || prev != ends.tail {
                return Err(format!("{kind:?} queue length or tail mismatch"));
            }
        }
        Ok(())
    }
}
