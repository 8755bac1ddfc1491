//! Insertion-ordered store for decoded content.
//!
//! Unlike an LRU, lookups never reorder entries. Eviction walks entries from
//! oldest to newest and skips any entry the caller reports as live, so the
//! cache can temporarily hold more than its limit when everything in it is
//! still wanted.
//!
//! Entries live in a slab of doubly linked nodes with a key to slot index,
//! which keeps insertion, lookup and removal O(1).

use std::collections::HashMap;
use std::fmt;

use crate::key::ResourceKey;

/// Called with the key and value of every entry that leaves the cache.
pub type ReleaseHook<V> = Box<dyn Fn(&ResourceKey, &V) + Send + Sync>;

#[derive(Debug)]
struct Node<V> {
    key: ResourceKey,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Keyed store with insertion-ordered, liveness-aware eviction.
pub struct ContentCache<V> {
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    index: HashMap<ResourceKey, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    release: Option<ReleaseHook<V>>,
}

impl<V> ContentCache<V> {
    /// Create an empty cache with no release hook.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            release: None,
        }
    }

    /// Create an empty cache that calls `hook` whenever an entry is evicted,
    /// replaced, removed or cleared.
    #[must_use]
    pub fn with_release_hook(hook: ReleaseHook<V>) -> Self {
        Self {
            release: Some(hook),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    /// Look up a value without changing its position.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_ref().map(|node| &node.value)
    }

    /// Insert `value` at the newest position.
    ///
    /// An existing entry for `key` is released first.
    pub fn put(&mut self, key: ResourceKey, value: V) {
        self.remove(&key);

        let node = Node {
            key: key.clone(),
            value,
            prev: self.tail,
            next: None,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(node);
            slot
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        };

        match self.tail {
            Some(tail) => {
                if let Some(node) = self.slots[tail].as_mut() {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.index.insert(key, slot);
    }

    /// Remove and release the entry for `key`.
    ///
    /// Returns whether an entry was present.
    pub fn remove(&mut self, key: &ResourceKey) -> bool {
        let Some(slot) = self.index.get(key).copied() else {
            return false;
        };
        self.release_slot(slot);
        true
    }

    /// Evict up to `len() - limit` entries, oldest first, skipping every
    /// entry for which `is_live` returns true.
    ///
    /// Returns the number of entries evicted. If too few entries are
    /// evictable the cache stays above `limit`.
    pub fn evict_excess(
        &mut self,
        limit: usize,
        mut is_live: impl FnMut(&ResourceKey) -> bool,
    ) -> usize {
        let excess = self.len().saturating_sub(limit);
        let mut evicted = 0;
        let mut cursor = self.head;

        while evicted < excess {
            let Some(slot) = cursor else { break };
            let Some(node) = self.slots[slot].as_ref() else {
                break;
            };
            cursor = node.next;
            if !is_live(&node.key) {
                self.release_slot(slot);
                evicted += 1;
            }
        }

        evicted
    }

    /// Release every entry, oldest first.
    pub fn clear(&mut self) {
        while let Some(head) = self.head {
            self.release_slot(head);
        }
        self.slots.clear();
        self.free.clear();
    }

    /// Keys in insertion order, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        std::iter::successors(self.head, |&slot| {
            self.slots[slot].as_ref().and_then(|node| node.next)
        })
        .filter_map(|slot| self.slots[slot].as_ref().map(|node| &node.key))
    }

    fn release_slot(&mut self, slot: usize) {
        let Some(node) = self.slots[slot].take() else {
            return;
        };

        match node.prev {
            Some(prev) => {
                if let Some(p) = self.slots[prev].as_mut() {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.slots[next].as_mut() {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }

        self.index.remove(&node.key);
        self.free.push(slot);

        if let Some(release) = &self.release {
            release(&node.key, &node.value);
        }
    }
}

impl<V> Default for ContentCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for ContentCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCache")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .field("has_release_hook", &self.release.is_some())
            .finish()
    }
}
