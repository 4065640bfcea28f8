//! Shared block cache.
//!
//! A segmented LRU of byte blocks: new entries land in a *young* segment
//! (20% of capacity) and are promoted to the *old* segment (80%) on their
//! second touch. One-shot blocks from large scans wash through young
//! without displacing the repeatedly-read blocks resident in old. Eviction
//! demotes old's tail back into young and drops young's tail entirely.
//!
//! All operations are O(1) and run under a single internal mutex, which is
//! never held across IO.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const NIL: usize = usize::MAX;

struct Node<K> {
    key: K,
    data: Arc<Vec<u8>>,
    old: bool,
    prev: usize,
    next: usize,
}

#[derive(Clone, Copy)]
struct List {
    head: usize,
    tail: usize,
}

impl List {
    fn new() -> Self {
        Self { head: NIL, tail: NIL }
    }
}

struct Inner<K> {
    entries: HashMap<K, usize>,
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    young: List,
    old: List,
    young_size: u64,
    old_size: u64,
    target_young: u64,
    target_old: u64,
}

/// A cache of key -> block bytes implementing a segmented LRU.
pub struct Cache<K: Eq + Hash + Clone> {
    inner: Mutex<Inner<K>>,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone> Cache<K> {
    /// Creates a cache with the given byte capacity.
    ///
    /// Panics if the capacity is too small to give both segments a non-zero
    /// target (capacity < 5).
    pub fn new(capacity: u64) -> Self {
        let target_young = capacity / 5;
        let target_old = capacity - target_young;
        assert!(
            target_young > 0 && target_old > 0,
            "cache capacity {capacity} leaves an empty segment"
        );
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                young: List::new(),
                old: List::new(),
                young_size: 0,
                old_size: 0,
                target_young,
                target_old,
            }),
            next_id: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a process-unique id. Callers partition the cache space by
    /// folding the id into their keys.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Retrieves the block for `key`, promoting it on a second touch.
    pub fn get(&self, key: &K) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let Some(&slot) = inner.entries.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        let old = inner.node(slot).old;
        if old {
            inner.unlink(slot);
            inner.push_front_old(slot);
        } else {
            let size = inner.node(slot).data.len() as u64;
            inner.unlink(slot);
            inner.node_mut(slot).old = true;
            inner.young_size -= size;
            inner.old_size += size;
            inner.push_front_old(slot);
            inner.run_eviction();
        }
        Some(inner.node(slot).data.clone())
    }

    /// Inserts a block at the front of the young segment. Duplicate keys
    /// are dropped; the cached block is identical bytes by construction.
    pub fn insert(&self, key: K, data: Arc<Vec<u8>>) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        if inner.entries.contains_key(&key) {
            return;
        }
        let size = data.len() as u64;
        let slot = inner.alloc(Node {
            key: key.clone(),
            data,
            old: false,
            prev: NIL,
            next: NIL,
        });
        inner.entries.insert(key, slot);
        inner.young_size += size;
        inner.push_front_young(slot);
        inner.run_eviction();
    }

    /// Returns (hits, misses) counters.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl<K: Eq + Hash + Clone> Inner<K> {
    fn node(&self, slot: usize) -> &Node<K> {
        self.nodes[slot].as_ref().expect("vacant cache slot")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<K> {
        self.nodes[slot].as_mut().expect("vacant cache slot")
    }

    fn alloc(&mut self, node: Node<K>) -> usize {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = Some(node);
            slot
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn list_mut(&mut self, old: bool) -> &mut List {
        if old {
            &mut self.old
        } else {
            &mut self.young
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next, old) = {
            let n = self.node(slot);
            (n.prev, n.next, n.old)
        };
        if prev != NIL {
            self.node_mut(prev).next = next;
        } else {
            self.list_mut(old).head = next;
        }
        if next != NIL {
            self.node_mut(next).prev = prev;
        } else {
            self.list_mut(old).tail = prev;
        }
        let n = self.node_mut(slot);
        n.prev = NIL;
        n.next = NIL;
    }

    fn push_front(&mut self, slot: usize, old: bool) {
        let head = self.list_mut(old).head;
        self.node_mut(slot).next = head;
        self.node_mut(slot).prev = NIL;
        if head != NIL {
            self.node_mut(head).prev = slot;
        } else {
            self.list_mut(old).tail = slot;
        }
        self.list_mut(old).head = slot;
    }

    fn push_front_young(&mut self, slot: usize) {
        self.push_front(slot, false);
    }

    fn push_front_old(&mut self, slot: usize) {
        self.push_front(slot, true);
    }

    fn run_eviction(&mut self) {
        // Old overflow demotes its tail back into young rather than
        // dropping it, so a once-hot block gets a second chance.
        while self.old_size > self.target_old {
            let tail = self.old.tail;
            let size = self.node(tail).data.len() as u64;
            self.unlink(tail);
            self.node_mut(tail).old = false;
            self.old_size -= size;
            self.young_size += size;
            self.push_front_young(tail);
        }
        while self.young_size > self.target_young {
            let tail = self.young.tail;
            self.unlink(tail);
            let node = self.nodes[tail].take().expect("vacant cache slot");
            self.young_size -= node.data.len() as u64;
            self.entries.remove(&node.key);
            self.free.push(tail);
        }
    }
}
