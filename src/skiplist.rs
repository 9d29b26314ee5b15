//! Ordered in-memory index with lock-free reads.
//!
//! Thread safety
//! -------------
//!
//! One writer, any number of readers. `insert` requires external
//! serialisation (in practice the same mutex that orders log appends);
//! reads need no coordination at all. The invariants that make this work:
//!
//! - Nodes live in the arena and are never moved or freed until the whole
//!   list is dropped.
//! - A node's key never changes once the node is reachable from the head.
//! - Publication happens through a release store into the predecessor's
//!   forward link at each level; traversal loads links with acquire, so a
//!   reader sees either no node or a fully initialised one.
//!
//! The key type is opaque to the list: the memtable stores a raw pointer to
//! an encoded entry and supplies a comparator that decodes it.

use std::cmp::Ordering as CmpOrdering;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::arena::Arena;

pub const MAX_HEIGHT: usize = 12;

// Each extra level is taken with probability 1/4.
const BRANCHING_FACTOR: u32 = 4;

/// Ordering over the skiplist's opaque key type.
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> CmpOrdering;
}

#[repr(C)]
struct Node<K> {
    key: K,
    // Variable-length tower: the node is allocated with `height` link slots
    // directly after `key`, and `next[0]` is the lowest level.
    next: [AtomicPtr<Node<K>>; 1],
}

impl<K> Node<K> {
    unsafe fn link(&self, level: usize) -> &AtomicPtr<Node<K>> {
        &*self.next.as_ptr().add(level)
    }

    /// Acquire load: observes a fully initialised version of the node the
    /// link points at.
    unsafe fn next(&self, level: usize) -> *mut Node<K> {
        self.link(level).load(Ordering::Acquire)
    }

    /// Release store: publishes `node` through this link.
    unsafe fn set_next(&self, level: usize, node: *mut Node<K>) {
        self.link(level).store(node, Ordering::Release);
    }

    // Relaxed variants for links not yet visible to readers.
    unsafe fn next_relaxed(&self, level: usize) -> *mut Node<K> {
        self.link(level).load(Ordering::Relaxed)
    }

    unsafe fn set_next_relaxed(&self, level: usize, node: *mut Node<K>) {
        self.link(level).store(node, Ordering::Relaxed);
    }
}

pub struct SkipList<K, C> {
    head: *mut Node<K>,
    // Read racily by readers; a stale value only costs a level of descent.
    max_height: AtomicUsize,
    arena: Arc<Arena>,
    cmp: C,
}

// The raw node pointers (including pointer-typed keys) reference arena
// memory the list keeps alive through `arena`; sharing is sound under the
// one-writer/many-readers contract documented above.
unsafe impl<K, C: Send> Send for SkipList<K, C> {}
unsafe impl<K, C: Sync> Sync for SkipList<K, C> {}

impl<K: Copy, C: KeyComparator<K>> SkipList<K, C> {
    /// `head_key` fills the head node's key slot; it is never compared or
    /// yielded.
    pub fn new(cmp: C, arena: Arc<Arena>, head_key: K) -> Self {
        let list = SkipList {
            head: ptr::null_mut(),
            max_height: AtomicUsize::new(1),
            arena,
            cmp,
        };
        let head = list.new_node(head_key, MAX_HEIGHT);
        SkipList { head, ..list }
    }

    fn new_node(&self, key: K, height: usize) -> *mut Node<K> {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        let size = mem::size_of::<Node<K>>()
            + (height - 1) * mem::size_of::<AtomicPtr<Node<K>>>();
        let node = self.arena.allocate_aligned(size) as *mut Node<K>;
        // SAFETY: `node` points at `size` fresh aligned bytes; initialise
        // the key and exactly `height` link slots before anything reads it.
        unsafe {
            ptr::addr_of_mut!((*node).key).write(key);
            let links = ptr::addr_of_mut!((*node).next) as *mut AtomicPtr<Node<K>>;
            for level in 0..height {
                links.add(level).write(AtomicPtr::new(ptr::null_mut()));
            }
        }
        node
    }

    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING_FACTOR) {
            height += 1;
        }
        height
    }

    fn max_height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    /// True if `key` orders after the node's key. Null nodes sort after
    /// everything.
    fn key_is_after_node(&self, key: &K, node: *mut Node<K>) -> bool {
        // SAFETY: non-null nodes were initialised by `new_node`.
        !node.is_null() && self.cmp.compare(unsafe { &(*node).key }, key) == CmpOrdering::Less
    }

    /// First node whose key is >= `key`, or null. When `prev` is given, it
    /// receives the predecessor at every level, ready for linking.
    fn find_greater_or_equal(
        &self,
        key: &K,
        mut prev: Option<&mut [*mut Node<K>; MAX_HEIGHT]>,
    ) -> *mut Node<K> {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            // SAFETY: `x` is the head or a published node.
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(prev) = &mut prev {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Latest node with a key < `key`, or the head.
    fn find_less_than(&self, key: &K) -> *mut Node<K> {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if next.is_null()
                || self.cmp.compare(unsafe { &(*next).key }, key) != CmpOrdering::Less
            {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Last node in the list, or the head if empty.
    fn find_last(&self) -> *mut Node<K> {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Inserts `key`. Requires external serialisation against other calls
    /// to `insert`, and that nothing comparing equal is already present.
    pub fn insert(&self, key: K) {
        let mut prev = [ptr::null_mut(); MAX_HEIGHT];
        let x = self.find_greater_or_equal(&key, Some(&mut prev));
        debug_assert!(
            x.is_null() || self.cmp.compare(unsafe { &(*x).key }, &key) != CmpOrdering::Equal,
            "duplicate key inserted into skiplist"
        );

        let height = self.random_height();
        let max_height = self.max_height();
        if height > max_height {
            for slot in prev.iter_mut().take(height).skip(max_height) {
                *slot = self.head;
            }
            // A racing reader that sees the new height before the head's
            // links are filled just finds null there and descends; null
            // sorts after every key.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = self.new_node(key, height);
        for (level, &pred) in prev.iter().enumerate().take(height) {
            // SAFETY: `pred` is the head or a published node with at least
            // `level + 1` links; `node` has `height > level` links. The
            // release store in `set_next` is the publication edge, so the
            // node's own link can be set without a barrier.
            unsafe {
                (*node).set_next_relaxed(level, (*pred).next_relaxed(level));
                (*pred).set_next(level, node);
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let x = self.find_greater_or_equal(key, None);
        !x.is_null() && self.cmp.compare(unsafe { &(*x).key }, key) == CmpOrdering::Equal
    }

    pub fn iter(&self) -> Iter<'_, K, C> {
        Iter {
            list: self,
            node: ptr::null(),
        }
    }
}

pub struct Iter<'a, K, C> {
    list: &'a SkipList<K, C>,
    node: *const Node<K>,
}

impl<'a, K: Copy, C: KeyComparator<K>> Iter<'a, K, C> {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    pub fn key(&self) -> K {
        debug_assert!(self.valid());
        // SAFETY: a valid iterator points at a published, immutable node.
        unsafe { (*self.node).key }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Steps to the previous entry. There are no back links; the
    /// predecessor is found by searching from the top.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let node = self.list.find_less_than(unsafe { &(*self.node).key });
        self.node = if node == self.list.head {
            ptr::null()
        } else {
            node
        };
    }

    /// Positions at the first entry with a key >= `target`.
    pub fn seek(&mut self, target: &K) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.node = if node == self.list.head {
            ptr::null()
        } else {
            node
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicBool;

    struct OrdComparator;

    impl KeyComparator<u64> for OrdComparator {
        fn compare(&self, a: &u64, b: &u64) -> CmpOrdering {
            a.cmp(b)
        }
    }

    fn new_list() -> SkipList<u64, OrdComparator> {
        SkipList::new(OrdComparator, Arc::new(Arena::new()), 0)
    }

    #[test]
    fn empty_list() {
        let list = new_list();
        assert!(!list.contains(&10));

        let mut iter = list.iter();
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek(&100);
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
    }

    #[test]
    fn insert_and_lookup() {
        const N: u64 = 2000;
        const R: u64 = 5000;
        let mut rng = rand::thread_rng();
        let mut keys = BTreeSet::new();
        let list = new_list();

        for _ in 0..N {
            let key = rng.gen_range(0..R);
            if keys.insert(key) {
                list.insert(key);
            }
        }

        for i in 0..R {
            assert_eq!(list.contains(&i), keys.contains(&i), "key {i}");
        }

        // Forward iteration yields exactly the inserted set in order.
        let mut iter = list.iter();
        iter.seek_to_first();
        for &expected in &keys {
            assert!(iter.valid());
            assert_eq!(iter.key(), expected);
            iter.next();
        }
        assert!(!iter.valid());

        // Seek lands on the least key >= target.
        for _ in 0..1000 {
            let target = rng.gen_range(0..R);
            let mut iter = list.iter();
            iter.seek(&target);
            match keys.range(target..).next() {
                Some(&expected) => {
                    assert!(iter.valid());
                    assert_eq!(iter.key(), expected);
                }
                None => assert!(!iter.valid()),
            }
        }

        // Backward iteration.
        let mut iter = list.iter();
        iter.seek_to_last();
        for &expected in keys.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), expected);
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn seek_then_walk_both_ways() {
        let list = new_list();
        for key in [10u64, 20, 30, 40] {
            list.insert(key);
        }
        let mut iter = list.iter();
        iter.seek(&25);
        assert_eq!(iter.key(), 30);
        iter.prev();
        assert_eq!(iter.key(), 20);
        iter.next();
        assert_eq!(iter.key(), 30);
        iter.prev();
        iter.prev();
        assert_eq!(iter.key(), 10);
        iter.prev();
        assert!(!iter.valid());
    }

    // One writer inserting while readers scan: every scan must observe a
    // strictly ascending subset of the final contents, with no spurious or
    // duplicated keys.
    #[test]
    fn concurrent_readers_see_consistent_prefixes() {
        const N: u64 = 10_000;
        const READERS: usize = 4;

        let list = new_list();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..READERS {
                scope.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        let mut seen = Vec::new();
                        let mut iter = list.iter();
                        iter.seek_to_first();
                        while iter.valid() {
                            seen.push(iter.key());
                            iter.next();
                        }
                        assert!(seen.windows(2).all(|w| w[0] < w[1]));
                        assert!(seen.iter().all(|&k| k < N));
                    }
                });
            }

            // Insert in an order that exercises every linking path.
            for key in (0..N).rev().step_by(2).chain((0..N).step_by(2)) {
                list.insert(key);
            }
            done.store(true, Ordering::Release);
        });

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            assert_eq!(iter.key(), count);
            count += 1;
            iter.next();
        }
        assert_eq!(count, N);
    }
}
