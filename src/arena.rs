//! Bump allocator backing a memtable.
//!
//! Memory is carved from fixed-size blocks with a moving pointer; nothing is
//! freed individually, and dropping the arena releases every block at once.
//! Handed-out addresses stay stable for the arena's lifetime: blocks are
//! boxed slices whose storage never moves even as the block list grows.

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

const BLOCK_SIZE: usize = 4096;

pub struct Arena {
    alloc_ptr: Cell<*mut u8>,
    alloc_bytes_remaining: Cell<usize>,
    // u64 slots keep every block base pointer-aligned.
    blocks: RefCell<Vec<Box<[u64]>>>,
    memory_usage: AtomicUsize,
}

impl Arena {
    pub fn new() -> Self {
        Arena {
            alloc_ptr: Cell::new(ptr::null_mut()),
            alloc_bytes_remaining: Cell::new(0),
            blocks: RefCell::new(Vec::new()),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Returns `bytes` fresh bytes. No alignment guarantee beyond 1.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        if bytes <= self.alloc_bytes_remaining.get() {
            let p = self.alloc_ptr.get();
            // SAFETY: the current block has at least `bytes` left.
            self.alloc_ptr.set(unsafe { p.add(bytes) });
            self.alloc_bytes_remaining
                .set(self.alloc_bytes_remaining.get() - bytes);
            p
        } else {
            self.allocate_fallback(bytes)
        }
    }

    /// Like `allocate`, with the result aligned for pointer-sized loads.
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        let align = mem::align_of::<*mut u8>().max(8);
        let current = self.alloc_ptr.get() as usize;
        let slop = current.wrapping_neg() & (align - 1);
        let needed = bytes + slop;
        if needed <= self.alloc_bytes_remaining.get() {
            // SAFETY: slop + bytes fit in the current block.
            let p = unsafe { self.alloc_ptr.get().add(slop) };
            self.alloc_ptr.set(unsafe { p.add(bytes) });
            self.alloc_bytes_remaining
                .set(self.alloc_bytes_remaining.get() - needed);
            debug_assert_eq!(p as usize & (align - 1), 0);
            p
        } else {
            // Fresh blocks start max-aligned.
            self.allocate_fallback(bytes)
        }
    }

    fn allocate_fallback(&self, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // Oversized objects get a dedicated block so the remainder of
            // the current block keeps serving small allocations.
            return self.allocate_new_block(bytes);
        }

        let p = self.allocate_new_block(BLOCK_SIZE);
        // SAFETY: the fresh block holds BLOCK_SIZE >= bytes.
        self.alloc_ptr.set(unsafe { p.add(bytes) });
        self.alloc_bytes_remaining.set(BLOCK_SIZE - bytes);
        p
    }

    fn allocate_new_block(&self, block_bytes: usize) -> *mut u8 {
        let words = (block_bytes + 7) / 8;
        let mut block = vec![0u64; words].into_boxed_slice();
        let p = block.as_mut_ptr() as *mut u8;
        self.blocks.borrow_mut().push(block);
        self.memory_usage.fetch_add(
            words * 8 + mem::size_of::<Box<[u64]>>(),
            Ordering::Relaxed,
        );
        p
    }

    /// Total bytes held, including block bookkeeping. Safe to read while the
    /// writer is allocating.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

// Allocation is single-writer (the memtable contract). Readers only ever
// dereference previously returned addresses, which stay valid and stable
// until the arena is dropped.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}
