//! In-memory write buffer.
//!
//! Each entry is encoded once into arena memory and the skiplist orders raw
//! entry pointers; the comparator decodes the length prefix to locate the
//! internal key. Entry layout:
//!
//! ```text
//! varint32(klen + 8) | user_key | tag (8, LE) | varint32(vlen) | value
//! ```
//!
//! One buffer per entry, addressable from a single pointer, no second
//! allocation for the value.
//!
//! Mutation (`add`) requires external serialisation by the caller, in
//! practice the same mutex that orders log appends. `get` and iteration are
//! lock-free against the writer; share the table as `Arc<MemTable>` and the
//! arena lives exactly as long as the last holder.

use std::cmp::Ordering;
use std::slice;
use std::sync::Arc;

use bytes::Bytes;

use crate::arena::Arena;
use crate::coding::{decode_fixed64, encode_varint32, get_varint32_ptr, varint_length};
use crate::comparator::Comparator;
use crate::internal_key::{
    extract_user_key, pack_seqno_and_kind, InternalKeyComparator, KeyKind, LookupKey,
};
use crate::skiplist::{Iter as SkipListIter, KeyComparator, SkipList};

/// Reconstructs the internal key of the entry at `p`.
///
/// # Safety
/// `p` must point at an entry or lookup key encoded in the layout above.
unsafe fn entry_internal_key<'a>(p: *const u8) -> &'a [u8] {
    // wrapping_add: the varint terminates inside the entry, but its 5-byte
    // ceiling may lie past the arena block.
    let (klen, data) =
        get_varint32_ptr(p, p.wrapping_add(5)).expect("memtable entry length prefix");
    slice::from_raw_parts(data, klen as usize)
}

/// Reconstructs both the internal key and the value of the entry at `p`.
///
/// # Safety
/// As for [`entry_internal_key`].
unsafe fn decode_entry<'a>(p: *const u8) -> (&'a [u8], &'a [u8]) {
    let key = entry_internal_key(p);
    let value_prefix = key.as_ptr().add(key.len());
    let (vlen, data) = get_varint32_ptr(value_prefix, value_prefix.wrapping_add(5))
        .expect("memtable value length prefix");
    (key, slice::from_raw_parts(data, vlen as usize))
}

/// Decodes the length-prefixed internal key on both sides and defers to the
/// internal-key order.
#[derive(Clone)]
struct EntryComparator {
    cmp: InternalKeyComparator,
}

impl KeyComparator<*const u8> for EntryComparator {
    fn compare(&self, a: &*const u8, b: &*const u8) -> Ordering {
        // SAFETY: the skiplist only holds pointers produced by `add`, and
        // seek targets are lookup keys with the same framing.
        let (a, b) = unsafe { (entry_internal_key(*a), entry_internal_key(*b)) };
        self.cmp.compare(a, b)
    }
}

pub struct MemTable {
    cmp: InternalKeyComparator,
    arena: Arc<Arena>,
    table: SkipList<*const u8, EntryComparator>,
}

impl MemTable {
    pub fn new(cmp: InternalKeyComparator) -> Self {
        let arena = Arc::new(Arena::new());
        let table = SkipList::new(
            EntryComparator { cmp: cmp.clone() },
            arena.clone(),
            std::ptr::null(),
        );
        MemTable { cmp, arena, table }
    }

    /// Bytes held by the arena backing this table. Safe to call while the
    /// table is being written.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Appends one versioned entry. A deletion carries an empty value.
    ///
    /// Requires external serialisation against other mutating calls.
    pub fn add(&self, seqno: u64, kind: KeyKind, user_key: &[u8], value: &[u8]) {
        let klen = user_key.len() + 8;
        let encoded_len =
            varint_length(klen as u64) + klen + varint_length(value.len() as u64) + value.len();
        let buf = self.arena.allocate(encoded_len);
        // SAFETY: `buf` is a fresh allocation of exactly `encoded_len`
        // bytes, not yet visible to any reader.
        let dst = unsafe { slice::from_raw_parts_mut(buf, encoded_len) };
        let mut at = encode_varint32(dst, klen as u32);
        dst[at..at + user_key.len()].copy_from_slice(user_key);
        at += user_key.len();
        dst[at..at + 8].copy_from_slice(&pack_seqno_and_kind(seqno, kind).to_le_bytes());
        at += 8;
        at += encode_varint32(&mut dst[at..], value.len() as u32);
        dst[at..at + value.len()].copy_from_slice(value);
        debug_assert_eq!(at + value.len(), encoded_len);

        self.table.insert(buf as *const u8);
    }

    /// Point lookup at the snapshot baked into `key`.
    ///
    /// - `None`: no version of the key lives in this table.
    /// - `Some(None)`: the newest visible version is a tombstone.
    /// - `Some(Some(value))`: the newest visible version is a live value.
    pub fn get(&self, key: &LookupKey) -> Option<Option<Bytes>> {
        let mut iter = self.table.iter();
        iter.seek(&key.memtable_key().as_ptr());
        if !iter.valid() {
            return None;
        }

        // The entry at or after the probe is only a hit if its user key
        // matches; otherwise the probe fell into the next key's versions.
        let (ikey, value) = unsafe { decode_entry(iter.key()) };
        let user_cmp = self.cmp.user_comparator();
        if user_cmp.compare(extract_user_key(ikey), key.user_key()) != Ordering::Equal {
            return None;
        }

        let tag = decode_fixed64(&ikey[ikey.len() - 8..]);
        match KeyKind::from_u8((tag & 0xff) as u8) {
            Some(KeyKind::Value) => Some(Some(Bytes::copy_from_slice(value))),
            _ => Some(None),
        }
    }

    /// Iterator over the full contents in internal-key order. Keys and
    /// values borrow from the arena and stay valid while the table lives.
    pub fn iter(&self) -> MemTableIter<'_> {
        MemTableIter {
            iter: self.table.iter(),
            scratch: Vec::new(),
        }
    }
}

pub struct MemTableIter<'a> {
    iter: SkipListIter<'a, *const u8, EntryComparator>,
    scratch: Vec<u8>,
}

impl<'a> MemTableIter<'a> {
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Positions at the first entry whose internal key is >= `internal_key`.
    pub fn seek(&mut self, internal_key: &[u8]) {
        // The skiplist compares memtable-key framing; wrap the target.
        self.scratch.clear();
        let mut prefix = [0u8; 5];
        let n = encode_varint32(&mut prefix, internal_key.len() as u32);
        self.scratch.extend_from_slice(&prefix[..n]);
        self.scratch.extend_from_slice(internal_key);
        self.iter.seek(&self.scratch.as_ptr());
    }

    pub fn next(&mut self) {
        self.iter.next();
    }

    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// The entry's internal key.
    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { entry_internal_key(self.iter.key()) }
    }

    pub fn value(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { decode_entry(self.iter.key()).1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::internal_key::parse_internal_key;

    fn new_memtable() -> MemTable {
        MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn get(mem: &MemTable, user_key: &[u8], seqno: u64) -> Option<Option<Bytes>> {
        mem.get(&LookupKey::new(user_key, seqno))
    }

    #[test]
    fn get_returns_newest_visible_version() {
        let mem = new_memtable();
        mem.add(1, KeyKind::Value, b"k", b"v1");
        mem.add(2, KeyKind::Value, b"k", b"v2");

        assert_eq!(get(&mem, b"k", 3), Some(Some(Bytes::from("v2"))));
        assert_eq!(get(&mem, b"k", 2), Some(Some(Bytes::from("v2"))));
        assert_eq!(get(&mem, b"k", 1), Some(Some(Bytes::from("v1"))));
        assert_eq!(get(&mem, b"k", 0), None);
        assert_eq!(get(&mem, b"other", 3), None);
    }

    #[test]
    fn tombstone_shadows_older_value() {
        let mem = new_memtable();
        mem.add(1, KeyKind::Value, b"k", b"v1");
        mem.add(2, KeyKind::Value, b"k", b"v2");
        mem.add(3, KeyKind::Deletion, b"k", b"");

        assert_eq!(get(&mem, b"k", 3), Some(None));
        assert_eq!(get(&mem, b"k", 2), Some(Some(Bytes::from("v2"))));
    }

    #[test]
    fn empty_values_and_keys_round_trip() {
        let mem = new_memtable();
        mem.add(1, KeyKind::Value, b"empty", b"");
        mem.add(2, KeyKind::Value, b"", b"value for empty key");

        assert_eq!(get(&mem, b"empty", 5), Some(Some(Bytes::new())));
        assert_eq!(
            get(&mem, b"", 5),
            Some(Some(Bytes::from("value for empty key")))
        );
    }

    #[test]
    fn iterates_in_internal_key_order() {
        let mem = new_memtable();
        mem.add(4, KeyKind::Value, b"b", b"b4");
        mem.add(1, KeyKind::Value, b"a", b"a1");
        mem.add(3, KeyKind::Value, b"a", b"a3");
        mem.add(2, KeyKind::Deletion, b"c", b"");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            let parsed = parse_internal_key(iter.key()).unwrap();
            seen.push((
                parsed.user_key.to_vec(),
                parsed.seqno,
                parsed.kind,
                iter.value().to_vec(),
            ));
            iter.next();
        }

        // Ascending user key, newest version first within a key.
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 3, KeyKind::Value, b"a3".to_vec()),
                (b"a".to_vec(), 1, KeyKind::Value, b"a1".to_vec()),
                (b"b".to_vec(), 4, KeyKind::Value, b"b4".to_vec()),
                (b"c".to_vec(), 2, KeyKind::Deletion, b"".to_vec()),
            ]
        );
    }

    #[test]
    fn seek_positions_at_first_entry_at_or_after_target() {
        let mem = new_memtable();
        mem.add(1, KeyKind::Value, b"b", b"1");
        mem.add(2, KeyKind::Value, b"d", b"2");

        let mut iter = mem.iter();
        iter.seek(LookupKey::new(b"c", u64::MAX >> 8).internal_key());
        assert!(iter.valid());
        assert_eq!(parse_internal_key(iter.key()).unwrap().user_key, b"d");

        iter.seek(LookupKey::new(b"e", u64::MAX >> 8).internal_key());
        assert!(!iter.valid());
    }

    #[test]
    fn memory_usage_grows_with_inserts() {
        let mem = new_memtable();
        let before = mem.approximate_memory_usage();
        for i in 0..1000u32 {
            mem.add(
                i as u64 + 1,
                KeyKind::Value,
                format!("key{i:05}").as_bytes(),
                &vec![b'v'; 100],
            );
        }
        assert!(mem.approximate_memory_usage() > before + 100 * 1000);
    }

    #[test]
    fn large_keys_probe_through_heap_lookup_buffer() {
        let mem = new_memtable();
        let big_key = vec![b'k'; 4000];
        mem.add(9, KeyKind::Value, &big_key, b"big");
        assert_eq!(get(&mem, &big_key, 10), Some(Some(Bytes::from("big"))));
    }
}
