//! Prefix-compressed key/value block.
//!
//! Keys drop the prefix they share with the previous key; every
//! `restart_interval` entries the compression resets so a reader can binary
//! search the restart points. Entry format:
//!
//! ```text
//! varint32(shared) | varint32(non_shared) | varint32(vlen)
//! key_delta[non_shared] | value[vlen]
//! ```
//!
//! The block closes with `u32_le[restart_offset]* || u32_le(num_restarts)`.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{put_fixed32, put_varint32};
use crate::comparator::Comparator;

pub struct BlockBuilder {
    restart_interval: usize,
    cmp: Arc<dyn Comparator>,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    // Entries since the last restart point.
    counter: usize,
    finished: bool,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize, cmp: Arc<dyn Comparator>) -> Self {
        assert!(restart_interval >= 1);
        BlockBuilder {
            restart_interval,
            cmp,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            finished: false,
            last_key: Vec::new(),
        }
    }

    /// Clears all state for the next block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// Appends one entry. `key` must order after every key already added.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished);
        assert!(self.counter <= self.restart_interval);
        debug_assert!(
            self.buffer.is_empty()
                || self.cmp.compare(key, &self.last_key) == Ordering::Greater
        );

        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, non_shared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        // Extend the retained prefix in place instead of recopying the key.
        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert_eq!(self.last_key, key);
        self.counter += 1;
    }

    /// Appends the restart trailer and returns the finished block contents.
    pub fn finish(&mut self) -> &[u8] {
        for i in 0..self.restarts.len() {
            let offset = self.restarts[i];
            put_fixed32(&mut self.buffer, offset);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Size of the block if `finish` were called now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{decode_fixed32, get_varint32};
    use crate::comparator::BytewiseComparator;

    fn builder(restart_interval: usize) -> BlockBuilder {
        BlockBuilder::new(restart_interval, Arc::new(BytewiseComparator))
    }

    /// Walks the serialised entries, returning (shared, key, value) triples
    /// and the restart offsets.
    fn decode(contents: &[u8]) -> (Vec<(u32, Vec<u8>, Vec<u8>)>, Vec<u32>) {
        let num_restarts = decode_fixed32(&contents[contents.len() - 4..]) as usize;
        let restarts_start = contents.len() - 4 - num_restarts * 4;
        let restarts: Vec<u32> = (0..num_restarts)
            .map(|i| decode_fixed32(&contents[restarts_start + i * 4..]))
            .collect();

        let mut entries = Vec::new();
        let mut input = &contents[..restarts_start];
        let mut last_key: Vec<u8> = Vec::new();
        while !input.is_empty() {
            let shared = get_varint32(&mut input).unwrap();
            let non_shared = get_varint32(&mut input).unwrap() as usize;
            let vlen = get_varint32(&mut input).unwrap() as usize;
            let mut key = last_key[..shared as usize].to_vec();
            key.extend_from_slice(&input[..non_shared]);
            let value = input[non_shared..non_shared + vlen].to_vec();
            input = &input[non_shared + vlen..];
            last_key = key.clone();
            entries.push((shared, key, value));
        }
        (entries, restarts)
    }

    #[test]
    fn empty_block_is_just_the_trailer() {
        let mut b = builder(16);
        let contents = b.finish();
        // One implicit restart at offset zero.
        assert_eq!(contents, [0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn prefix_compression_and_restarts() {
        let mut b = builder(2);
        b.add(b"abc", b"v1");
        b.add(b"abd", b"v2");
        b.add(b"abe", b"v3");
        let contents = b.finish().to_vec();

        let (entries, restarts) = decode(&contents);
        assert_eq!(
            entries,
            vec![
                (0, b"abc".to_vec(), b"v1".to_vec()),
                (2, b"abd".to_vec(), b"v2".to_vec()),
                (0, b"abe".to_vec(), b"v3".to_vec()),
            ]
        );
        assert_eq!(restarts.len(), 2);
        assert_eq!(restarts[0], 0);
        // The second restart points at the third entry, which re-encodes
        // its full key.
        let entry_len = |key: usize, value: usize| 3 + key + value;
        assert_eq!(
            restarts[1] as usize,
            entry_len(3, 2) + entry_len(1, 2)
        );
    }

    #[test]
    fn long_key_stream_round_trips() {
        let mut b = builder(16);
        let mut expected = Vec::new();
        for i in 0..1000u32 {
            let key = format!("key{i:06}").into_bytes();
            let value = format!("value{i}").into_bytes();
            b.add(&key, &value);
            expected.push((key, value));
        }
        let contents = b.finish().to_vec();
        let (entries, restarts) = decode(&contents);

        assert_eq!(
            entries
                .iter()
                .map(|(_, k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>(),
            expected
        );
        // 1000 entries at interval 16: restart for entries 0, 16, ...
        assert_eq!(restarts.len(), (1000 + 15) / 16);
        // Restart entries store their key whole.
        for (i, (shared, _, _)) in entries.iter().enumerate() {
            if i % 16 == 0 {
                assert_eq!(*shared, 0, "entry {i}");
            }
        }
    }

    #[test]
    fn size_estimate_tracks_finished_size() {
        let mut b = builder(16);
        assert_eq!(b.current_size_estimate(), 8);
        let mut last = b.current_size_estimate();
        for i in 0..100u32 {
            b.add(format!("key{i:04}").as_bytes(), b"value");
            assert!(b.current_size_estimate() > last);
            last = b.current_size_estimate();
        }
        assert_eq!(b.finish().len(), last);
    }

    #[test]
    fn reset_yields_a_fresh_block() {
        let mut b = builder(16);
        b.add(b"a", b"1");
        b.finish();
        b.reset();
        assert!(b.is_empty());
        b.add(b"z", b"2");
        let (entries, _) = decode(&b.finish().to_vec());
        assert_eq!(entries, vec![(0, b"z".to_vec(), b"2".to_vec())]);
    }
}
