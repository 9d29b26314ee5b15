//! Per-table filter block.
//!
//! One filter per 2 KiB window of table offsets, so a reader can go from a
//! data block's offset straight to the filter covering it. Layout:
//!
//! ```text
//! [filter bytes]*
//! u32_le(filter_offset)*        one per filter, into the bytes above
//! u32_le(offset_array_start)
//! u8(base_lg)
//! ```
//!
//! The builder is driven as `(start_block add_key*)* finish`.

use std::sync::Arc;

use crate::coding::{decode_fixed32, put_fixed32};
use crate::filter::FilterPolicy;

/// Every filter covers `1 << FILTER_BASE_LG` bytes of table offsets.
pub const FILTER_BASE_LG: u32 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    // Keys for the filter being accumulated, flattened, plus each key's
    // start offset.
    keys: Vec<u8>,
    start: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            start: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Tells the builder the table is about to write a data block at
    /// `block_offset`; emits filters (possibly empty) until the filter
    /// index catches up with that offset.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        for i in 0..self.filter_offsets.len() {
            let offset = self.filter_offsets[i];
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG as u8);
        &self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.start.len();
        if num_keys == 0 {
            // Empty window: record a zero-length filter.
            self.filter_offsets.push(self.result.len() as u32);
            return;
        }

        self.start.push(self.keys.len());
        let tmp_keys: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.start[i]..self.start[i + 1]])
            .collect();

        self.filter_offsets.push(self.result.len() as u32);
        self.policy.create_filter(&tmp_keys, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

/// Queries a finished filter block. Malformed contents degrade to
/// "may match" so a damaged filter can never hide a key.
pub struct FilterBlockReader<'a> {
    policy: &'a dyn FilterPolicy,
    data: &'a [u8],
    // Offset array, including the trailing array-start word that acts as
    // the limit for the last filter.
    offsets: &'a [u8],
    num: usize,
    base_lg: u32,
}

impl<'a> FilterBlockReader<'a> {
    pub fn new(policy: &'a dyn FilterPolicy, contents: &'a [u8]) -> Self {
        let mut reader = FilterBlockReader {
            policy,
            data: &[],
            offsets: &[],
            num: 0,
            base_lg: 0,
        };
        let n = contents.len();
        if n < 5 {
            return reader;
        }
        let array_offset = decode_fixed32(&contents[n - 5..n - 1]) as usize;
        if array_offset > n - 5 {
            return reader;
        }
        reader.base_lg = contents[n - 1] as u32;
        reader.data = &contents[..array_offset];
        reader.offsets = &contents[array_offset..n - 1];
        reader.num = (n - 5 - array_offset) / 4;
        reader
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num {
            // Out of range counts as a potential match.
            return true;
        }
        let start = decode_fixed32(&self.offsets[index * 4..]) as usize;
        let limit = decode_fixed32(&self.offsets[index * 4 + 4..]) as usize;
        if start == limit {
            // Empty filters match no keys.
            return false;
        }
        if start > limit || limit > self.data.len() {
            return true;
        }
        self.policy.key_may_match(key, &self.data[start..limit])
    }
}
