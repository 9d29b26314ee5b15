//! Store-wide tuning knobs.

use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;

/// Number of on-disk levels.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which writes are throttled.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writes stop entirely.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a freshly flushed memtable may be placed at when it
/// overlaps nothing below.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Block codec. The wire values are part of the table format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Snappy = 1,
}

impl CompressionType {
    pub fn from_u8(v: u8) -> Option<CompressionType> {
        match v {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Options {
    /// Order over the keys handed to the table builder and memtable. Wrap
    /// the user comparator in an `InternalKeyComparator` when the keys are
    /// internal keys.
    pub comparator: Arc<dyn Comparator>,

    /// When set, every table gets a filter block and a meta-index entry
    /// pointing at it.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    pub compression: CompressionType,

    /// Uncompressed size threshold at which a data block is cut.
    pub block_size: usize,

    /// Entries between restart points in a data block.
    pub block_restart_interval: usize,

    /// Memtable size at which the owner should rotate and flush it.
    pub write_buffer_size: usize,

    /// Target size for table files produced by compactions.
    pub max_file_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            comparator: Arc::new(BytewiseComparator),
            filter_policy: None,
            compression: CompressionType::Snappy,
            block_size: 4096,
            block_restart_interval: 16,
            write_buffer_size: 4 * 1024 * 1024,
            max_file_size: 2 * 1024 * 1024,
        }
    }
}
