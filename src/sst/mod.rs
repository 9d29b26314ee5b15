//! Sorted-table file format.
//!
//! File layout:
//!
//! ```text
//! [data block]*
//! [filter block]       (optional)
//! [meta-index block]
//! [index block]
//! [footer]             (48 bytes, fixed)
//! ```
//!
//! Every block is stored as `contents || type(1) || masked_crc32c(4)`; the
//! checksum covers the contents and the type byte. The footer holds the
//! meta-index and index handles, zero-padded so a reader can position at
//! `end - 48` unconditionally, and closes with the table magic.

pub mod block;
pub mod builder;
pub mod filter_block;

use crate::coding::{decode_fixed64, get_varint64, put_fixed64, put_varint64};
use crate::error::{Error, Result};

/// Last eight bytes of every well-formed table file.
pub const TABLE_MAGIC: u64 = 0xdb47_7524_8b80_fb57;

/// One type byte plus the masked checksum.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Maximum encoding of a handle: two full varint64 values.
pub const MAX_ENCODED_HANDLE: usize = 20;

/// Two padded handles plus the magic.
pub const FOOTER_SIZE: usize = 2 * MAX_ENCODED_HANDLE + 8;

/// Location of a block within a table file. The size excludes the trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<BlockHandle> {
        let offset = get_varint64(input).ok_or_else(|| Error::corruption("bad block handle"))?;
        let size = get_varint64(input).ok_or_else(|| Error::corruption("bad block handle"))?;
        Ok(BlockHandle { offset, size })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        dst.resize(start + FOOTER_SIZE - 8, 0);
        put_fixed64(dst, TABLE_MAGIC);
        debug_assert_eq!(dst.len() - start, FOOTER_SIZE);
    }

    /// Decodes the trailing footer out of `input`, which must be exactly
    /// the last `FOOTER_SIZE` bytes of a table file.
    pub fn decode_from(input: &[u8]) -> Result<Footer> {
        if input.len() < FOOTER_SIZE {
            return Err(Error::corruption("footer too short"));
        }
        if decode_fixed64(&input[FOOTER_SIZE - 8..]) != TABLE_MAGIC {
            return Err(Error::corruption("bad table magic"));
        }
        let mut cursor = &input[..FOOTER_SIZE - 8];
        let metaindex_handle = BlockHandle::decode_from(&mut cursor)?;
        let index_handle = BlockHandle::decode_from(&mut cursor)?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_handle_round_trip() {
        for handle in [
            BlockHandle::default(),
            BlockHandle { offset: 1, size: 2 },
            BlockHandle {
                offset: u64::MAX,
                size: u64::MAX - 1,
            },
        ] {
            let mut buf = Vec::new();
            handle.encode_to(&mut buf);
            assert!(buf.len() <= MAX_ENCODED_HANDLE);
            let mut input = buf.as_slice();
            assert_eq!(BlockHandle::decode_from(&mut input).unwrap(), handle);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn footer_is_fixed_size_and_round_trips() {
        let footer = Footer {
            metaindex_handle: BlockHandle {
                offset: 4096,
                size: 100,
            },
            index_handle: BlockHandle {
                offset: 4201,
                size: 2000,
            },
        };
        let mut buf = Vec::new();
        footer.encode_to(&mut buf);
        assert_eq!(buf.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode_from(&buf).unwrap(), footer);
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let mut buf = Vec::new();
        Footer::default().encode_to(&mut buf);
        let n = buf.len();
        buf[n - 1] ^= 0xff;
        assert!(matches!(
            Footer::decode_from(&buf),
            Err(Error::Corruption(_))
        ));
        assert!(Footer::decode_from(&buf[..10]).is_err());
    }
}
