//! Streams sorted entries into an on-disk table.
//!
//! Data blocks are cut at `block_size`, each followed by its trailer; the
//! index entry for a finished block is deferred until the next key arrives
//! so the separator can be shortened (e.g. "the r" between "the quick brown
//! fox" and "the who"). Filters, the meta-index, the index and the footer
//! are written by `finish`.
//!
//! The first I/O failure latches: every later call short-circuits and
//! returns the same error without touching the file again.

use std::cmp::Ordering;

use log::{debug, trace};

use crate::coding::{mask_crc, put_fixed32};
use crate::error::Result;
use crate::io::WritableFile;
use crate::options::{CompressionType, Options};
use crate::sst::block::BlockBuilder;
use crate::sst::filter_block::FilterBlockBuilder;
use crate::sst::{BlockHandle, Footer, BLOCK_TRAILER_SIZE};

pub struct TableBuilder {
    options: Options,
    file: Box<dyn WritableFile>,
    offset: u64,
    status: Result<()>,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,
    filter_block: Option<FilterBlockBuilder>,
    // The index entry for a finished data block is pending until the next
    // key arrives; true only while the data block is empty.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    compressed_output: Vec<u8>,
}

impl TableBuilder {
    pub fn new(options: Options, file: Box<dyn WritableFile>) -> Self {
        let mut filter_block = options
            .filter_policy
            .clone()
            .map(FilterBlockBuilder::new);
        if let Some(fb) = &mut filter_block {
            fb.start_block(0);
        }
        TableBuilder {
            data_block: BlockBuilder::new(
                options.block_restart_interval,
                options.comparator.clone(),
            ),
            // Every index key is a restart point: the index is pure
            // random-access and gains nothing from prefix compression.
            index_block: BlockBuilder::new(1, options.comparator.clone()),
            options,
            file,
            offset: 0,
            status: Ok(()),
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            compressed_output: Vec::new(),
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_ok()
    }

    /// The latched status: the first error any operation hit, if any.
    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    /// Appends one entry. `key` must order after every key already added.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed);
        self.status.clone()?;
        if self.num_entries > 0 {
            debug_assert_eq!(
                self.options.comparator.compare(key, &self.last_key),
                Ordering::Greater,
                "keys added out of order"
            );
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }

        if let Some(fb) = &mut self.filter_block {
            fb.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Cuts the current data block, writing it out with its trailer.
    pub fn flush(&mut self) -> Result<()> {
        assert!(!self.closed);
        self.status.clone()?;
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let result = {
            let raw = self.data_block.finish();
            write_block(
                self.file.as_mut(),
                &mut self.offset,
                &mut self.compressed_output,
                self.options.compression,
                raw,
            )
        };
        self.data_block.reset();
        let handle = self.latch(result)?;
        trace!(
            "data block at {} ({} bytes)",
            handle.offset,
            handle.size
        );
        self.pending_handle = handle;
        self.pending_index_entry = true;

        let flushed = self.file.flush();
        self.latch(flushed)?;

        if let Some(fb) = &mut self.filter_block {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes the filter, meta-index and index blocks plus the footer.
    /// No entries may be added afterwards.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        assert!(!self.closed);
        self.closed = true;

        // Filter block. Never compressed: its offset array is absolute.
        let mut filter_handle = None;
        if self.status.is_ok() {
            let result = match &mut self.filter_block {
                Some(fb) => Some(write_raw_block(
                    self.file.as_mut(),
                    &mut self.offset,
                    fb.finish(),
                    CompressionType::None,
                )),
                None => None,
            };
            if let Some(result) = result {
                filter_handle = Some(self.latch(result)?);
            }
        }

        // Meta-index block: maps "filter.<policy>" to the filter handle.
        let mut metaindex_handle = BlockHandle::default();
        if self.status.is_ok() {
            let mut metaindex_block = BlockBuilder::new(
                self.options.block_restart_interval,
                self.options.comparator.clone(),
            );
            if let (Some(handle), Some(policy)) = (filter_handle, &self.options.filter_policy) {
                let mut key = b"filter.".to_vec();
                key.extend_from_slice(policy.name().as_bytes());
                let mut handle_encoding = Vec::new();
                handle.encode_to(&mut handle_encoding);
                metaindex_block.add(&key, &handle_encoding);
            }
            let result = write_block(
                self.file.as_mut(),
                &mut self.offset,
                &mut self.compressed_output,
                self.options.compression,
                metaindex_block.finish(),
            );
            metaindex_handle = self.latch(result)?;
        }

        // Index block, closed by a successor of the last key written.
        let mut index_handle = BlockHandle::default();
        if self.status.is_ok() {
            if self.pending_index_entry {
                self.options.comparator.find_short_successor(&mut self.last_key);
                let mut handle_encoding = Vec::new();
                self.pending_handle.encode_to(&mut handle_encoding);
                self.index_block.add(&self.last_key, &handle_encoding);
                self.pending_index_entry = false;
            }
            let result = {
                let raw = self.index_block.finish();
                write_block(
                    self.file.as_mut(),
                    &mut self.offset,
                    &mut self.compressed_output,
                    self.options.compression,
                    raw,
                )
            };
            index_handle = self.latch(result)?;
        }

        if self.status.is_ok() {
            let footer = Footer {
                metaindex_handle,
                index_handle,
            };
            let mut footer_encoding = Vec::new();
            footer.encode_to(&mut footer_encoding);
            let appended = self.file.append(&footer_encoding);
            self.latch(appended)?;
            self.offset += footer_encoding.len() as u64;
            let flushed = self.file.flush();
            self.latch(flushed)?;
            debug!(
                "finished table: {} entries, {} bytes",
                self.num_entries, self.offset
            );
        }
        self.status.clone()
    }

    /// Marks the builder closed without finalising the file. The caller
    /// discards the partial output.
    pub fn abandon(&mut self) {
        assert!(!self.closed);
        self.closed = true;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far; after `finish`, the final file size.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.status = Err(e.clone());
        }
        result
    }
}

/// Compresses `raw` if the codec earns its keep (at least 1/8 saved),
/// then writes contents plus trailer.
fn write_block(
    file: &mut dyn WritableFile,
    offset: &mut u64,
    scratch: &mut Vec<u8>,
    compression: CompressionType,
    raw: &[u8],
) -> Result<BlockHandle> {
    match compression {
        CompressionType::None => write_raw_block(file, offset, raw, CompressionType::None),
        CompressionType::Snappy => {
            scratch.resize(snap::raw::max_compress_len(raw.len()), 0);
            let compressed_len = snap::raw::Encoder::new()
                .compress(raw, scratch)
                .ok()
                .filter(|&n| n < raw.len() - raw.len() / 8);
            match compressed_len {
                Some(n) => write_raw_block(file, offset, &scratch[..n], CompressionType::Snappy),
                None => write_raw_block(file, offset, raw, CompressionType::None),
            }
        }
    }
}

fn write_raw_block(
    file: &mut dyn WritableFile,
    offset: &mut u64,
    contents: &[u8],
    kind: CompressionType,
) -> Result<BlockHandle> {
    let handle = BlockHandle {
        offset: *offset,
        size: contents.len() as u64,
    };
    file.append(contents)?;

    let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
    trailer.push(kind as u8);
    let crc = crc32c::crc32c_append(crc32c::crc32c(contents), &trailer[..1]);
    put_fixed32(&mut trailer, mask_crc(crc));
    file.append(&trailer)?;

    *offset += contents.len() as u64 + BLOCK_TRAILER_SIZE as u64;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::io::MemWritableFile;

    struct FailingFile {
        appends_before_failure: usize,
    }

    impl WritableFile for FailingFile {
        fn append(&mut self, _data: &[u8]) -> Result<()> {
            if self.appends_before_failure == 0 {
                return Err(Error::Io("disk full".to_string()));
            }
            self.appends_before_failure -= 1;
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn sync(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_error_latches() {
        let mut builder = TableBuilder::new(
            Options {
                block_size: 64,
                ..Default::default()
            },
            Box::new(FailingFile {
                appends_before_failure: 1,
            }),
        );

        let mut first_error = None;
        for i in 0..100u32 {
            let key = format!("key{i:04}");
            if let Err(e) = builder.add(key.as_bytes(), b"some value payload") {
                first_error = Some(e);
                break;
            }
        }
        let first_error = first_error.expect("writes should start failing");
        assert_eq!(first_error, Error::Io("disk full".to_string()));

        // Every later call replays the same error without touching the file.
        assert_eq!(builder.add(b"zzz", b"v"), Err(first_error.clone()));
        assert_eq!(builder.flush(), Err(first_error.clone()));
        assert_eq!(builder.finish(), Err(first_error));
    }

    #[test]
    fn abandon_leaves_no_footer() {
        let file = MemWritableFile::new();
        let contents = file.contents();
        let mut builder = TableBuilder::new(Options::default(), Box::new(file));
        builder.add(b"a", b"1").unwrap();
        builder.abandon();
        // Nothing was flushed: the data block was still in memory.
        assert!(contents.lock().is_empty());
    }

    #[test]
    fn empty_table_still_has_footer_and_index() {
        let file = MemWritableFile::new();
        let contents = file.contents();
        let mut builder = TableBuilder::new(Options::default(), Box::new(file));
        builder.finish().unwrap();

        let bytes = contents.lock();
        assert_eq!(bytes.len() as u64, builder.file_size());
        let footer = Footer::decode_from(&bytes[bytes.len() - crate::sst::FOOTER_SIZE..]).unwrap();
        assert!(footer.index_handle.size > 0);
        assert_eq!(builder.num_entries(), 0);
    }
}
