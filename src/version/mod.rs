//! Version-change descriptor.
//!
//! A memtable flush or a compaction produces a `VersionEdit`: the delta
//! between two versions of the table set: which files appear or disappear
//! at which level, plus bookkeeping numbers. The manifest layer appends
//! encoded edits to its log and replays them on recovery.
//!
//! Encoding: a sequence of `(varint32 tag, payload)` records, one per
//! present field.

use std::collections::BTreeSet;

use log::debug;

use crate::coding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice,
    put_varint32, put_varint64,
};
use crate::error::{Error, Result};
use crate::internal_key::InternalKey;
use crate::options::NUM_LEVELS;

// Tag values are embedded in every manifest ever written; never renumber
// them. 8 belonged to a retired field and stays reserved.
mod tag {
    pub const COMPARATOR: u32 = 1;
    pub const LOG_NUMBER: u32 = 2;
    pub const NEXT_FILE_NUMBER: u32 = 3;
    pub const LAST_SEQNO: u32 = 4;
    pub const COMPACT_POINTER: u32 = 5;
    pub const DELETED_FILE: u32 = 6;
    pub const NEW_FILE: u32 = 7;
    pub const PREV_LOG_NUMBER: u32 = 9;
}

/// Metadata for one table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key present in the file.
    pub smallest: InternalKey,
    /// Largest internal key present in the file.
    pub largest: InternalKey,
    /// Versions currently referencing this file.
    pub refs: u32,
    /// Seeks allowed before the file becomes a compaction candidate; the
    /// scheduler re-derives this from the file size.
    pub allowed_seeks: i32,
}

impl Default for FileMetaData {
    fn default() -> Self {
        FileMetaData {
            number: 0,
            file_size: 0,
            smallest: InternalKey::default(),
            largest: InternalKey::default(),
            refs: 0,
            allowed_seeks: 1 << 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_seqno: Option<u64>,
    /// Per-level key at which the next range compaction resumes.
    pub compact_pointers: Vec<(u32, InternalKey)>,
    pub deleted_files: BTreeSet<(u32, u64)>,
    pub new_files: Vec<(u32, FileMetaData)>,
}

impl VersionEdit {
    pub fn clear(&mut self) {
        *self = VersionEdit::default();
    }

    /// Records `file` appearing at `level`. `smallest` and `largest` must
    /// be keys actually present in the file.
    pub fn add_file(
        &mut self,
        level: u32,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            FileMetaData {
                number,
                file_size,
                smallest,
                largest,
                ..FileMetaData::default()
            },
        ));
    }

    /// Records `number` disappearing from `level`.
    pub fn remove_file(&mut self, level: u32, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::new();
        if let Some(name) = &self.comparator_name {
            put_varint32(&mut dst, tag::COMPARATOR);
            put_length_prefixed_slice(&mut dst, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(&mut dst, tag::LOG_NUMBER);
            put_varint64(&mut dst, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(&mut dst, tag::PREV_LOG_NUMBER);
            put_varint64(&mut dst, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(&mut dst, tag::NEXT_FILE_NUMBER);
            put_varint64(&mut dst, n);
        }
        if let Some(n) = self.last_seqno {
            put_varint32(&mut dst, tag::LAST_SEQNO);
            put_varint64(&mut dst, n);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(&mut dst, tag::COMPACT_POINTER);
            put_varint32(&mut dst, *level);
            put_length_prefixed_slice(&mut dst, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(&mut dst, tag::DELETED_FILE);
            put_varint32(&mut dst, *level);
            put_varint64(&mut dst, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(&mut dst, tag::NEW_FILE);
            put_varint32(&mut dst, *level);
            put_varint64(&mut dst, file.number);
            put_varint64(&mut dst, file.file_size);
            put_length_prefixed_slice(&mut dst, file.smallest.encoded());
            put_length_prefixed_slice(&mut dst, file.largest.encoded());
        }
        dst
    }

    pub fn decode(src: &[u8]) -> Result<VersionEdit> {
        let mut edit = VersionEdit::default();
        let input = &mut &src[..];
        while !input.is_empty() {
            let t = get_varint32(input).ok_or_else(|| corrupt("tag"))?;
            match t {
                tag::COMPARATOR => {
                    let name =
                        get_length_prefixed_slice(input).ok_or_else(|| corrupt("comparator name"))?;
                    let name = String::from_utf8(name.to_vec())
                        .map_err(|_| corrupt("comparator name"))?;
                    edit.comparator_name = Some(name);
                }
                tag::LOG_NUMBER => {
                    edit.log_number = Some(get_varint64(input).ok_or_else(|| corrupt("log number"))?);
                }
                tag::PREV_LOG_NUMBER => {
                    edit.prev_log_number =
                        Some(get_varint64(input).ok_or_else(|| corrupt("previous log number"))?);
                }
                tag::NEXT_FILE_NUMBER => {
                    edit.next_file_number =
                        Some(get_varint64(input).ok_or_else(|| corrupt("next file number"))?);
                }
                tag::LAST_SEQNO => {
                    edit.last_seqno =
                        Some(get_varint64(input).ok_or_else(|| corrupt("last sequence number"))?);
                }
                tag::COMPACT_POINTER => {
                    let level = get_level(input)?;
                    let key = get_internal_key(input)?;
                    edit.compact_pointers.push((level, key));
                }
                tag::DELETED_FILE => {
                    let level = get_level(input)?;
                    let number = get_varint64(input).ok_or_else(|| corrupt("deleted file"))?;
                    edit.deleted_files.insert((level, number));
                }
                tag::NEW_FILE => {
                    let level = get_level(input)?;
                    let number = get_varint64(input).ok_or_else(|| corrupt("new-file entry"))?;
                    let file_size = get_varint64(input).ok_or_else(|| corrupt("new-file entry"))?;
                    let smallest = get_internal_key(input)?;
                    let largest = get_internal_key(input)?;
                    edit.new_files.push((
                        level,
                        FileMetaData {
                            number,
                            file_size,
                            smallest,
                            largest,
                            ..FileMetaData::default()
                        },
                    ));
                }
                unknown => {
                    debug!("version edit carries unknown tag {unknown}");
                    return Err(corrupt("unknown tag"));
                }
            }
        }
        Ok(edit)
    }
}

fn corrupt(what: &str) -> Error {
    Error::Corruption(format!("version edit: {what}"))
}

fn get_level(input: &mut &[u8]) -> Result<u32> {
    let level = get_varint32(input).ok_or_else(|| corrupt("level"))?;
    if level as usize >= NUM_LEVELS {
        return Err(corrupt("level out of range"));
    }
    Ok(level)
}

fn get_internal_key(input: &mut &[u8]) -> Result<InternalKey> {
    let bytes = get_length_prefixed_slice(input).ok_or_else(|| corrupt("internal key"))?;
    InternalKey::decode_from(bytes).map_err(|_| corrupt("internal key"))
}
