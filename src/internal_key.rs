//! Internal-key encoding.
//!
//! Every stored key is versioned: the bytes the memtable and sorted tables
//! order are `user_key || le64((seqno << 8) | kind)`. The order is
//! `(user_key ASC, tag DESC)`, so for one user key the newest version is the
//! first entry an ascending scan meets.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::coding::{decode_fixed64, encode_varint32, put_fixed64, varint_length};
use crate::comparator::Comparator;
use crate::error::{Error, Result};

/// Sequence numbers are 56-bit so a kind byte packs into the same tag word.
pub const MAX_SEQNO: u64 = (1 << 56) - 1;

/// Marker stored in the low byte of the tag.
///
/// The discriminants are embedded in on-disk structures; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyKind {
    /// Tombstone: the key is deleted as of this entry's seqno.
    Deletion = 0,
    Value = 1,
}

/// Kind used when building seek targets. Tags sort descending, so a probe
/// for "newest entry visible at seqno `s`" must carry the largest kind byte
/// to land just before every entry of the same `(user_key, s)`.
pub const KIND_FOR_SEEK: KeyKind = KeyKind::Value;

impl KeyKind {
    pub fn from_u8(v: u8) -> Option<KeyKind> {
        match v {
            0 => Some(KeyKind::Deletion),
            1 => Some(KeyKind::Value),
            _ => None,
        }
    }
}

pub fn pack_seqno_and_kind(seqno: u64, kind: KeyKind) -> u64 {
    debug_assert!(seqno <= MAX_SEQNO);
    (seqno << 8) | kind as u64
}

/// An internal key split back into its components. Borrows the user key
/// from the encoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub seqno: u64,
    pub kind: KeyKind,
}

pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seqno: u64, kind: KeyKind) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_seqno_and_kind(seqno, kind));
}

/// Splits an encoded internal key. Fails on buffers shorter than a tag or
/// with an unknown kind byte; callers treat that as corruption.
pub fn parse_internal_key(encoded: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if encoded.len() < 8 {
        return None;
    }
    let tag = decode_fixed64(&encoded[encoded.len() - 8..]);
    let kind = KeyKind::from_u8((tag & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key: &encoded[..encoded.len() - 8],
        seqno: tag >> 8,
        kind,
    })
}

pub fn extract_user_key(encoded: &[u8]) -> &[u8] {
    debug_assert!(encoded.len() >= 8);
    &encoded[..encoded.len() - 8]
}

/// An owned, encoded internal key.
///
/// Wrapping the bytes keeps callers from accidentally ordering them with a
/// plain byte comparison, which inverts the version order.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seqno: u64, kind: KeyKind) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut rep, user_key, seqno, kind);
        InternalKey { rep }
    }

    /// Adopts already-encoded bytes, validating the tag.
    pub fn decode_from(encoded: &[u8]) -> Result<Self> {
        parse_internal_key(encoded)
            .ok_or_else(|| Error::corruption("malformed internal key"))?;
        Ok(InternalKey {
            rep: encoded.to_vec(),
        })
    }

    pub fn encoded(&self) -> &[u8] {
        &self.rep
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match parse_internal_key(&self.rep) {
            Some(parsed) => write!(
                f,
                "'{}' @ {} : {:?}",
                String::from_utf8_lossy(parsed.user_key),
                parsed.seqno,
                parsed.kind
            ),
            None => write!(f, "(bad){:?}", self.rep),
        }
    }
}

/// Orders encoded internal keys: ascending user key under the user
/// comparator, ties broken by descending tag (newer first).
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare_keys(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.encoded(), b.encoded())
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "silt.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let a_tag = decode_fixed64(&a[a.len() - 8..]);
                let b_tag = decode_fixed64(&b[b.len() - 8..]);
                b_tag.cmp(&a_tag)
            }
            ord => ord,
        }
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // Shorten the user-key prefix only; a shortened key gets the maximal
        // tag so it still sorts before every real entry with that user key.
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user.find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user.compare(user_start, &tmp) == Ordering::Less
        {
            put_fixed64(&mut tmp, pack_seqno_and_kind(MAX_SEQNO, KIND_FOR_SEEK));
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            put_fixed64(&mut tmp, pack_seqno_and_kind(MAX_SEQNO, KIND_FOR_SEEK));
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}

const LOOKUP_INLINE_BYTES: usize = 200;

/// Key formatted for a memtable probe at a snapshot.
///
/// One buffer, three views:
///
/// ```text
/// varint32(klen + 8) | user_key | (seqno << 8) | kind_for_seek
/// ^ memtable_key     ^ internal_key / user_key
/// ```
///
/// Short keys live in an inline buffer; only keys that outgrow it allocate.
pub struct LookupKey {
    space: [u8; LOOKUP_INLINE_BYTES],
    heap: Option<Vec<u8>>,
    kstart: usize,
    end: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seqno: u64) -> Self {
        let needed = varint_length((user_key.len() + 8) as u64) + user_key.len() + 8;
        let mut lk = LookupKey {
            space: [0; LOOKUP_INLINE_BYTES],
            heap: (needed > LOOKUP_INLINE_BYTES).then(|| vec![0; needed]),
            kstart: 0,
            end: 0,
        };
        let dst: &mut [u8] = match &mut lk.heap {
            Some(v) => v,
            None => &mut lk.space,
        };
        let mut at = encode_varint32(dst, (user_key.len() + 8) as u32);
        let kstart = at;
        dst[at..at + user_key.len()].copy_from_slice(user_key);
        at += user_key.len();
        dst[at..at + 8]
            .copy_from_slice(&pack_seqno_and_kind(seqno, KIND_FOR_SEEK).to_le_bytes());
        lk.kstart = kstart;
        lk.end = at + 8;
        lk
    }

    fn bytes(&self) -> &[u8] {
        match &self.heap {
            Some(v) => v,
            None => &self.space,
        }
    }

    /// The full `varint32(len) || internal_key` buffer the memtable seeks by.
    pub fn memtable_key(&self) -> &[u8] {
        &self.bytes()[..self.end]
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.bytes()[self.kstart..self.end]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.bytes()[self.kstart..self.end - 8]
    }
}
