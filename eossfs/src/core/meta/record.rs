// SPDX-License-Identifier: MIT

//! On-chunk format of the metadata log.
//!
//! ```text
//! | MetaChunkHeader (16) | RecordHeader (16) | key | body | RecordHeader | key | body | ... | zeros |
//! ```

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const META_CHUNK_MAGIC: [u8; 8] = *b"EOSSMETA";
pub const RECORD_MAGIC: u16 = 0xE05F;

pub const META_HEADER_LEN: usize = size_of::<MetaChunkHeader>();
pub const RECORD_HEADER_LEN: usize = size_of::<RecordHeader>();

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct MetaChunkHeader {
    pub magic: [u8; 8],
    /// Position of this chunk in the log.
    pub seq: u64,
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct RecordHeader {
    pub magic: u16,
    pub kind: u8,
    pub flags: u8,
    pub key_len: u16,
    pub reserved: u16,
    pub body_len: u32,
    /// CRC-32 over kind, key and body.
    pub crc32: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    DirEntry = 1,
    DirRemove = 2,
    Placement = 3,
    PlacementRemove = 4,
}

impl RecordKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordKind::DirEntry),
            2 => Some(RecordKind::DirRemove),
            3 => Some(RecordKind::Placement),
            4 => Some(RecordKind::PlacementRemove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub kind: RecordKind,
    pub key: &'a [u8],
    pub body: &'a [u8],
}

fn checksum(kind: RecordKind, key: &[u8], body: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(&[kind as u8]);
    h.update(key);
    h.update(body);
    h.finalize()
}

/// Encoded length of a record, header included.
#[inline]
pub fn record_len(key: &[u8], body: &[u8]) -> usize {
    RECORD_HEADER_LEN + key.len() + body.len()
}

pub fn encode_record(kind: RecordKind, key: &[u8], body: &[u8]) -> Vec<u8> {
    let header = RecordHeader {
        magic: RECORD_MAGIC,
        kind: kind as u8,
        flags: 0,
        key_len: key.len() as u16,
        reserved: 0,
        body_len: body.len() as u32,
        crc32: checksum(kind, key, body),
    };
    let mut out = Vec::with_capacity(record_len(key, body));
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(body);
    out
}

/// Parses the record at the start of `buf`.
///
/// `None` marks the end of the log in this chunk: zero fill, a torn write or
/// a checksum failure.
pub fn decode_record(buf: &[u8]) -> Option<(Record<'_>, usize)> {
    let (header, rest) = RecordHeader::read_from_prefix(buf).ok()?;
    let RecordHeader {
        magic,
        kind,
        key_len,
        body_len,
        crc32,
        ..
    } = header;
    if magic != RECORD_MAGIC {
        return None;
    }
    let kind = RecordKind::from_u8(kind)?;
    let key_len = key_len as usize;
    let body_len = body_len as usize;
    if rest.len() < key_len + body_len {
        return None;
    }
    let (key, rest) = rest.split_at(key_len);
    let body = &rest[..body_len];
    if checksum(kind, key, body) != crc32 {
        return None;
    }
    Some((
        Record { kind, key, body },
        RECORD_HEADER_LEN + key_len + body_len,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(META_HEADER_LEN, 16);
        assert_eq!(RECORD_HEADER_LEN, 16);
    }

    #[test]
    fn test_record_sequence_stops_at_zero_fill() {
        let mut log = encode_record(RecordKind::DirEntry, b"docs", &[1; 33]);
        log.extend(encode_record(RecordKind::DirRemove, b"docs", &[]));
        log.extend_from_slice(&[0u8; 64]);

        let (a, n) = decode_record(&log).unwrap();
        assert_eq!(a.kind, RecordKind::DirEntry);
        assert_eq!(a.key, b"docs");
        assert_eq!(a.body.len(), 33);

        let (b, m) = decode_record(&log[n..]).unwrap();
        assert_eq!(b.kind, RecordKind::DirRemove);
        assert!(b.body.is_empty());

        assert!(decode_record(&log[n + m..]).is_none());
    }

    #[test]
    fn test_torn_record_rejected() {
        let rec = encode_record(RecordKind::Placement, &[7; 32], &[3; 64]);
        assert!(decode_record(&rec[..rec.len() - 1]).is_none());

        let mut flipped = rec.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x10;
        assert!(decode_record(&flipped).is_none());
    }
}
