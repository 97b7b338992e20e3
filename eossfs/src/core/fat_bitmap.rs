// SPDX-License-Identifier: MIT

//! Free-space and ownership index of one shared chunk.
//!
//! Each data block carries a 32-bit [`FatEntry`]: the owning tenant tag on
//! every used block, and the run length plus [`RunFlags`] on the first block
//! of each run. An occupancy bitset mirrors `tenant != 0` for fast scans.
//!
//! The structure is not synchronized; callers hold one lock per chunk.

pub mod types;

use std::collections::BTreeMap;

use zerocopy::{FromBytes, IntoBytes};

use crate::core::errors::{FatBitMapError, FatResult};
use crate::core::layout::{ChunkLayout, FAT_HEADER_BYTES};
use crate::core::utils::bitmap::{BitmapOps, bitmap_bytes};

pub use types::*;

const HEADER_LEN: usize = FAT_HEADER_BYTES as usize;
const ENTRY_LEN: usize = core::mem::size_of::<FatEntry>();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatBitMap {
    data_blocks: u32,
    region_len: usize,
    used: Vec<u8>,
    entries: Vec<FatEntry>,
    /// Derived from `entries`; rebuilt by `decode`, never persisted.
    tenants: BTreeMap<TenantTag, Tenancy>,
    remainder: Option<TenantTag>,
    next_tag: u16,
    generation: u64,
}

impl FatBitMap {
    /// Empty bitmap covering the data region of `layout`.
    pub fn new(layout: &ChunkLayout) -> Self {
        let data_blocks = layout.data_blocks_per_shared_chunk();
        Self {
            data_blocks,
            region_len: layout.bitmap_len(),
            used: vec![0u8; bitmap_bytes(data_blocks as usize)],
            entries: vec![FatEntry::FREE; data_blocks as usize],
            tenants: BTreeMap::new(),
            remainder: None,
            next_tag: 1,
            generation: 0,
        }
    }

    #[inline]
    pub fn data_blocks(&self) -> u32 {
        self.data_blocks
    }

    /// Bumped on every reservation or release.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn free_block_count(&self) -> u32 {
        self.data_blocks - self.used.count_ones() as u32
    }

    #[inline]
    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    #[inline]
    pub fn has_remainder(&self) -> bool {
        self.remainder.is_some()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn tenant_range(&self, tag: TenantTag) -> Option<BlockRange> {
        self.tenants.get(&tag).map(|t| t.range)
    }

    pub fn tenancy(&self, tag: TenantTag) -> Option<Tenancy> {
        self.tenants.get(&tag).copied()
    }

    /// Live reservations, ordered by tag.
    pub fn tenants(&self) -> impl Iterator<Item = &Tenancy> + '_ {
        self.tenants.values()
    }

    #[inline]
    pub fn is_used(&self, block: u32) -> bool {
        self.used.get_bit(block as usize)
    }

    /// Occupancy bits, one per data block, LSB first.
    #[inline]
    pub fn used_bits(&self) -> &[u8] {
        &self.used
    }

    /// Free runs, left to right.
    pub fn free_runs(&self) -> impl Iterator<Item = BlockRange> + '_ {
        let n = self.data_blocks as usize;
        let mut pos = 0usize;
        core::iter::from_fn(move || {
            let start = self.used.find_first_zero(pos, n)?;
            let end = self.used.find_first_one(start, n).unwrap_or(n);
            pos = end;
            Some(BlockRange::new(start as u32, (end - start) as u32))
        })
    }

    pub fn largest_free_run(&self) -> u32 {
        self.free_runs().map(|r| r.len).max().unwrap_or(0)
    }

    fn check_count(&self, block_count: u32) -> FatResult {
        if block_count == 0 {
            return Err(FatBitMapError::InvalidRequest);
        }
        if block_count > self.data_blocks {
            return Err(FatBitMapError::RequestTooLarge);
        }
        Ok(())
    }

    /// First fit: the leftmost free run of at least `block_count` blocks,
    /// trimmed to exactly `block_count`. Does not mutate.
    pub fn try_reserve(&self, block_count: u32) -> FatResult<Option<BlockRange>> {
        self.check_count(block_count)?;
        Ok(self
            .free_runs()
            .find(|r| r.len >= block_count)
            .map(|r| BlockRange::new(r.start, block_count)))
    }

    /// Mints a tag not held by any live tenant.
    ///
    /// The cursor keeps advancing (wrapping, skipping zero) so a freshly
    /// released tag is not handed out again right away.
    pub fn next_tag(&mut self) -> FatResult<TenantTag> {
        if self.tenants.len() >= u16::MAX as usize {
            return Err(FatBitMapError::TagsExhausted);
        }
        loop {
            let candidate = TenantTag::new(self.next_tag);
            self.next_tag = self.next_tag.wrapping_add(1).max(1);
            match candidate {
                Some(tag) if !self.tenants.contains_key(&tag) => return Ok(tag),
                _ => continue,
            }
        }
    }

    /// Marks `range` used by `tag`.
    pub fn reserve_for(&mut self, tag: TenantTag, range: BlockRange, flags: RunFlags) -> FatResult {
        let in_bounds = matches!(range.checked_end(), Some(end) if end <= self.data_blocks);
        if range.is_empty() || !in_bounds {
            return Err(FatBitMapError::InvalidRequest);
        }
        if self.tenants.contains_key(&tag) {
            return Err(FatBitMapError::DuplicateTenant);
        }
        if flags.contains(RunFlags::REMAINDER) && self.remainder.is_some() {
            return Err(FatBitMapError::RemainderTaken);
        }
        if self
            .used
            .find_first_one(range.start as usize, range.end() as usize)
            .is_some()
        {
            return Err(FatBitMapError::RangeConflict);
        }

        self.used
            .set_range(range.start as usize, range.end() as usize, true);
        self.entries[range.start as usize] = FatEntry::head(tag, range.len, flags);
        for block in range.start + 1..range.end() {
            self.entries[block as usize] = FatEntry::continuation(tag);
        }
        self.tenants.insert(tag, Tenancy { tag, range, flags });
        if flags.contains(RunFlags::REMAINDER) {
            self.remainder = Some(tag);
        }
        self.generation += 1;
        Ok(())
    }

    /// `try_reserve` + `next_tag` + `reserve_for` in one step.
    pub fn reserve(&mut self, block_count: u32, flags: RunFlags) -> FatResult<Option<Tenancy>> {
        if flags.contains(RunFlags::REMAINDER) && self.remainder.is_some() {
            return Err(FatBitMapError::RemainderTaken);
        }
        let Some(range) = self.try_reserve(block_count)? else {
            return Ok(None);
        };
        let tag = self.next_tag()?;
        self.reserve_for(tag, range, flags)?;
        Ok(Some(Tenancy { tag, range, flags }))
    }

    /// Frees the run held by `tag` and returns it.
    pub fn release(&mut self, tag: TenantTag) -> FatResult<BlockRange> {
        let tenancy = self
            .tenants
            .remove(&tag)
            .ok_or(FatBitMapError::UnknownTenant)?;
        let range = tenancy.range;
        self.used
            .set_range(range.start as usize, range.end() as usize, false);
        for block in range.blocks() {
            self.entries[block as usize] = FatEntry::FREE;
        }
        if self.remainder == Some(tag) {
            self.remainder = None;
        }
        self.generation += 1;
        Ok(range)
    }

    /// Like `release`, but only if `tag` still owns exactly `range`.
    pub fn release_exact(&mut self, tag: TenantTag, range: BlockRange) -> FatResult {
        match self.tenants.get(&tag) {
            Some(t) if t.range == range => self.release(tag).map(|_| ()),
            _ => Err(FatBitMapError::UnknownTenant),
        }
    }

    /// Cross-checks the bitset, the entries and the tenant table.
    pub fn verify(&self) -> FatResult {
        let tenants = scan_entries(&self.entries)?;
        if tenants.len() != self.tenants.len() {
            return Err(FatBitMapError::Corrupted("tenant table out of sync"));
        }
        for (tag, t) in &tenants {
            if self.tenants.get(tag) != Some(t) {
                return Err(FatBitMapError::Corrupted("tenant table out of sync"));
            }
        }
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_free() == self.used.get_bit(i) {
                return Err(FatBitMapError::Corrupted("occupancy bit disagrees with entry"));
            }
        }
        let remainders: Vec<_> = tenants
            .values()
            .filter(|t| t.flags.contains(RunFlags::REMAINDER))
            .map(|t| t.tag)
            .collect();
        if remainders.len() > 1 || remainders.first().copied() != self.remainder {
            return Err(FatBitMapError::Corrupted("remainder marker out of sync"));
        }
        Ok(())
    }

    /// Serializes into exactly `BITMAP_BLOCKS * BLOCK_SIZE` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let entry_bytes = self.entries.as_slice().as_bytes();
        let header = FatBitMapHeader {
            magic: FAT_BITMAP_MAGIC,
            version: FAT_BITMAP_VERSION,
            data_blocks: self.data_blocks as u16,
            tenants: self.tenants.len() as u16,
            next_tag: self.next_tag,
            generation: self.generation,
            crc32: crc32fast::hash(entry_bytes),
            reserved: [0; 4],
        };

        let mut out = Vec::with_capacity(self.region_len);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(entry_bytes);
        out.resize(self.region_len, 0);
        out
    }

    /// Parses and validates a bitmap region written by `encode`.
    pub fn decode(layout: &ChunkLayout, bytes: &[u8]) -> FatResult<Self> {
        if bytes.len() != layout.bitmap_len() {
            return Err(FatBitMapError::Corrupted("bitmap region size mismatch"));
        }
        let header = FatBitMapHeader::read_from_bytes(&bytes[..HEADER_LEN])
            .map_err(|_| FatBitMapError::Corrupted("unreadable bitmap header"))?;

        // Copy out of the packed header before comparing
        let FatBitMapHeader {
            magic,
            version,
            data_blocks: stored_blocks,
            tenants: stored_tenants,
            next_tag,
            generation,
            crc32,
            ..
        } = header;

        if magic != FAT_BITMAP_MAGIC {
            return Err(FatBitMapError::Corrupted("bad bitmap magic"));
        }
        if version != FAT_BITMAP_VERSION {
            return Err(FatBitMapError::Corrupted("unsupported bitmap version"));
        }
        let data_blocks = layout.data_blocks_per_shared_chunk();
        if stored_blocks as u32 != data_blocks {
            return Err(FatBitMapError::Corrupted("bitmap geometry mismatch"));
        }
        if next_tag == 0 {
            return Err(FatBitMapError::Corrupted("invalid tag cursor"));
        }

        let entry_end = HEADER_LEN + data_blocks as usize * ENTRY_LEN;
        let entry_bytes = &bytes[HEADER_LEN..entry_end];
        if crc32fast::hash(entry_bytes) != crc32 {
            return Err(FatBitMapError::Corrupted("bitmap checksum mismatch"));
        }
        let entries = <[FatEntry]>::ref_from_bytes(entry_bytes)
            .map_err(|_| FatBitMapError::Corrupted("unreadable bitmap entries"))?
            .to_vec();

        let tenants = scan_entries(&entries)?;
        if tenants.len() != stored_tenants as usize {
            return Err(FatBitMapError::Corrupted("tenant count mismatch"));
        }

        let mut remainder = None;
        for t in tenants.values() {
            if t.flags.contains(RunFlags::REMAINDER) {
                if remainder.is_some() {
                    return Err(FatBitMapError::Corrupted("multiple remainders in one chunk"));
                }
                remainder = Some(t.tag);
            }
        }

        let mut used = vec![0u8; bitmap_bytes(data_blocks as usize)];
        for t in tenants.values() {
            used.set_range(t.range.start as usize, t.range.end() as usize, true);
        }

        Ok(Self {
            data_blocks,
            region_len: layout.bitmap_len(),
            used,
            entries,
            tenants,
            remainder,
            next_tag,
            generation,
        })
    }
}

/// Walks the entry array and rebuilds the tenant table.
fn scan_entries(entries: &[FatEntry]) -> FatResult<BTreeMap<TenantTag, Tenancy>> {
    let n = entries.len();
    let mut tenants = BTreeMap::new();
    let mut i = 0usize;
    while i < n {
        let head = entries[i];
        let Some(tag) = TenantTag::new(head.tenant) else {
            if head.run != 0 {
                return Err(FatBitMapError::Corrupted("run word on a free block"));
            }
            i += 1;
            continue;
        };

        let len = head.run_len() as usize;
        if len == 0 {
            return Err(FatBitMapError::Corrupted("continuation without run head"));
        }
        if i + len > n {
            return Err(FatBitMapError::Corrupted("run exceeds data region"));
        }
        if entries[i + 1..i + len]
            .iter()
            .any(|e| *e != FatEntry::continuation(tag))
        {
            return Err(FatBitMapError::Corrupted("broken run"));
        }

        let tenancy = Tenancy {
            tag,
            range: BlockRange::new(i as u32, len as u32),
            flags: head.flags(),
        };
        if tenants.insert(tag, tenancy).is_some() {
            return Err(FatBitMapError::Corrupted("duplicate tenant tag"));
        }
        i += len;
    }
    Ok(tenants)
}
