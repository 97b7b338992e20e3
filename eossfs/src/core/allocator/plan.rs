// SPDX-License-Identifier: MIT

//! Placement plans: where the bytes of one file live.

use std::collections::HashMap;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use eossio::prelude::{ChunkId, ChunkKind};

use crate::core::errors::{FsError, FsResult};
use crate::core::fat_bitmap::{BlockRange, TenantTag};
use crate::core::id::FileId;
use crate::core::layout::ChunkLayout;

/// One chunk's share of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementEntry {
    pub chunk_id: ChunkId,
    pub kind: ChunkKind,
    /// Raw entries always start at block 0.
    pub blocks: BlockRange,
    /// Set for shared entries only.
    pub tenant: Option<TenantTag>,
    pub payload_bytes: u64,
    pub is_last: bool,
}

impl PlacementEntry {
    pub fn raw(chunk_id: ChunkId, layout: &ChunkLayout, payload_bytes: u64) -> Self {
        Self {
            chunk_id,
            kind: ChunkKind::Raw,
            blocks: BlockRange::new(0, layout.blocks_needed(payload_bytes) as u32),
            tenant: None,
            payload_bytes,
            is_last: false,
        }
    }

    pub fn shared(
        chunk_id: ChunkId,
        tenant: TenantTag,
        blocks: BlockRange,
        payload_bytes: u64,
    ) -> Self {
        Self {
            chunk_id,
            kind: ChunkKind::Shared,
            blocks,
            tenant: Some(tenant),
            payload_bytes,
            is_last: false,
        }
    }

    /// Byte offset of the payload inside the chunk.
    #[inline]
    pub fn byte_offset(&self, layout: &ChunkLayout) -> u64 {
        layout.block_offset(self.blocks.start)
    }
}

/// Ordered chunk list of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementPlan {
    pub file_id: FileId,
    pub byte_size: u64,
    pub entries: Vec<PlacementEntry>,
}

impl PlacementPlan {
    pub fn chunk_list(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.entries.iter().map(|e| e.chunk_id)
    }

    pub fn total_payload(&self) -> u64 {
        self.entries.iter().map(|e| e.payload_bytes).sum()
    }

    pub fn shared_entry(&self) -> Option<&PlacementEntry> {
        self.entries.iter().find(|e| e.kind == ChunkKind::Shared)
    }

    pub fn raw_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == ChunkKind::Raw)
            .count()
    }

    /// Marks the final entry `is_last`.
    pub(crate) fn seal(&mut self) {
        let n = self.entries.len();
        for (i, e) in self.entries.iter_mut().enumerate() {
            e.is_last = i + 1 == n;
        }
    }

    /// Shape checks shared by decode and the checker.
    pub fn validate(&self, layout: &ChunkLayout) -> FsResult {
        if self.entries.is_empty() {
            return Err(FsError::Meta("empty placement plan"));
        }
        if self.total_payload() != self.byte_size {
            return Err(FsError::Meta("plan payload does not add up to file size"));
        }
        let shared = self
            .entries
            .iter()
            .filter(|e| e.kind == ChunkKind::Shared)
            .count();
        if shared > 1 {
            return Err(FsError::Meta("plan holds more than one shared entry"));
        }
        let last = self.entries.len() - 1;
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_last != (i == last) {
                return Err(FsError::Meta("misplaced last-entry marker"));
            }
            if e.payload_bytes == 0 || e.payload_bytes > layout.chunk_size() {
                return Err(FsError::Meta("entry payload out of range"));
            }
            if layout.blocks_needed(e.payload_bytes) != e.blocks.len as u64 {
                return Err(FsError::Meta("entry block count disagrees with payload"));
            }
            match e.kind {
                ChunkKind::Raw if e.blocks.start != 0 || e.tenant.is_some() => {
                    return Err(FsError::Meta("malformed raw entry"));
                }
                ChunkKind::Shared
                    if i != last
                        || e.tenant.is_none()
                        || e.blocks.end() > layout.data_blocks_per_shared_chunk() =>
                {
                    return Err(FsError::Meta("malformed shared entry"));
                }
                ChunkKind::Meta => return Err(FsError::Meta("meta chunk in placement plan")),
                _ => {}
            }
        }
        Ok(())
    }

    /// Binary form of the whole plan as a single record body.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_part(0, &self.entries)
    }

    /// Splits the plan into record bodies of at most `max_body` bytes.
    ///
    /// Every part repeats the file size and total entry count and says where
    /// its entries start, so replay can reassemble the plan in order.
    pub fn encode_parts(&self, max_body: usize) -> Vec<Vec<u8>> {
        let per_part = (max_body.saturating_sub(PLAN_HEADER_LEN) / PLAN_ENTRY_LEN).max(1);
        self.entries
            .chunks(per_part)
            .enumerate()
            .map(|(i, part)| self.encode_part(i * per_part, part))
            .collect()
    }

    fn encode_part(&self, first_entry: usize, entries: &[PlacementEntry]) -> Vec<u8> {
        let header = PlanHeader {
            byte_size: self.byte_size,
            entry_count: self.entries.len() as u32,
            first_entry: first_entry as u32,
        };
        let mut out = Vec::with_capacity(PLAN_HEADER_LEN + entries.len() * PLAN_ENTRY_LEN);
        out.extend_from_slice(header.as_bytes());
        for e in entries {
            let raw = PlanEntryRaw {
                chunk_id: *e.chunk_id.as_bytes(),
                kind: e.kind.as_u8(),
                is_last: e.is_last as u8,
                tenant: e.tenant.map_or(0, |t| t.get()),
                block_start: e.blocks.start as u16,
                block_len: e.blocks.len as u16,
                payload_bytes: e.payload_bytes,
            };
            out.extend_from_slice(raw.as_bytes());
        }
        out
    }

    /// Decodes a body holding the whole plan.
    pub fn decode(file_id: FileId, body: &[u8]) -> FsResult<Self> {
        let part = PlanPart::decode(body)?;
        if part.first_entry != 0 || part.entries.len() != part.entry_count as usize {
            return Err(FsError::Meta("partial plan record"));
        }
        Ok(Self {
            file_id,
            byte_size: part.byte_size,
            entries: part.entries,
        })
    }
}

/// Encoded size of the per-record plan header.
pub const PLAN_HEADER_LEN: usize = size_of::<PlanHeader>();
/// Encoded size of one plan entry.
pub const PLAN_ENTRY_LEN: usize = size_of::<PlanEntryRaw>();

/// One record's slice of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPart {
    pub byte_size: u64,
    pub entry_count: u32,
    pub first_entry: u32,
    pub entries: Vec<PlacementEntry>,
}

impl PlanPart {
    pub fn decode(body: &[u8]) -> FsResult<Self> {
        let (header, rest) = PlanHeader::read_from_prefix(body)
            .map_err(|_| FsError::Meta("truncated plan header"))?;
        let PlanHeader {
            byte_size,
            entry_count,
            first_entry,
        } = header;

        if rest.is_empty() || rest.len() % PLAN_ENTRY_LEN != 0 {
            return Err(FsError::Meta("plan length mismatch"));
        }
        let raws = <[PlanEntryRaw]>::ref_from_bytes(rest)
            .map_err(|_| FsError::Meta("unreadable plan entries"))?;
        if first_entry as u64 + raws.len() as u64 > entry_count as u64 {
            return Err(FsError::Meta("plan part past the entry count"));
        }

        let mut entries = Vec::with_capacity(raws.len());
        for raw in raws {
            let kind = ChunkKind::from_u8(raw.kind).ok_or(FsError::Meta("unknown chunk kind"))?;
            entries.push(PlacementEntry {
                chunk_id: ChunkId::new(raw.chunk_id),
                kind,
                blocks: BlockRange::new(raw.block_start as u32, raw.block_len as u32),
                tenant: TenantTag::new(raw.tenant),
                payload_bytes: raw.payload_bytes,
                is_last: raw.is_last != 0,
            });
        }

        Ok(Self {
            byte_size,
            entry_count,
            first_entry,
            entries,
        })
    }
}

/// Collects plan parts during replay until a plan is complete.
#[derive(Debug, Default)]
pub struct PlanAssembler {
    pending: HashMap<FileId, PlacementPlan>,
}

impl PlanAssembler {
    /// Feeds one record body; returns the plan once its last part arrived.
    ///
    /// A part starting at entry 0 restarts the file. A part that does not
    /// continue the pending entries drops them.
    pub fn push(&mut self, file_id: FileId, body: &[u8]) -> FsResult<Option<PlacementPlan>> {
        let part = PlanPart::decode(body)?;

        if part.first_entry == 0 {
            self.pending.remove(&file_id);
        }
        let mut plan = match self.pending.remove(&file_id) {
            Some(plan) => plan,
            None if part.first_entry == 0 => PlacementPlan {
                file_id,
                byte_size: part.byte_size,
                entries: Vec::with_capacity(part.entry_count as usize),
            },
            None => return Err(FsError::Meta("plan part without its predecessors")),
        };
        if plan.entries.len() != part.first_entry as usize || plan.byte_size != part.byte_size {
            return Err(FsError::Meta("plan part out of sequence"));
        }
        plan.entries.extend(part.entries);

        if plan.entries.len() == part.entry_count as usize {
            return Ok(Some(plan));
        }
        self.pending.insert(file_id, plan);
        Ok(None)
    }

    /// Files whose plan never completed (torn log tail).
    pub fn incomplete(&self) -> impl Iterator<Item = &FileId> {
        self.pending.keys()
    }
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
struct PlanHeader {
    byte_size: u64,
    /// Entries of the whole plan.
    entry_count: u32,
    /// Index of this record's first entry.
    first_entry: u32,
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
struct PlanEntryRaw {
    chunk_id: [u8; 32],
    kind: u8,
    is_last: u8,
    tenant: u16,
    block_start: u16,
    block_len: u16,
    payload_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(layout: &ChunkLayout) -> PlacementPlan {
        let mut plan = PlacementPlan {
            file_id: FileId::new([9; 32]),
            byte_size: 2 * layout.chunk_size() + 100,
            entries: vec![
                PlacementEntry::raw(ChunkId::new([1; 32]), layout, layout.chunk_size()),
                PlacementEntry::raw(ChunkId::new([2; 32]), layout, layout.chunk_size()),
                PlacementEntry::shared(
                    ChunkId::new([3; 32]),
                    TenantTag::new(5).unwrap(),
                    BlockRange::new(7, 1),
                    100,
                ),
            ],
        };
        plan.seal();
        plan
    }

    #[test]
    fn test_entry_sizes() {
        assert_eq!(size_of::<PlanHeader>(), 16);
        assert_eq!(size_of::<PlanEntryRaw>(), 48);
    }

    #[test]
    fn test_codec() {
        let layout = ChunkLayout::default();
        let plan = sample(&layout);
        plan.validate(&layout).unwrap();

        let body = plan.encode();
        assert_eq!(body.len(), 16 + 3 * 48);
        assert_eq!(PlacementPlan::decode(plan.file_id, &body), Ok(plan));
        assert!(PlacementPlan::decode(FileId::new([0; 32]), &body[..20]).is_err());
    }

    #[test]
    fn test_validate_catches_bad_shapes() {
        let layout = ChunkLayout::default();

        let mut plan = sample(&layout);
        plan.byte_size += 1;
        assert!(plan.validate(&layout).is_err());

        let mut plan = sample(&layout);
        plan.entries.swap(0, 2);
        plan.seal();
        assert!(plan.validate(&layout).is_err());

        let mut plan = sample(&layout);
        plan.entries[2].is_last = false;
        assert!(plan.validate(&layout).is_err());
    }

    #[test]
    fn test_offsets() {
        let layout = ChunkLayout::default();
        let plan = sample(&layout);
        assert_eq!(plan.entries[0].byte_offset(&layout), 0);
        assert_eq!(plan.entries[2].byte_offset(&layout), 7 * 4096);
        assert_eq!(plan.raw_count(), 2);
        assert_eq!(plan.chunk_list().count(), 3);
    }

    fn long_plan(layout: &ChunkLayout, raws: u8) -> PlacementPlan {
        let mut plan = PlacementPlan {
            file_id: FileId::new([4; 32]),
            byte_size: raws as u64 * layout.chunk_size(),
            entries: (0..raws)
                .map(|i| PlacementEntry::raw(ChunkId::new([i; 32]), layout, layout.chunk_size()))
                .collect(),
        };
        plan.seal();
        plan
    }

    #[test]
    fn test_parts_reassemble() {
        let layout = ChunkLayout::default();
        let plan = long_plan(&layout, 7);

        // room for 3 entries per record
        let parts = plan.encode_parts(PLAN_HEADER_LEN + 3 * PLAN_ENTRY_LEN + 10);
        assert_eq!(parts.len(), 3);
        assert!(PlacementPlan::decode(plan.file_id, &parts[0]).is_err());

        let mut asm = PlanAssembler::default();
        assert_eq!(asm.push(plan.file_id, &parts[0]), Ok(None));
        assert_eq!(asm.push(plan.file_id, &parts[1]), Ok(None));
        assert_eq!(asm.incomplete().count(), 1);
        let whole = asm.push(plan.file_id, &parts[2]).unwrap().unwrap();
        assert_eq!(whole, plan);
        assert_eq!(asm.incomplete().count(), 0);
        whole.validate(&layout).unwrap();
    }

    #[test]
    fn test_parts_out_of_order_rejected() {
        let layout = ChunkLayout::default();
        let plan = long_plan(&layout, 4);
        let parts = plan.encode_parts(PLAN_HEADER_LEN + 2 * PLAN_ENTRY_LEN);
        assert_eq!(parts.len(), 2);

        let mut asm = PlanAssembler::default();
        assert!(asm.push(plan.file_id, &parts[1]).is_err());

        // a restart from entry 0 discards the earlier attempt
        assert_eq!(asm.push(plan.file_id, &parts[0]), Ok(None));
        assert_eq!(asm.push(plan.file_id, &parts[0]), Ok(None));
        assert_eq!(asm.push(plan.file_id, &parts[1]), Ok(Some(plan)));
    }

    #[test]
    fn test_single_part_matches_encode() {
        let layout = ChunkLayout::default();
        let plan = sample(&layout);
        let parts = plan.encode_parts(usize::MAX);
        assert_eq!(parts, vec![plan.encode()]);
    }
}
