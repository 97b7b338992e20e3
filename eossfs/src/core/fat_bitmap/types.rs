// SPDX-License-Identifier: MIT

use core::fmt;
use core::num::NonZeroU16;
use core::ops::Range;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const FAT_BITMAP_MAGIC: [u8; 8] = *b"EOSSFBM1";
pub const FAT_BITMAP_VERSION: u16 = 1;

/// Low 15 bits of a run word hold the run length.
pub const RUN_LEN_MASK: u16 = 0x7FFF;

bitflags! {
    /// High bits of the run word at the head of a run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RunFlags: u16 {
        /// The run holds the trailing remainder of a multi-chunk file.
        const REMAINDER = 1 << 15;
    }
}

/// Per-chunk handle of one reservation. Never zero; zero marks a free block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantTag(NonZeroU16);

impl TenantTag {
    #[inline]
    pub fn new(raw: u16) -> Option<Self> {
        NonZeroU16::new(raw).map(Self)
    }

    #[inline]
    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Debug for TenantTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TenantTag({})", self.get())
    }
}

impl fmt::Display for TenantTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Half-open run of data blocks `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRange {
    pub start: u32,
    pub len: u32,
}

impl BlockRange {
    #[inline]
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// One past the last block, saturating at `u32::MAX`.
    #[inline]
    pub const fn end(&self) -> u32 {
        self.start.saturating_add(self.len)
    }

    #[inline]
    pub const fn checked_end(&self) -> Option<u32> {
        self.start.checked_add(self.len)
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    #[inline]
    pub fn blocks(&self) -> Range<u32> {
        self.start..self.end()
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end())
    }
}

/// One reservation as seen from the tenant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenancy {
    pub tag: TenantTag,
    pub range: BlockRange,
    pub flags: RunFlags,
}

/// Serialized header, first 32 bytes of the bitmap region.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct FatBitMapHeader {
    pub magic: [u8; 8],
    pub version: u16,
    pub data_blocks: u16,
    pub tenants: u16,
    pub next_tag: u16,
    pub generation: u64,
    /// CRC-32 of the entry bytes.
    pub crc32: u32,
    pub reserved: [u8; 4],
}

/// Per-block metadata.
///
/// | state        | tenant | run                   |
/// |--------------|--------|-----------------------|
/// | free         | 0      | 0                     |
/// | run head     | tag    | flags \| len (len > 0)|
/// | continuation | tag    | 0                     |
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct FatEntry {
    pub tenant: u16,
    pub run: u16,
}

impl FatEntry {
    pub const FREE: FatEntry = FatEntry { tenant: 0, run: 0 };

    #[inline]
    pub fn head(tag: TenantTag, len: u32, flags: RunFlags) -> Self {
        Self {
            tenant: tag.get(),
            run: flags.bits() | (len as u16 & RUN_LEN_MASK),
        }
    }

    #[inline]
    pub fn continuation(tag: TenantTag) -> Self {
        Self {
            tenant: tag.get(),
            run: 0,
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.tenant == 0
    }

    #[inline]
    pub fn run_len(&self) -> u32 {
        (self.run & RUN_LEN_MASK) as u32
    }

    #[inline]
    pub fn flags(&self) -> RunFlags {
        RunFlags::from_bits_truncate(self.run)
    }
}
