// SPDX-License-Identifier: MIT

//! Chunk geometry.
//!
//! Pure constants and derivations; no I/O, no mutable state. A shared chunk is
//! laid out as
//!
//! ```text
//! | data block 0 | data block 1 | ... | data block N-1 | bitmap block 0 | bitmap block 1 |
//! ```
//!
//! where the trailing `bitmap_blocks` hold the serialized FatBitMap.

use crate::core::errors::{FsError, FsResult};

/// Default chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
/// Default block size (4 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
/// Blocks reserved at the tail of every shared chunk for its FatBitMap.
pub const DEFAULT_BITMAP_BLOCKS: u32 = 2;

/// Serialized FatBitMap header size in bytes.
pub const FAT_HEADER_BYTES: u64 = 32;
/// Per-block metadata width: 16-bit tenant tag + 16-bit run word.
pub const FAT_ENTRY_BITS: u64 = 32;
/// Block indices and run lengths are 15-bit quantities on disk.
pub const MAX_BLOCKS_PER_CHUNK: u32 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_size: u64,
    block_size: u32,
    bitmap_blocks: u32,
    blocks_per_chunk: u32,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            bitmap_blocks: DEFAULT_BITMAP_BLOCKS,
            blocks_per_chunk: (DEFAULT_CHUNK_SIZE / DEFAULT_BLOCK_SIZE as u64) as u32,
        }
    }
}

impl ChunkLayout {
    /// Validates and builds a layout. Every failure is a startup-time `Config` error.
    pub fn new(chunk_size: u64, block_size: u32, bitmap_blocks: u32) -> FsResult<Self> {
        if block_size == 0 {
            return Err(FsError::Config("block size must be non-zero"));
        }
        if chunk_size == 0 || !chunk_size.is_multiple_of(block_size as u64) {
            return Err(FsError::Config(
                "chunk size must be a non-zero multiple of block size",
            ));
        }

        let blocks = chunk_size / block_size as u64;
        if blocks > MAX_BLOCKS_PER_CHUNK as u64 {
            return Err(FsError::Config("too many blocks per chunk (max 32767)"));
        }
        let blocks_per_chunk = blocks as u32;

        if bitmap_blocks == 0 || bitmap_blocks >= blocks_per_chunk {
            return Err(FsError::Config(
                "bitmap blocks must leave at least one data block",
            ));
        }

        let data_blocks = (blocks_per_chunk - bitmap_blocks) as u64;
        let capacity_bits = bitmap_blocks as u64 * block_size as u64 * 8;
        let needed_bits = FAT_HEADER_BYTES * 8 + data_blocks * FAT_ENTRY_BITS;
        if capacity_bits < needed_bits {
            return Err(FsError::Config(
                "bitmap region too small to address the data region",
            ));
        }

        Ok(Self {
            chunk_size,
            block_size,
            bitmap_blocks,
            blocks_per_chunk,
        })
    }

    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn bitmap_blocks(&self) -> u32 {
        self.bitmap_blocks
    }

    #[inline]
    pub fn blocks_per_chunk(&self) -> u32 {
        self.blocks_per_chunk
    }

    #[inline]
    pub fn data_blocks_per_shared_chunk(&self) -> u32 {
        self.blocks_per_chunk - self.bitmap_blocks
    }

    /// `ceil(byte_size / block_size)`
    #[inline]
    pub fn blocks_needed(&self, byte_size: u64) -> u64 {
        byte_size.div_ceil(self.block_size as u64)
    }

    /// Byte offset of a block inside its chunk.
    #[inline]
    pub fn block_offset(&self, block_index: u32) -> u64 {
        block_index as u64 * self.block_size as u64
    }

    /// Start of the FatBitMap region (= end of the data region).
    #[inline]
    pub fn bitmap_offset(&self) -> u64 {
        self.block_offset(self.data_blocks_per_shared_chunk())
    }

    #[inline]
    pub fn bitmap_len(&self) -> usize {
        self.bitmap_blocks as usize * self.block_size as usize
    }

    /// Payload bytes a shared chunk can hold.
    #[inline]
    pub fn shared_capacity_bytes(&self) -> u64 {
        self.bitmap_offset()
    }

    /// Files strictly smaller than one chunk are tiny.
    #[inline]
    pub fn is_tiny(&self, byte_size: u64) -> bool {
        byte_size < self.chunk_size
    }

    /// `(full_chunks, remainder)` for a file of `byte_size` bytes.
    #[inline]
    pub fn split_file(&self, byte_size: u64) -> (u64, u64) {
        (byte_size / self.chunk_size, byte_size % self.chunk_size)
    }

    /// Whether `block_count` blocks fit in one shared chunk's data region.
    #[inline]
    pub fn fits_shared(&self, block_count: u64) -> bool {
        block_count <= self.data_blocks_per_shared_chunk() as u64
    }
}

impl core::fmt::Display for ChunkLayout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "chunk size      : {} bytes", self.chunk_size)?;
        writeln!(f, "block size      : {} bytes", self.block_size)?;
        writeln!(f, "blocks / chunk  : {}", self.blocks_per_chunk)?;
        writeln!(f, "bitmap blocks   : {}", self.bitmap_blocks)?;
        write!(
            f,
            "data blocks     : {} ({} bytes shared capacity)",
            self.data_blocks_per_shared_chunk(),
            self.shared_capacity_bytes()
        )
    }
}
