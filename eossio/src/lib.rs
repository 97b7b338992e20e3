// SPDX-License-Identifier: MIT

// Core modules
pub mod errors;
pub mod id;
pub mod stats;

// Backend modules
#[cfg(feature = "mem")]
mod mem;

#[cfg(feature = "local")]
mod local;

// Prelude re-exports (central entrypoint)
pub mod prelude {
    pub use super::ChunkKind;
    pub use super::ChunkStore;
    pub use super::ChunkStoreExt;
    pub use super::errors::*;
    pub use super::id::*;
    pub use super::stats::*;

    #[cfg(feature = "mem")]
    pub use super::mem::MemChunkStore;

    #[cfg(feature = "local")]
    pub use super::local::LocalChunkStore;
}

use async_trait::async_trait;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use errors::*;
use id::ChunkId;

/// What a chunk holds. Closed set; persisted as one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChunkKind {
    /// Exclusively filled by one file's data.
    Raw = 1,
    /// Packs tiny files (and at most one file remainder) behind a FatBitMap.
    Shared = 2,
    /// Directory metadata records.
    Meta = 3,
}

impl ChunkKind {
    pub const ALL: [ChunkKind; 3] = [ChunkKind::Raw, ChunkKind::Shared, ChunkKind::Meta];

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ChunkKind::Raw),
            2 => Some(ChunkKind::Shared),
            3 => Some(ChunkKind::Meta),
            _ => None,
        }
    }

    /// Directory name used by file-backed stores.
    pub fn dir_name(self) -> &'static str {
        match self {
            ChunkKind::Raw => "raw",
            ChunkKind::Shared => "shared",
            ChunkKind::Meta => "meta",
        }
    }
}

impl core::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Object-storage backend abstraction.
///
/// Every chunk is exactly `chunk_size()` bytes. Range writes are atomic at the
/// byte-range granularity; callers never rely on whole-chunk atomic overwrite.
/// Implementations may target RAM, a local directory, S3-like services, etc.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Fixed length of every chunk handed out by this store.
    fn chunk_size(&self) -> u64;

    /// Creates a new zero-filled chunk of the given kind.
    async fn create_chunk(&self, kind: ChunkKind) -> ChunkIOResult<ChunkId>;

    /// Writes `data` at `offset` inside `chunk`.
    async fn write_range(&self, chunk: &ChunkId, offset: u64, data: &[u8]) -> ChunkIOResult;

    /// Reads `len` bytes at `offset` inside `chunk`.
    async fn read_range(&self, chunk: &ChunkId, offset: u64, len: usize)
    -> ChunkIOResult<Vec<u8>>;

    async fn delete_chunk(&self, chunk: &ChunkId) -> ChunkIOResult;

    async fn chunk_kind(&self, chunk: &ChunkId) -> ChunkIOResult<ChunkKind>;

    /// Lists every chunk of `kind`. Used to reopen a volume.
    async fn list_chunks(&self, kind: ChunkKind) -> ChunkIOResult<Vec<ChunkId>>;

    /// Reads one range per request, in request order. Fails on the first
    /// failing read. Backends with a multi-get can override this.
    async fn read_ranges(&self, reads: &[(ChunkId, u64, usize)]) -> ChunkIOResult<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(reads.len());
        for (chunk, offset, len) in reads {
            out.push(self.read_range(chunk, *offset, *len).await?);
        }
        Ok(out)
    }

    /// Applies the writes in order and stops at the first failure. Writes
    /// before the failing one stay applied.
    async fn write_ranges(&self, writes: &[(ChunkId, u64, &[u8])]) -> ChunkIOResult {
        for (chunk, offset, data) in writes {
            self.write_range(chunk, *offset, data).await?;
        }
        Ok(())
    }

    /// Flushes any buffered data (may be a no-op).
    async fn flush(&self) -> ChunkIOResult {
        Ok(())
    }
}

/// Bounds check shared by the backends.
#[inline]
pub fn check_range(chunk_size: u64, offset: u64, len: usize) -> ChunkIOResult {
    let end = offset
        .checked_add(len as u64)
        .ok_or(ChunkIOError::OutOfBounds)?;
    if end > chunk_size {
        return Err(ChunkIOError::OutOfBounds);
    }
    Ok(())
}

/// Extension trait for reading and writing fixed-layout structs using zerocopy.
#[async_trait]
pub trait ChunkStoreExt: ChunkStore {
    /// Reads a struct of type `T` from the given offset.
    async fn read_struct<T>(&self, chunk: &ChunkId, offset: u64) -> ChunkIOResult<T>
    where
        T: FromBytes + KnownLayout + Immutable + Send,
    {
        let size = core::mem::size_of::<T>();
        let buf = self.read_range(chunk, offset, size).await?;
        T::read_from_bytes(&buf).map_err(|_| ChunkIOError::Other("read_struct failed"))
    }

    /// Writes a struct of type `T` at the given offset.
    async fn write_struct<T>(&self, chunk: &ChunkId, offset: u64, val: &T) -> ChunkIOResult
    where
        T: IntoBytes + Immutable + Sync,
    {
        self.write_range(chunk, offset, val.as_bytes()).await
    }
}

impl<S: ChunkStore + ?Sized> ChunkStoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_byte_roundtrip() {
        for kind in ChunkKind::ALL {
            assert_eq!(ChunkKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(ChunkKind::from_u8(0), None);
        assert_eq!(ChunkKind::from_u8(4), None);
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(4096, 0, 4096).is_ok());
        assert!(check_range(4096, 4095, 1).is_ok());
        assert_eq!(check_range(4096, 4095, 2), Err(ChunkIOError::OutOfBounds));
        assert_eq!(check_range(4096, u64::MAX, 1), Err(ChunkIOError::OutOfBounds));
    }
}
