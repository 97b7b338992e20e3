// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{ChunkIOResult, ChunkId, ChunkKind, ChunkStore};

/// Simple counters.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct IoStats {
    pub creates: u64,
    pub deletes: u64,
    pub reads: u64,
    pub read_bytes: u64,
    pub writes: u64,
    pub write_bytes: u64,

    // Alignment against the configured block size
    pub aligned_writes: u64,
    pub unaligned_writes: u64,

    // Useful sizes to diagnose granularity
    pub max_read: u64,
    pub max_write: u64,
}

impl IoStats {
    #[inline]
    pub fn reset(&mut self) {
        *self = IoStats::default();
    }
}

/// Transparent instrumentation wrapper.
pub struct CountingStore<S: ChunkStore> {
    inner: S,
    stats: Mutex<IoStats>,
    /// Local "block" alignment (e.g. 4096)
    align: u64,
}

impl<S: ChunkStore> CountingStore<S> {
    #[inline]
    pub fn new(inner: S) -> Self {
        Self::with_align(inner, 1)
    }

    #[inline]
    pub fn with_align(inner: S, align: u64) -> Self {
        let align = if align == 0 { 1 } else { align };
        Self {
            inner,
            stats: Mutex::new(IoStats::default()),
            align,
        }
    }

    #[inline]
    pub fn snapshot(&self) -> IoStats {
        *self.stats.lock()
    }

    #[inline]
    pub fn reset(&self) {
        self.stats.lock().reset();
    }

    #[inline]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    #[inline]
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: ChunkStore> ChunkStore for CountingStore<S> {
    #[inline]
    fn chunk_size(&self) -> u64 {
        self.inner.chunk_size()
    }

    async fn create_chunk(&self, kind: ChunkKind) -> ChunkIOResult<ChunkId> {
        self.stats.lock().creates += 1;
        self.inner.create_chunk(kind).await
    }

    async fn write_range(&self, chunk: &ChunkId, offset: u64, data: &[u8]) -> ChunkIOResult {
        {
            let len = data.len() as u64;
            let mut stats = self.stats.lock();
            if offset % self.align == 0 && len % self.align == 0 {
                stats.aligned_writes += 1;
            } else {
                stats.unaligned_writes += 1;
            }
            stats.writes += 1;
            stats.write_bytes += len;
            stats.max_write = stats.max_write.max(len);
        }
        self.inner.write_range(chunk, offset, data).await
    }

    async fn read_range(
        &self,
        chunk: &ChunkId,
        offset: u64,
        len: usize,
    ) -> ChunkIOResult<Vec<u8>> {
        {
            let mut stats = self.stats.lock();
            stats.reads += 1;
            stats.read_bytes += len as u64;
            stats.max_read = stats.max_read.max(len as u64);
        }
        self.inner.read_range(chunk, offset, len).await
    }

    async fn delete_chunk(&self, chunk: &ChunkId) -> ChunkIOResult {
        self.stats.lock().deletes += 1;
        self.inner.delete_chunk(chunk).await
    }

    async fn chunk_kind(&self, chunk: &ChunkId) -> ChunkIOResult<ChunkKind> {
        self.inner.chunk_kind(chunk).await
    }

    async fn list_chunks(&self, kind: ChunkKind) -> ChunkIOResult<Vec<ChunkId>> {
        self.inner.list_chunks(kind).await
    }

    async fn flush(&self) -> ChunkIOResult {
        self.inner.flush().await
    }
}
