// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::{ChunkIOError, ChunkIOResult, ChunkId, ChunkKind, ChunkStore, check_range};

#[derive(Debug)]
struct MemChunk {
    kind: ChunkKind,
    /// Grown lazily; bytes past the end read as zero.
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    fail_creates: u32,
    fail_writes: u32,
    latency: Option<Duration>,
}

/// In-memory implementation of `ChunkStore`.
///
/// Useful for tests, simulations and RAM-backed volumes. Carries a small fault
/// injector so callers can exercise retry, timeout and rollback paths.
#[derive(Debug)]
pub struct MemChunkStore {
    chunk_size: u64,
    chunks: RwLock<HashMap<ChunkId, MemChunk>>,
    faults: Mutex<Faults>,
}

impl MemChunkStore {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            chunks: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Makes the next `n` calls to `create_chunk` fail with `Unavailable`.
    pub fn fail_next_creates(&self, n: u32) {
        self.faults.lock().fail_creates = n;
    }

    /// Makes the next `n` calls to `write_range` fail with `Unavailable`.
    pub fn fail_next_writes(&self, n: u32) {
        self.faults.lock().fail_writes = n;
    }

    /// While offline every operation fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Delays every create/write by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn count_kind(&self, kind: ChunkKind) -> usize {
        self.chunks.read().values().filter(|c| c.kind == kind).count()
    }

    pub fn contains(&self, chunk: &ChunkId) -> bool {
        self.chunks.read().contains_key(chunk)
    }

    fn check_online(&self) -> ChunkIOResult {
        if self.faults.lock().offline {
            return Err(ChunkIOError::Unavailable);
        }
        Ok(())
    }

    async fn delay(&self) {
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ChunkStore for MemChunkStore {
    #[inline]
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    async fn create_chunk(&self, kind: ChunkKind) -> ChunkIOResult<ChunkId> {
        self.delay().await;
        self.check_online()?;
        {
            let mut faults = self.faults.lock();
            if faults.fail_creates > 0 {
                faults.fail_creates -= 1;
                return Err(ChunkIOError::Unavailable);
            }
        }

        let mut chunks = self.chunks.write();
        let mut id = ChunkId::random();
        while chunks.contains_key(&id) {
            id = ChunkId::random();
        }
        chunks.insert(
            id,
            MemChunk {
                kind,
                data: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn write_range(&self, chunk: &ChunkId, offset: u64, data: &[u8]) -> ChunkIOResult {
        self.delay().await;
        self.check_online()?;
        {
            let mut faults = self.faults.lock();
            if faults.fail_writes > 0 {
                faults.fail_writes -= 1;
                return Err(ChunkIOError::Unavailable);
            }
        }
        check_range(self.chunk_size, offset, data.len())?;

        let mut chunks = self.chunks.write();
        let entry = chunks.get_mut(chunk).ok_or(ChunkIOError::NotFound)?;
        let start = offset as usize;
        let end = start + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn read_range(
        &self,
        chunk: &ChunkId,
        offset: u64,
        len: usize,
    ) -> ChunkIOResult<Vec<u8>> {
        self.check_online()?;
        check_range(self.chunk_size, offset, len)?;

        let chunks = self.chunks.read();
        let entry = chunks.get(chunk).ok_or(ChunkIOError::NotFound)?;
        let mut out = vec![0u8; len];
        let start = offset as usize;
        let copy_end = (start + len).min(entry.data.len());
        if copy_end > start {
            out[..copy_end - start].copy_from_slice(&entry.data[start..copy_end]);
        }
        Ok(out)
    }

    async fn delete_chunk(&self, chunk: &ChunkId) -> ChunkIOResult {
        self.check_online()?;
        self.chunks
            .write()
            .remove(chunk)
            .map(|_| ())
            .ok_or(ChunkIOError::NotFound)
    }

    async fn chunk_kind(&self, chunk: &ChunkId) -> ChunkIOResult<ChunkKind> {
        self.check_online()?;
        self.chunks
            .read()
            .get(chunk)
            .map(|c| c.kind)
            .ok_or(ChunkIOError::NotFound)
    }

    async fn list_chunks(&self, kind: ChunkKind) -> ChunkIOResult<Vec<ChunkId>> {
        self.check_online()?;
        let mut ids: Vec<ChunkId> = self
            .chunks
            .read()
            .iter()
            .filter(|(_, c)| c.kind == kind)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChunkStoreExt;

    const CHUNK: u64 = 64 * 1024;

    #[tokio::test]
    async fn test_rw_and_zero_tail() {
        let store = MemChunkStore::new(CHUNK);
        let id = store.create_chunk(ChunkKind::Raw).await.unwrap();

        store.write_range(&id, 10, &[1, 2, 3, 4]).await.unwrap();
        let out = store.read_range(&id, 8, 8).await.unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 4, 0, 0]);

        // never written, still readable
        let tail = store.read_range(&id, CHUNK - 4, 4).await.unwrap();
        assert_eq!(tail, [0u8; 4]);
    }

    #[tokio::test]
    async fn test_bounds() {
        let store = MemChunkStore::new(CHUNK);
        let id = store.create_chunk(ChunkKind::Shared).await.unwrap();
        assert_eq!(
            store.write_range(&id, CHUNK - 1, &[0, 0]).await,
            Err(ChunkIOError::OutOfBounds)
        );
        assert_eq!(
            store.read_range(&id, CHUNK, 1).await,
            Err(ChunkIOError::OutOfBounds)
        );
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = MemChunkStore::new(CHUNK);
        let raw = store.create_chunk(ChunkKind::Raw).await.unwrap();
        let shared = store.create_chunk(ChunkKind::Shared).await.unwrap();

        assert_eq!(store.list_chunks(ChunkKind::Raw).await.unwrap(), vec![raw]);
        assert_eq!(store.chunk_kind(&shared).await.unwrap(), ChunkKind::Shared);

        store.delete_chunk(&raw).await.unwrap();
        assert_eq!(store.delete_chunk(&raw).await, Err(ChunkIOError::NotFound));
        assert!(store.list_chunks(ChunkKind::Raw).await.unwrap().is_empty());
        assert_eq!(store.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemChunkStore::new(CHUNK);
        store.fail_next_creates(2);
        assert_eq!(
            store.create_chunk(ChunkKind::Raw).await,
            Err(ChunkIOError::Unavailable)
        );
        assert_eq!(
            store.create_chunk(ChunkKind::Raw).await,
            Err(ChunkIOError::Unavailable)
        );
        let id = store.create_chunk(ChunkKind::Raw).await.unwrap();

        store.fail_next_writes(1);
        assert_eq!(
            store.write_range(&id, 0, &[1]).await,
            Err(ChunkIOError::Unavailable)
        );
        store.write_range(&id, 0, &[1]).await.unwrap();

        store.set_offline(true);
        assert_eq!(
            store.read_range(&id, 0, 1).await,
            Err(ChunkIOError::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_batch_ranges() {
        let store = MemChunkStore::new(CHUNK);
        let a = store.create_chunk(ChunkKind::Raw).await.unwrap();
        let b = store.create_chunk(ChunkKind::Raw).await.unwrap();

        store
            .write_ranges(&[(a, 0, &[1u8, 2][..]), (b, 100, &[3u8][..])])
            .await
            .unwrap();
        let out = store
            .read_ranges(&[(b, 100, 1), (a, 0, 3)])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![3], vec![1, 2, 0]]);

        // the first write lands, the second fails and the third is never tried
        store.write_range(&a, 0, &[9]).await.unwrap();
        store.delete_chunk(&b).await.unwrap();
        assert_eq!(
            store
                .write_ranges(&[(a, 1, &[7u8][..]), (b, 0, &[7u8][..]), (a, 2, &[7u8][..])])
                .await,
            Err(ChunkIOError::NotFound)
        );
        assert_eq!(store.read_range(&a, 0, 3).await.unwrap(), [9, 7, 0]);
        assert_eq!(
            store.read_ranges(&[(a, 0, 1), (b, 0, 1)]).await,
            Err(ChunkIOError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_struct_ext() {
        let store = MemChunkStore::new(CHUNK);
        let id = store.create_chunk(ChunkKind::Meta).await.unwrap();
        store.write_struct(&id, 16, &0xDEAD_BEEFu32).await.unwrap();
        let v: u32 = store.read_struct(&id, 16).await.unwrap();
        assert_eq!(v, 0xDEAD_BEEF);
    }
}
