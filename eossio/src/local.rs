// SPDX-License-Identifier: MIT

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::{ChunkIOError, ChunkIOResult, ChunkId, ChunkKind, ChunkStore, check_range};

/// Directory-backed implementation of `ChunkStore`.
///
/// One sparse file per chunk, laid out as `<root>/<kind>/<hex-id>`.
#[derive(Debug, Clone)]
pub struct LocalChunkStore {
    root: PathBuf,
    chunk_size: u64,
}

impl LocalChunkStore {
    /// Opens (or initializes) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>, chunk_size: u64) -> ChunkIOResult<Self> {
        let root = root.as_ref().to_path_buf();
        for kind in ChunkKind::ALL {
            fs::create_dir_all(root.join(kind.dir_name())).await?;
        }
        Ok(Self { root, chunk_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, kind: ChunkKind, chunk: &ChunkId) -> PathBuf {
        self.root.join(kind.dir_name()).join(chunk.hex())
    }

    /// Locates a chunk file without knowing its kind.
    async fn locate(&self, chunk: &ChunkId) -> ChunkIOResult<(ChunkKind, PathBuf)> {
        for kind in ChunkKind::ALL {
            let path = self.path_of(kind, chunk);
            if fs::try_exists(&path).await? {
                return Ok((kind, path));
            }
        }
        Err(ChunkIOError::NotFound)
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    #[inline]
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    async fn create_chunk(&self, kind: ChunkKind) -> ChunkIOResult<ChunkId> {
        loop {
            let id = ChunkId::random();
            let path = self.path_of(kind, &id);
            let file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            let sized = async {
                file.set_len(self.chunk_size).await?;
                file.sync_all().await
            };
            if let Err(e) = sized.await {
                // A short file must not pass for a chunk
                if let Err(rm) = fs::remove_file(&path).await {
                    tracing::warn!(chunk = %id, error = %rm, "could not remove unsized chunk file");
                }
                return Err(e.into());
            }
            tracing::trace!(chunk = %id, %kind, "created chunk file");
            return Ok(id);
        }
    }

    async fn write_range(&self, chunk: &ChunkId, offset: u64, data: &[u8]) -> ChunkIOResult {
        check_range(self.chunk_size, offset, data.len())?;
        let (_, path) = self.locate(chunk).await?;
        let mut file = OpenOptions::new().write(true).open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_range(
        &self,
        chunk: &ChunkId,
        offset: u64,
        len: usize,
    ) -> ChunkIOResult<Vec<u8>> {
        check_range(self.chunk_size, offset, len)?;
        let (_, path) = self.locate(chunk).await?;
        let mut file = fs::File::open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn delete_chunk(&self, chunk: &ChunkId) -> ChunkIOResult {
        let (_, path) = self.locate(chunk).await?;
        fs::remove_file(&path).await?;
        Ok(())
    }

    async fn chunk_kind(&self, chunk: &ChunkId) -> ChunkIOResult<ChunkKind> {
        self.locate(chunk).await.map(|(kind, _)| kind)
    }

    async fn list_chunks(&self, kind: ChunkKind) -> ChunkIOResult<Vec<ChunkId>> {
        let mut ids = Vec::new();
        let mut dir = fs::read_dir(self.root.join(kind.dir_name())).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            // Foreign files in the directory are ignored
            if let Some(id) = name.to_str().and_then(ChunkId::from_hex) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: u64 = 64 * 1024;

    #[tokio::test]
    async fn test_rw() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::open(dir.path(), CHUNK).await.unwrap();
        let id = store.create_chunk(ChunkKind::Raw).await.unwrap();

        store.write_range(&id, 10, &[1, 2, 3, 4]).await.unwrap();
        let out = store.read_range(&id, 10, 4).await.unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        // sparse tail reads as zeros
        let tail = store.read_range(&id, CHUNK - 8, 8).await.unwrap();
        assert_eq!(tail, [0u8; 8]);
    }

    #[tokio::test]
    async fn test_bounds_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::open(dir.path(), CHUNK).await.unwrap();
        let id = store.create_chunk(ChunkKind::Shared).await.unwrap();

        assert_eq!(
            store.write_range(&id, CHUNK, &[1]).await,
            Err(ChunkIOError::OutOfBounds)
        );
        assert_eq!(
            store.read_range(&ChunkId::random(), 0, 1).await,
            Err(ChunkIOError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_reopen_lists_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, shared) = {
            let store = LocalChunkStore::open(dir.path(), CHUNK).await.unwrap();
            let meta = store.create_chunk(ChunkKind::Meta).await.unwrap();
            let shared = store.create_chunk(ChunkKind::Shared).await.unwrap();
            (meta, shared)
        };

        let store = LocalChunkStore::open(dir.path(), CHUNK).await.unwrap();
        assert_eq!(store.list_chunks(ChunkKind::Meta).await.unwrap(), vec![meta]);
        assert_eq!(store.chunk_kind(&shared).await.unwrap(), ChunkKind::Shared);

        store.delete_chunk(&shared).await.unwrap();
        assert!(store.list_chunks(ChunkKind::Shared).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sizing_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        // no file system takes a file this long
        let store = LocalChunkStore::open(dir.path(), u64::MAX).await.unwrap();

        assert!(store.create_chunk(ChunkKind::Raw).await.is_err());
        assert!(store.list_chunks(ChunkKind::Raw).await.unwrap().is_empty());
    }
}
