// SPDX-License-Identifier: MIT

//! Named files in a directory-backed volume.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use eossfs::core::meta::validate_name;
use eossfs::prelude::*;
use eossio::prelude::LocalChunkStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub target: DirTarget,
    /// Size and chunk count of a file entry; `None` for subdirectories or
    /// records whose plan is missing.
    pub file: Option<(u64, usize)>,
}

pub struct Volume {
    alloc: ChunkAllocator<LocalChunkStore>,
}

impl Volume {
    pub async fn open(
        dir: &Path,
        layout: ChunkLayout,
        options: AllocatorOptions,
    ) -> anyhow::Result<Self> {
        let store = LocalChunkStore::open(dir, layout.chunk_size())
            .await
            .with_context(|| format!("opening volume at {}", dir.display()))?;
        let alloc = ChunkAllocator::open(layout, Arc::new(store), options).await?;
        crate::log_verbose!("Volume {} opened", dir.display());
        Ok(Self { alloc })
    }

    #[inline]
    pub fn allocator(&self) -> &ChunkAllocator<LocalChunkStore> {
        &self.alloc
    }

    fn lookup(&self, name: &str) -> anyhow::Result<PlacementPlan> {
        match self.alloc.meta().get(name) {
            Some(DirTarget::File(id)) => self
                .alloc
                .meta()
                .placement(&id)
                .with_context(|| format!("'{name}' points at {id} which has no placement")),
            Some(DirTarget::Subdir(_)) => bail!("'{name}' is a directory"),
            None => bail!("no such file '{name}'"),
        }
    }

    /// Streams `byte_size` bytes of `src` in under `name`, replacing any
    /// previous file of that name.
    pub async fn put_from<R>(
        &self,
        name: &str,
        src: R,
        byte_size: u64,
    ) -> anyhow::Result<PlacementPlan>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_name(name)?;
        let previous = self.lookup(name).ok();

        let plan = self.alloc.store_from(src, byte_size).await?;
        if let Err(e) = self
            .alloc
            .meta()
            .put_directory_record(name, DirTarget::File(plan.file_id))
            .await
        {
            self.alloc.release_file(plan.file_id, &plan).await?;
            return Err(e.into());
        }

        if let Some(old) = previous {
            self.alloc.release_file(old.file_id, &old).await?;
        }
        Ok(plan)
    }

    /// Streams the file stored under `name` into `dst`. Returns its size.
    pub async fn export<W>(&self, name: &str, dst: &mut W) -> anyhow::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let plan = self.lookup(name)?;
        let mut reader = self.alloc.payload_reader(&plan);
        let n = tokio::io::copy(&mut reader, dst)
            .await
            .with_context(|| format!("reading '{name}'"))?;
        dst.flush().await?;
        if n != plan.byte_size {
            bail!("'{name}' ended after {n} of {} bytes", plan.byte_size);
        }
        Ok(n)
    }

    /// Drops the record and frees the file's space.
    pub async fn remove(&self, name: &str) -> anyhow::Result<PlacementPlan> {
        let plan = self.lookup(name)?;
        self.alloc.meta().remove_directory_record(name).await?;
        self.alloc.release_file(plan.file_id, &plan).await?;
        Ok(plan)
    }

    pub async fn reclaim(&self) -> anyhow::Result<usize> {
        Ok(self.alloc.reclaim_empty_shared().await?)
    }

    pub fn list(&self) -> Vec<Listing> {
        let meta = self.alloc.meta();
        meta.directory()
            .into_iter()
            .map(|(name, target)| {
                let file = match target {
                    DirTarget::File(id) => meta
                        .placement(&id)
                        .map(|p| (p.byte_size, p.entries.len())),
                    DirTarget::Subdir(_) => None,
                };
                Listing { name, target, file }
            })
            .collect()
    }

    pub fn check(&self) -> VerifyReport {
        verify_volume(self.alloc.catalog(), self.alloc.meta())
    }
}
