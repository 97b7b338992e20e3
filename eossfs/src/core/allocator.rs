// SPDX-License-Identifier: MIT

//! Per-file placement decisions.
//!
//! - Files smaller than one chunk are packed into a shared chunk, best fit
//!   among known chunks, else a fresh shared chunk.
//! - Larger files get one fresh raw chunk per full chunk of data. The
//!   remainder goes to a shared chunk that hosts no other remainder, or to
//!   its own raw chunk when none has room.
//!
//! Allocation is all-or-nothing per file: every side effect is tracked by a
//! rollback guard and undone on error or cancellation.

pub mod catalog;
mod payload;
pub mod plan;
mod rollback;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use eossio::prelude::{ChunkId, ChunkKind, ChunkStore};

use crate::core::errors::{FsError, FsResult};
use crate::core::fat_bitmap::{FatBitMap, RunFlags};
use crate::core::id::{FileId, IdGenerator, RandomIdGenerator};
use crate::core::layout::ChunkLayout;
use crate::core::meta::MetaChunkIndex;
use crate::core::utils::retry::StoreOps;

use catalog::{ChunkCatalog, Placement, Reservation, SharedChunk};
use rollback::Rollback;

pub use payload::{PayloadReader, PayloadWriter, into_fs_error};
pub use plan::{PlacementEntry, PlacementPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorOptions {
    /// Rounds over the candidate list before creating a new shared chunk.
    pub max_candidate_retries: u32,
    /// Deadline of every single backend call.
    pub store_timeout: Duration,
    /// Tries for idempotent calls (`create_chunk`, `delete_chunk`).
    pub create_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            max_candidate_retries: 3,
            store_timeout: Duration::from_secs(5),
            create_attempts: 4,
            backoff_base: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub shared_chunks: usize,
    pub quarantined: usize,
    pub free_shared_blocks: u64,
    pub tenants: u64,
    pub remainders: usize,
    pub placements: usize,
}

pub struct ChunkAllocator<S: ChunkStore + ?Sized + 'static> {
    layout: ChunkLayout,
    ops: StoreOps<S>,
    catalog: Arc<ChunkCatalog>,
    meta: Arc<MetaChunkIndex<S>>,
    ids: Arc<dyn IdGenerator>,
    options: AllocatorOptions,
    /// Serializes shared chunk creation so concurrent writers do not each
    /// open a fresh chunk for the same demand.
    grow: tokio::sync::Mutex<()>,
}

fn check_store<S: ChunkStore + ?Sized>(layout: &ChunkLayout, store: &S) -> FsResult {
    if store.chunk_size() != layout.chunk_size() {
        return Err(FsError::Config("store chunk size differs from layout"));
    }
    Ok(())
}

fn store_ops<S: ChunkStore + ?Sized>(store: Arc<S>, options: &AllocatorOptions) -> StoreOps<S> {
    StoreOps {
        store,
        timeout: options.store_timeout,
        attempts: options.create_attempts,
        backoff_base: options.backoff_base,
    }
}

impl<S: ChunkStore + ?Sized + 'static> ChunkAllocator<S> {
    /// Allocator over an empty volume.
    pub fn new(layout: ChunkLayout, store: Arc<S>, options: AllocatorOptions) -> FsResult<Self> {
        check_store(&layout, &*store)?;
        let ops = store_ops(store, &options);
        let meta = MetaChunkIndex::new(ops.clone(), layout);
        if !meta.can_hold_plans() {
            return Err(FsError::Config("chunk too small to hold a placement record"));
        }
        Ok(Self::assemble(layout, ops, ChunkCatalog::new(layout), meta, options))
    }

    /// Reopens a volume: rebuilds the catalog and replays the meta log.
    pub async fn open(layout: ChunkLayout, store: Arc<S>, options: AllocatorOptions) -> FsResult<Self> {
        check_store(&layout, &*store)?;
        let ops = store_ops(store, &options);
        let catalog = ChunkCatalog::load(&*ops.store, layout, options.store_timeout).await?;
        let meta = MetaChunkIndex::load(ops.clone(), layout).await?;
        if !meta.can_hold_plans() {
            return Err(FsError::Config("chunk too small to hold a placement record"));
        }
        tracing::info!(
            shared = catalog.len(),
            placements = meta.placement_count(),
            "volume opened"
        );
        Ok(Self::assemble(layout, ops, catalog, meta, options))
    }

    fn assemble(
        layout: ChunkLayout,
        ops: StoreOps<S>,
        catalog: ChunkCatalog,
        meta: MetaChunkIndex<S>,
        options: AllocatorOptions,
    ) -> Self {
        Self {
            layout,
            ops,
            catalog: Arc::new(catalog),
            meta: Arc::new(meta),
            ids: Arc::new(RandomIdGenerator),
            options,
            grow: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    #[inline]
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    #[inline]
    pub fn options(&self) -> &AllocatorOptions {
        &self.options
    }

    #[inline]
    pub fn store(&self) -> &Arc<S> {
        &self.ops.store
    }

    #[inline]
    pub fn catalog(&self) -> &Arc<ChunkCatalog> {
        &self.catalog
    }

    #[inline]
    pub fn meta(&self) -> &Arc<MetaChunkIndex<S>> {
        &self.meta
    }

    fn rollback(&self) -> Rollback<S> {
        Rollback::new(
            self.ops.clone(),
            self.layout,
            self.catalog.clone(),
            self.meta.clone(),
        )
    }

    /// Decides where a new file of `byte_size` bytes lives and records the plan.
    ///
    /// On success the reserved bitmaps are persisted and the plan is in the
    /// meta index. On failure nothing stays reserved.
    pub async fn allocate_file(&self, byte_size: u64) -> FsResult<PlacementPlan> {
        if byte_size == 0 {
            return Err(FsError::InvalidRequest("zero-sized file"));
        }
        // Plans count their entries in 32 bits
        let (full_chunks, _) = self.layout.split_file(byte_size);
        if full_chunks >= u32::MAX as u64 {
            return Err(FsError::RequestTooLarge);
        }
        let file_id = self.ids.new_id();
        let mut guard = self.rollback();

        match self.place(file_id, byte_size, &mut guard).await {
            Ok(plan) => {
                guard.commit();
                tracing::debug!(
                    file = %file_id,
                    byte_size,
                    raw = plan.raw_count(),
                    shared = plan.shared_entry().is_some(),
                    "file placed"
                );
                Ok(plan)
            }
            Err(e) => {
                tracing::warn!(file = %file_id, byte_size, error = %e, "allocation failed, rolling back");
                guard.abort().await;
                Err(e)
            }
        }
    }

    async fn place(
        &self,
        file_id: FileId,
        byte_size: u64,
        guard: &mut Rollback<S>,
    ) -> FsResult<PlacementPlan> {
        let layout = self.layout;
        let mut entries = Vec::new();

        if layout.is_tiny(byte_size) {
            let blocks = layout.blocks_needed(byte_size);
            if layout.fits_shared(blocks) {
                let r = self.place_tiny(blocks as u32, guard).await?;
                entries.push(PlacementEntry::shared(r.chunk, r.tag, r.range, byte_size));
            } else {
                tracing::debug!(byte_size, "tiny file exceeds shared capacity, using a raw chunk");
                let id = self.new_raw(guard).await?;
                entries.push(PlacementEntry::raw(id, &layout, byte_size));
            }
        } else {
            let (full_chunks, remainder) = layout.split_file(byte_size);
            for _ in 0..full_chunks {
                let id = self.new_raw(guard).await?;
                entries.push(PlacementEntry::raw(id, &layout, layout.chunk_size()));
            }
            if remainder > 0 {
                let blocks = layout.blocks_needed(remainder);
                let shared = if layout.fits_shared(blocks) {
                    self.place_in_existing(blocks as u32, RunFlags::REMAINDER)
                } else {
                    None
                };
                match shared {
                    Some(r) => {
                        guard.track_reservation(r);
                        entries.push(PlacementEntry::shared(r.chunk, r.tag, r.range, remainder));
                    }
                    None => {
                        tracing::debug!(remainder, "no shared chunk for remainder, using a raw chunk");
                        let id = self.new_raw(guard).await?;
                        entries.push(PlacementEntry::raw(id, &layout, remainder));
                    }
                }
            }
        }

        let mut plan = PlacementPlan {
            file_id,
            byte_size,
            entries,
        };
        plan.seal();

        self.persist_reserved(guard.reservations()).await?;
        guard.track_record(file_id);
        self.meta.put_placement(&plan).await?;
        Ok(plan)
    }

    /// Bounded optimistic rounds over the current candidates.
    fn place_in_existing(&self, blocks: u32, flags: RunFlags) -> Option<Reservation> {
        let remainder = flags.contains(RunFlags::REMAINDER);
        for round in 0..self.options.max_candidate_retries.max(1) {
            let candidates = self.catalog.candidates(blocks, remainder);
            if candidates.is_empty() {
                return None;
            }
            for chunk in candidates {
                match chunk.try_place(blocks, flags) {
                    Placement::Placed(r) => return Some(r),
                    Placement::Retryable(reason) => {
                        tracing::trace!(chunk = %chunk.id(), ?reason, round, "candidate lost");
                    }
                }
            }
        }
        None
    }

    async fn place_tiny(&self, blocks: u32, guard: &mut Rollback<S>) -> FsResult<Reservation> {
        if let Some(r) = self.place_in_existing(blocks, RunFlags::empty()) {
            guard.track_reservation(r);
            return Ok(r);
        }

        let _grow = self.grow.lock().await;
        // Someone may have published a chunk while we waited
        if let Some(r) = self.place_in_existing(blocks, RunFlags::empty()) {
            guard.track_reservation(r);
            return Ok(r);
        }

        let chunk = self.new_shared(guard).await?;
        match chunk.try_place(blocks, RunFlags::empty()) {
            Placement::Placed(r) => {
                guard.track_reservation(r);
                Ok(r)
            }
            Placement::Retryable(reason) => {
                tracing::warn!(chunk = %chunk.id(), ?reason, "fresh shared chunk refused placement");
                Err(FsError::RetriesExhausted)
            }
        }
    }

    async fn new_raw(&self, guard: &mut Rollback<S>) -> FsResult<ChunkId> {
        let id = self.ops.create(ChunkKind::Raw).await?;
        guard.track_created(id);
        Ok(id)
    }

    /// Creates a shared chunk, writes its empty bitmap, then publishes it.
    async fn new_shared(&self, guard: &mut Rollback<S>) -> FsResult<Arc<SharedChunk>> {
        let id = self.ops.create(ChunkKind::Shared).await?;
        guard.track_created(id);

        let chunk = SharedChunk::new(id, FatBitMap::new(&self.layout));
        chunk
            .persist(&*self.ops.store, &self.layout, self.ops.timeout)
            .await?;

        let chunk = self.catalog.publish(chunk);
        guard.forget_created(&id);
        tracing::info!(chunk = %id, "shared chunk created");
        Ok(chunk)
    }

    async fn persist_reserved(&self, reservations: &[Reservation]) -> FsResult {
        let mut ids: Vec<ChunkId> = reservations.iter().map(|r| r.chunk).collect();
        ids.sort();
        ids.dedup();
        for id in ids {
            if let Some(chunk) = self.catalog.get(&id) {
                chunk
                    .persist(&*self.ops.store, &self.layout, self.ops.timeout)
                    .await?;
            }
        }
        Ok(())
    }

    /// Gives back everything `plan` holds.
    ///
    /// Shared tenants are released, raw chunks deleted, touched bitmaps
    /// persisted and the plan dropped from the index. Every entry is
    /// attempted; the first error is returned.
    pub async fn release_file(&self, file_id: FileId, plan: &PlacementPlan) -> FsResult {
        if plan.file_id != file_id {
            return Err(FsError::InvalidRequest("plan belongs to another file"));
        }

        let mut first_err: Option<FsError> = None;
        let mut touched = Vec::new();
        let mut note = |e: FsError| {
            tracing::warn!(file = %file_id, error = %e, "release step failed");
            if first_err.is_none() {
                first_err = Some(e);
            }
        };

        for entry in &plan.entries {
            match entry.kind {
                ChunkKind::Shared => {
                    let Some(chunk) = self.catalog.get(&entry.chunk_id) else {
                        note(FsError::InvalidRequest("plan references an unknown shared chunk"));
                        continue;
                    };
                    let Some(tag) = entry.tenant else {
                        note(FsError::InvalidRequest("shared entry without tenant"));
                        continue;
                    };
                    match chunk.release(tag, entry.blocks) {
                        Ok(()) => touched.push(chunk),
                        Err(e) => note(e),
                    }
                }
                ChunkKind::Raw => {
                    if let Err(e) = self.ops.delete(entry.chunk_id).await {
                        note(e.into());
                    }
                }
                ChunkKind::Meta => note(FsError::InvalidRequest("meta chunk in placement plan")),
            }
        }

        for chunk in touched {
            if let Err(e) = chunk
                .persist(&*self.ops.store, &self.layout, self.ops.timeout)
                .await
            {
                note(e);
            }
        }
        if let Err(e) = self.meta.remove_placement(&file_id).await {
            note(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::debug!(file = %file_id, "file released");
                Ok(())
            }
        }
    }

    /// Streaming writer over the chunks of `plan`.
    pub fn payload_writer(&self, plan: &PlacementPlan) -> PayloadWriter<S> {
        PayloadWriter::new(self.ops.clone(), self.layout, plan)
    }

    /// Streaming reader over the chunks of `plan`.
    pub fn payload_reader(&self, plan: &PlacementPlan) -> PayloadReader<S> {
        PayloadReader::new(self.ops.clone(), self.layout, plan)
    }

    /// Allocates a plan for `byte_size` bytes and streams them from `src`.
    ///
    /// A failed write, or a source shorter than `byte_size`, releases the
    /// plan before the error surfaces.
    pub async fn store_from<R>(&self, src: R, byte_size: u64) -> FsResult<PlacementPlan>
    where
        R: AsyncRead + Unpin + Send,
    {
        let plan = self.allocate_file(byte_size).await?;
        let mut writer = self.payload_writer(&plan);
        let copied = async {
            tokio::io::copy(&mut src.take(byte_size), &mut writer).await?;
            writer.shutdown().await
        }
        .await;

        if let Err(e) = copied {
            let e = into_fs_error(e);
            tracing::warn!(file = %plan.file_id, error = %e, "payload write failed, releasing plan");
            if let Err(rel) = self.release_file(plan.file_id, &plan).await {
                tracing::warn!(file = %plan.file_id, error = %rel, "release after failed write also failed");
            }
            return Err(e);
        }
        Ok(plan)
    }

    /// Allocates a plan for `bytes` and writes them.
    pub async fn store_file(&self, bytes: &[u8]) -> FsResult<PlacementPlan> {
        self.store_from(bytes, bytes.len() as u64).await
    }

    /// Reads a whole file into memory.
    pub async fn load_file(&self, plan: &PlacementPlan) -> FsResult<Vec<u8>> {
        if plan.total_payload() != plan.byte_size {
            return Err(FsError::InvalidRequest("plan does not cover the file"));
        }
        let mut out = Vec::new();
        self.payload_reader(plan)
            .read_to_end(&mut out)
            .await
            .map_err(into_fs_error)?;
        Ok(out)
    }

    /// Deletes shared chunks that hold no tenant. Returns how many went.
    ///
    /// Never runs implicitly. Retired chunks accept no placement while the
    /// delete is in flight.
    pub async fn reclaim_empty_shared(&self) -> FsResult<usize> {
        let mut reclaimed = 0usize;
        for chunk in self.catalog.chunks() {
            if chunk.is_quarantined() || !chunk.try_retire() {
                continue;
            }
            let id = chunk.id();
            match self.ops.delete(id).await {
                Ok(()) => {
                    self.catalog.remove(&id);
                    reclaimed += 1;
                    tracing::info!(chunk = %id, "empty shared chunk reclaimed");
                }
                Err(e) => {
                    chunk.unretire();
                    return Err(e.into());
                }
            }
        }
        Ok(reclaimed)
    }

    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            placements: self.meta.placement_count(),
            ..AllocatorStats::default()
        };
        for chunk in self.catalog.chunks() {
            stats.shared_chunks += 1;
            if chunk.is_quarantined() {
                stats.quarantined += 1;
                continue;
            }
            let s = chunk.stats();
            stats.free_shared_blocks += s.free_blocks as u64;
            stats.tenants += s.tenants as u64;
            stats.remainders += s.has_remainder as usize;
        }
        stats
    }
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use super::*;
    use crate::core::id::SeededIdGenerator;
    use eossio::prelude::MemChunkStore;

    fn small() -> (Arc<MemChunkStore>, ChunkAllocator<MemChunkStore>) {
        // 16 blocks per chunk, 15 data blocks in shared chunks
        let layout = ChunkLayout::new(64 * 1024, 4096, 1).unwrap();
        let store = Arc::new(MemChunkStore::new(layout.chunk_size()));
        let options = AllocatorOptions {
            backoff_base: Duration::from_millis(1),
            ..AllocatorOptions::default()
        };
        let alloc = ChunkAllocator::new(layout, store.clone(), options)
            .unwrap()
            .with_id_generator(Arc::new(SeededIdGenerator::new(1)));
        (store, alloc)
    }

    #[test]
    fn test_store_chunk_size_must_match() {
        let store = Arc::new(MemChunkStore::new(1024 * 1024));
        assert!(matches!(
            ChunkAllocator::new(ChunkLayout::default(), store, AllocatorOptions::default()),
            Err(FsError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_tiny_files_share_a_chunk() {
        let (store, alloc) = small();
        let a = alloc.allocate_file(100).await.unwrap();
        let b = alloc.allocate_file(3 * 4096).await.unwrap();

        let ea = a.shared_entry().unwrap();
        let eb = b.shared_entry().unwrap();
        assert_eq!(ea.chunk_id, eb.chunk_id);
        assert_eq!(ea.blocks.len, 1);
        assert_eq!(eb.blocks.len, 3);
        assert!(!ea.blocks.overlaps(&eb.blocks));
        assert_eq!(store.count_kind(ChunkKind::Shared), 1);
        assert_eq!(alloc.stats().tenants, 2);
        assert_eq!(alloc.meta().placement_count(), 2);
    }

    #[tokio::test]
    async fn test_new_shared_chunk_when_full() {
        let (store, alloc) = small();
        alloc.allocate_file(10 * 4096).await.unwrap();
        alloc.allocate_file(10 * 4096).await.unwrap();
        assert_eq!(store.count_kind(ChunkKind::Shared), 2);
    }

    #[tokio::test]
    async fn test_oversized_tiny_goes_raw() {
        // 15 data blocks, a 60 KiB file needs 15 and fits, 61 KiB does not
        let (store, alloc) = small();
        let fits = alloc.allocate_file(60 * 1024).await.unwrap();
        assert!(fits.shared_entry().is_some());

        let raw = alloc.allocate_file(61 * 1024).await.unwrap();
        assert_eq!(raw.entries.len(), 1);
        assert_eq!(raw.entries[0].kind, ChunkKind::Raw);
        assert_eq!(raw.entries[0].blocks.start, 0);
        assert_eq!(raw.entries[0].blocks.len, 16);
        assert_eq!(store.count_kind(ChunkKind::Raw), 1);
    }

    #[tokio::test]
    async fn test_release_is_exact_once() {
        let (_store, alloc) = small();
        let plan = alloc.allocate_file(100).await.unwrap();
        alloc.release_file(plan.file_id, &plan).await.unwrap();
        assert_eq!(alloc.stats().tenants, 0);
        assert!(alloc.meta().placement(&plan.file_id).is_none());

        assert!(matches!(
            alloc.release_file(plan.file_id, &plan).await,
            Err(FsError::Bitmap(_))
        ));
        assert!(matches!(
            alloc.release_file(FileId::new([0; 32]), &plan).await,
            Err(FsError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_reclaim_empty_shared() {
        let (store, alloc) = small();
        let a = alloc.allocate_file(100).await.unwrap();
        assert_eq!(alloc.reclaim_empty_shared().await.unwrap(), 0);

        alloc.release_file(a.file_id, &a).await.unwrap();
        assert_eq!(alloc.reclaim_empty_shared().await.unwrap(), 1);
        assert_eq!(store.count_kind(ChunkKind::Shared), 0);
        assert!(alloc.catalog().is_empty());

        // next tiny file opens a new chunk
        alloc.allocate_file(100).await.unwrap();
        assert_eq!(store.count_kind(ChunkKind::Shared), 1);
    }
}
