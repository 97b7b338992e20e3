// SPDX-License-Identifier: MIT

//! Registry of known shared chunks and their cached fill state.
//!
//! One lock per chunk: placements on different chunks never contend. Candidate
//! selection reads cached stats without touching any bitmap lock and may race;
//! `try_place` re-validates under the chunk lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use eossio::prelude::{ChunkId, ChunkKind, ChunkStore};

use crate::core::errors::{FatBitMapError, FsResult};
use crate::core::fat_bitmap::{BlockRange, FatBitMap, RunFlags, TenantTag};
use crate::core::layout::ChunkLayout;
use crate::core::utils::retry::with_timeout;

/// Bitmaps fetched per store round trip when reopening.
const LOAD_BATCH: usize = 32;

/// Cached summary of one chunk's bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub free_blocks: u32,
    pub largest_free_run: u32,
    pub tenants: u32,
    pub has_remainder: bool,
}

impl ChunkStats {
    fn of(fbm: &FatBitMap) -> Self {
        Self {
            free_blocks: fbm.free_block_count(),
            largest_free_run: fbm.largest_free_run(),
            tenants: fbm.tenant_count() as u32,
            has_remainder: fbm.has_remainder(),
        }
    }
}

/// A live reservation inside one shared chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub chunk: ChunkId,
    pub tag: TenantTag,
    pub range: BlockRange,
    pub flags: RunFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// No contiguous run large enough (anymore).
    NoRoom,
    /// A remainder was asked for and the chunk already hosts one.
    RemainderTaken,
    Quarantined,
    Retired,
    TagsExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Placed(Reservation),
    Retryable(RetryReason),
}

/// One shared chunk: its bitmap behind its own lock.
#[derive(Debug)]
pub struct SharedChunk {
    id: ChunkId,
    bitmap: Mutex<FatBitMap>,
    stats: RwLock<ChunkStats>,
    /// Serializes bitmap flushes; the encode happens after the lock is taken,
    /// so the last writer always carries the newest state.
    persist_lock: tokio::sync::Mutex<()>,
    quarantined: AtomicBool,
    retired: AtomicBool,
}

impl SharedChunk {
    pub fn new(id: ChunkId, bitmap: FatBitMap) -> Self {
        let stats = ChunkStats::of(&bitmap);
        Self {
            id,
            bitmap: Mutex::new(bitmap),
            stats: RwLock::new(stats),
            persist_lock: tokio::sync::Mutex::new(()),
            quarantined: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    #[inline]
    pub fn stats(&self) -> ChunkStats {
        *self.stats.read()
    }

    #[inline]
    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Stops all further placements into this chunk.
    pub fn quarantine(&self, reason: &str) {
        if !self.quarantined.swap(true, Ordering::AcqRel) {
            tracing::error!(chunk = %self.id, reason, "shared chunk quarantined");
        }
    }

    /// Runs `f` on the bitmap under the chunk lock.
    pub fn with_bitmap<R>(&self, f: impl FnOnce(&FatBitMap) -> R) -> R {
        f(&self.bitmap.lock())
    }

    fn refresh(&self, fbm: &FatBitMap) {
        *self.stats.write() = ChunkStats::of(fbm);
    }

    /// Reserves `blocks` contiguous blocks, re-validating under the lock.
    pub fn try_place(&self, blocks: u32, flags: RunFlags) -> Placement {
        let mut fbm = self.bitmap.lock();

        // Checked under the lock so a concurrent retire cannot slip between
        if self.is_retired() {
            return Placement::Retryable(RetryReason::Retired);
        }
        if self.is_quarantined() {
            return Placement::Retryable(RetryReason::Quarantined);
        }
        if flags.contains(RunFlags::REMAINDER) && fbm.has_remainder() {
            return Placement::Retryable(RetryReason::RemainderTaken);
        }

        let range = match fbm.try_reserve(blocks) {
            Ok(Some(range)) => range,
            Ok(None) | Err(_) => return Placement::Retryable(RetryReason::NoRoom),
        };
        let tag = match fbm.next_tag() {
            Ok(tag) => tag,
            Err(_) => return Placement::Retryable(RetryReason::TagsExhausted),
        };

        match fbm.reserve_for(tag, range, flags) {
            Ok(()) => {
                self.refresh(&fbm);
                Placement::Placed(Reservation {
                    chunk: self.id,
                    tag,
                    range,
                    flags,
                })
            }
            Err(FatBitMapError::RemainderTaken) => {
                Placement::Retryable(RetryReason::RemainderTaken)
            }
            Err(e) => {
                // The first-fit answer was rejected by the same bitmap: corruption
                drop(fbm);
                tracing::error!(chunk = %self.id, %range, error = %e, "reservation rejected by bitmap");
                self.quarantine(e.msg());
                Placement::Retryable(RetryReason::Quarantined)
            }
        }
    }

    /// Releases `tag` if it still owns exactly `range`.
    pub fn release(&self, tag: TenantTag, range: BlockRange) -> FsResult {
        let mut fbm = self.bitmap.lock();
        fbm.release_exact(tag, range)?;
        self.refresh(&fbm);
        Ok(())
    }

    /// Marks the chunk retired if it holds no tenant. Returns whether it did.
    pub fn try_retire(&self) -> bool {
        let fbm = self.bitmap.lock();
        if !fbm.is_empty() {
            return false;
        }
        !self.retired.swap(true, Ordering::AcqRel)
    }

    /// Undoes `try_retire` when the chunk could not be deleted.
    pub fn unretire(&self) {
        self.retired.store(false, Ordering::Release);
    }

    /// Writes the current bitmap into the chunk's reserved tail region.
    pub async fn persist<S: ChunkStore + ?Sized>(
        &self,
        store: &S,
        layout: &ChunkLayout,
        limit: Duration,
    ) -> FsResult {
        let _flush = self.persist_lock.lock().await;
        let (bytes, generation) = {
            let fbm = self.bitmap.lock();
            (fbm.encode(), fbm.generation())
        };
        with_timeout(
            limit,
            store.write_range(&self.id, layout.bitmap_offset(), &bytes),
        )
        .await?;
        tracing::trace!(chunk = %self.id, generation, "bitmap persisted");
        Ok(())
    }
}

/// Arena of shared chunk handles for one volume.
#[derive(Debug)]
pub struct ChunkCatalog {
    layout: ChunkLayout,
    chunks: RwLock<BTreeMap<ChunkId, Arc<SharedChunk>>>,
}

impl ChunkCatalog {
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            layout,
            chunks: RwLock::new(BTreeMap::new()),
        }
    }

    #[inline]
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Publishes a chunk; it becomes a placement candidate immediately.
    pub fn insert(&self, id: ChunkId, bitmap: FatBitMap) -> Arc<SharedChunk> {
        self.publish(SharedChunk::new(id, bitmap))
    }

    pub fn publish(&self, chunk: SharedChunk) -> Arc<SharedChunk> {
        let chunk = Arc::new(chunk);
        self.chunks.write().insert(chunk.id(), chunk.clone());
        chunk
    }

    pub fn get(&self, id: &ChunkId) -> Option<Arc<SharedChunk>> {
        self.chunks.read().get(id).cloned()
    }

    pub fn remove(&self, id: &ChunkId) -> Option<Arc<SharedChunk>> {
        self.chunks.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }

    /// Snapshot of every handle, ordered by chunk id.
    pub fn chunks(&self) -> Vec<Arc<SharedChunk>> {
        self.chunks.read().values().cloned().collect()
    }

    /// Chunks that can plausibly take `blocks` contiguous blocks, best fit first.
    pub fn candidates(&self, blocks: u32, remainder: bool) -> Vec<Arc<SharedChunk>> {
        let mut found: Vec<(ChunkStats, Arc<SharedChunk>)> = self
            .chunks
            .read()
            .values()
            .filter(|c| !c.is_quarantined() && !c.is_retired())
            .map(|c| (c.stats(), c.clone()))
            .filter(|(s, _)| s.free_blocks >= blocks && s.largest_free_run >= blocks)
            .filter(|(s, _)| !(remainder && s.has_remainder))
            .collect();

        found.sort_by(|(a, ca), (b, cb)| {
            a.largest_free_run
                .cmp(&b.largest_free_run)
                .then(a.free_blocks.cmp(&b.free_blocks))
                .then(ca.id().cmp(&cb.id()))
        });
        found.into_iter().map(|(_, c)| c).collect()
    }

    /// Rebuilds the catalog from every shared chunk in `store`.
    ///
    /// A chunk whose bitmap does not decode is registered quarantined so its
    /// blocks are never handed out again.
    pub async fn load<S: ChunkStore + ?Sized>(
        store: &S,
        layout: ChunkLayout,
        limit: Duration,
    ) -> FsResult<Self> {
        let catalog = Self::new(layout);
        let ids = with_timeout(limit, store.list_chunks(ChunkKind::Shared)).await?;

        for batch in ids.chunks(LOAD_BATCH) {
            let reads: Vec<_> = batch
                .iter()
                .map(|id| (*id, layout.bitmap_offset(), layout.bitmap_len()))
                .collect();
            let bitmaps = with_timeout(limit, store.read_ranges(&reads)).await?;
            for (&id, bytes) in batch.iter().zip(bitmaps) {
                match FatBitMap::decode(&layout, &bytes) {
                    Ok(fbm) => {
                        catalog.insert(id, fbm);
                    }
                    Err(e) => {
                        let chunk = catalog.insert(id, FatBitMap::new(&layout));
                        chunk.quarantine(e.msg());
                    }
                }
            }
        }

        tracing::debug!(shared = catalog.len(), "catalog loaded");
        Ok(catalog)
    }
}
