// SPDX-License-Identifier: MIT

//! Compensation for a half-finished allocation.
//!
//! The guard records every side effect of `allocate_file` as it happens. On an
//! error path the allocator calls [`Rollback::abort`]. If the allocation future
//! is dropped instead, `Drop` frees the reserved blocks synchronously and hands
//! the remaining backend work to the current Tokio runtime.

use std::collections::BTreeSet;
use std::sync::Arc;

use eossio::prelude::{ChunkId, ChunkStore};

use crate::core::allocator::catalog::{ChunkCatalog, Reservation, SharedChunk};
use crate::core::id::FileId;
use crate::core::layout::ChunkLayout;
use crate::core::meta::MetaChunkIndex;
use crate::core::utils::retry::StoreOps;

pub(crate) struct Rollback<S: ChunkStore + ?Sized + 'static> {
    ops: StoreOps<S>,
    layout: ChunkLayout,
    catalog: Arc<ChunkCatalog>,
    meta: Arc<MetaChunkIndex<S>>,
    reservations: Vec<Reservation>,
    /// Chunks created for this file and not yet visible to anyone else.
    created: Vec<ChunkId>,
    recorded: Option<FileId>,
    armed: bool,
}

/// Backend work left after the synchronous part of a rollback.
struct Pending<S: ChunkStore + ?Sized + 'static> {
    ops: StoreOps<S>,
    layout: ChunkLayout,
    meta: Arc<MetaChunkIndex<S>>,
    touched: Vec<Arc<SharedChunk>>,
    created: Vec<ChunkId>,
    recorded: Option<FileId>,
}

impl<S: ChunkStore + ?Sized + 'static> Rollback<S> {
    pub(crate) fn new(
        ops: StoreOps<S>,
        layout: ChunkLayout,
        catalog: Arc<ChunkCatalog>,
        meta: Arc<MetaChunkIndex<S>>,
    ) -> Self {
        Self {
            ops,
            layout,
            catalog,
            meta,
            reservations: Vec::new(),
            created: Vec::new(),
            recorded: None,
            armed: true,
        }
    }

    #[inline]
    pub(crate) fn track_reservation(&mut self, r: Reservation) {
        self.reservations.push(r);
    }

    #[inline]
    pub(crate) fn track_created(&mut self, id: ChunkId) {
        self.created.push(id);
    }

    /// The chunk was published; deleting it is no longer ours to do.
    pub(crate) fn forget_created(&mut self, id: &ChunkId) {
        self.created.retain(|c| c != id);
    }

    #[inline]
    pub(crate) fn track_record(&mut self, file_id: FileId) {
        self.recorded = Some(file_id);
    }

    pub(crate) fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Success: keep every side effect.
    pub(crate) fn commit(mut self) {
        self.armed = false;
    }

    pub(crate) async fn abort(mut self) {
        let pending = self.unwind();
        pending.run().await;
    }

    /// Frees reservations in memory and collects what still needs the backend.
    fn unwind(&mut self) -> Pending<S> {
        self.armed = false;

        let mut touched = BTreeSet::new();
        for r in self.reservations.drain(..) {
            let Some(chunk) = self.catalog.get(&r.chunk) else {
                continue;
            };
            match chunk.release(r.tag, r.range) {
                Ok(()) => {
                    touched.insert(r.chunk);
                }
                Err(e) => {
                    tracing::warn!(chunk = %r.chunk, tag = %r.tag, error = %e, "rollback release failed");
                }
            }
        }

        Pending {
            ops: self.ops.clone(),
            layout: self.layout,
            meta: self.meta.clone(),
            touched: touched
                .iter()
                .filter_map(|id| self.catalog.get(id))
                .collect(),
            created: std::mem::take(&mut self.created),
            recorded: self.recorded.take(),
        }
    }
}

impl<S: ChunkStore + ?Sized + 'static> Pending<S> {
    fn is_empty(&self) -> bool {
        self.touched.is_empty() && self.created.is_empty() && self.recorded.is_none()
    }

    async fn run(self) {
        if let Some(file_id) = self.recorded {
            if let Err(e) = self.meta.remove_placement(&file_id).await {
                tracing::warn!(file = %file_id, error = %e, "rollback could not drop placement record");
            }
        }
        for chunk in &self.touched {
            if let Err(e) = chunk
                .persist(&*self.ops.store, &self.layout, self.ops.timeout)
                .await
            {
                tracing::warn!(chunk = %chunk.id(), error = %e, "rollback could not persist bitmap");
            }
        }
        for id in &self.created {
            match self.ops.delete(*id).await {
                Ok(()) => tracing::debug!(chunk = %id, "rollback deleted chunk"),
                Err(e) => tracing::warn!(chunk = %id, error = %e, "rollback could not delete chunk"),
            }
        }
    }
}

impl<S: ChunkStore + ?Sized + 'static> Drop for Rollback<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pending = self.unwind();
        if pending.is_empty() {
            return;
        }
        tracing::warn!(
            touched = pending.touched.len(),
            created = pending.created.len(),
            "allocation cancelled, rolling back"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pending.run());
            }
            Err(_) => {
                tracing::error!("no runtime to finish rollback; bitmaps stay stale until next persist");
            }
        }
    }
}
