// SPDX-License-Identifier: MIT

//! Directory records and placement plans, persisted in meta chunks.
//!
//! The log is append-only. In-memory maps are the replayed view; every
//! mutation is written to the backend before the map changes, so a
//! successful call is durable.

pub mod record;

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use eossio::prelude::{ChunkId, ChunkKind, ChunkStore};

use crate::core::allocator::PlacementPlan;
use crate::core::allocator::plan::{PLAN_ENTRY_LEN, PLAN_HEADER_LEN, PlanAssembler};
use crate::core::errors::{FsError, FsResult};
use crate::core::id::{FileId, ID_LENGTH};
use crate::core::layout::ChunkLayout;
use crate::core::utils::retry::StoreOps;

use record::*;

/// Longest accepted directory entry name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// What a directory entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirTarget {
    File(FileId),
    /// Meta chunk holding the subdirectory's records.
    Subdir(ChunkId),
}

impl DirTarget {
    fn encode(&self) -> [u8; ID_LENGTH + 1] {
        let mut out = [0u8; ID_LENGTH + 1];
        let (tag, bytes) = match self {
            DirTarget::File(id) => (1, id.as_bytes()),
            DirTarget::Subdir(id) => (2, id.as_bytes()),
        };
        out[0] = tag;
        out[1..].copy_from_slice(bytes);
        out
    }

    fn decode(body: &[u8]) -> FsResult<Self> {
        let (&tag, rest) = body
            .split_first()
            .ok_or(FsError::Meta("empty directory target"))?;
        let bytes: [u8; ID_LENGTH] = rest
            .try_into()
            .map_err(|_| FsError::Meta("bad directory target length"))?;
        match tag {
            1 => Ok(DirTarget::File(FileId::new(bytes))),
            2 => Ok(DirTarget::Subdir(ChunkId::new(bytes))),
            _ => Err(FsError::Meta("unknown directory target")),
        }
    }
}

/// Checks a single path component.
pub fn validate_name(name: &str) -> FsResult {
    if name.is_empty() {
        return Err(FsError::InvalidRequest("empty name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::InvalidRequest("name longer than 255 bytes"));
    }
    if name.contains(['/', '\0']) {
        return Err(FsError::InvalidRequest("name contains '/' or NUL"));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct LogTail {
    chunk: Option<ChunkId>,
    offset: u64,
    next_seq: u64,
}

pub struct MetaChunkIndex<S: ChunkStore + ?Sized> {
    ops: StoreOps<S>,
    layout: ChunkLayout,
    /// Held across the append I/O so log order equals apply order.
    tail: tokio::sync::Mutex<LogTail>,
    dirs: RwLock<BTreeMap<String, DirTarget>>,
    placements: RwLock<HashMap<FileId, PlacementPlan>>,
}

impl<S: ChunkStore + ?Sized> MetaChunkIndex<S> {
    /// Empty index; the first append creates the first meta chunk.
    pub fn new(ops: StoreOps<S>, layout: ChunkLayout) -> Self {
        Self {
            ops,
            layout,
            tail: tokio::sync::Mutex::new(LogTail::default()),
            dirs: RwLock::new(BTreeMap::new()),
            placements: RwLock::new(HashMap::new()),
        }
    }

    /// Replays every meta chunk of the store, oldest first.
    pub async fn load(ops: StoreOps<S>, layout: ChunkLayout) -> FsResult<Self> {
        let mut index = Self::new(ops, layout);

        let mut ordered = Vec::new();
        for id in index.ops.list(ChunkKind::Meta).await? {
            let header: MetaChunkHeader = index.ops.read_struct(&id, 0).await?;
            let MetaChunkHeader { magic, seq } = header;
            if magic != META_CHUNK_MAGIC {
                tracing::warn!(chunk = %id, "skipping meta chunk without header");
                continue;
            }
            ordered.push((seq, id));
        }
        ordered.sort();

        let mut tail = LogTail::default();
        let mut parts = PlanAssembler::default();
        for (seq, id) in ordered {
            let bytes = index
                .ops
                .read(&id, 0, layout.chunk_size() as usize)
                .await?;
            let end = index.replay(&id, &bytes, &mut parts);
            tail = LogTail {
                chunk: Some(id),
                offset: end as u64,
                next_seq: seq + 1,
            };
        }
        *index.tail.get_mut() = tail;
        for file in parts.incomplete() {
            tracing::warn!(file = %file, "dropping placement with a torn record tail");
        }

        tracing::debug!(
            dirs = index.dirs.read().len(),
            placements = index.placements.read().len(),
            "meta index loaded"
        );
        Ok(index)
    }

    /// Applies records up to the torn tail; returns where the log ends.
    fn replay(&self, chunk: &ChunkId, bytes: &[u8], parts: &mut PlanAssembler) -> usize {
        let mut pos = META_HEADER_LEN;
        let mut applied = 0usize;
        while let Some((rec, len)) = bytes.get(pos..).and_then(decode_record) {
            if let Err(e) = self.apply(rec.kind, rec.key, rec.body, parts) {
                tracing::warn!(chunk = %chunk, offset = pos, error = %e, "skipping meta record");
            }
            pos += len;
            applied += 1;
        }
        tracing::trace!(chunk = %chunk, applied, end = pos, "meta chunk replayed");
        pos
    }

    fn apply(
        &self,
        kind: RecordKind,
        key: &[u8],
        body: &[u8],
        parts: &mut PlanAssembler,
    ) -> FsResult {
        match kind {
            RecordKind::DirEntry | RecordKind::DirRemove => {
                let name = core::str::from_utf8(key)
                    .map_err(|_| FsError::Meta("directory name is not UTF-8"))?;
                if kind == RecordKind::DirEntry {
                    let target = DirTarget::decode(body)?;
                    self.dirs.write().insert(name.to_owned(), target);
                } else {
                    self.dirs.write().remove(name);
                }
            }
            RecordKind::Placement | RecordKind::PlacementRemove => {
                let bytes: [u8; ID_LENGTH] = key
                    .try_into()
                    .map_err(|_| FsError::Meta("bad file id length"))?;
                let file_id = FileId::new(bytes);
                if kind == RecordKind::Placement {
                    if let Some(plan) = parts.push(file_id, body)? {
                        self.placements.write().insert(file_id, plan);
                    }
                } else {
                    self.placements.write().remove(&file_id);
                }
            }
        }
        Ok(())
    }

    /// Largest record body that fits an empty meta chunk next to `key_len`.
    fn max_body(&self, key_len: usize) -> usize {
        let overhead = META_HEADER_LEN + RECORD_HEADER_LEN + key_len;
        (self.layout.chunk_size() as usize).saturating_sub(overhead)
    }

    async fn append(&self, kind: RecordKind, key: &[u8], body: &[u8]) -> FsResult {
        let mut tail = self.tail.lock().await;
        self.write_record(&mut tail, kind, key, body).await?;
        self.apply(kind, key, body, &mut PlanAssembler::default())
    }

    /// Writes one record at the log tail, rolling to a new meta chunk when
    /// the current one is full.
    async fn write_record(
        &self,
        tail: &mut LogTail,
        kind: RecordKind,
        key: &[u8],
        body: &[u8],
    ) -> FsResult {
        if body.len() > self.max_body(key.len()) {
            return Err(FsError::RequestTooLarge);
        }
        let len = record_len(key, body) as u64;
        let record = encode_record(kind, key, body);

        let chunk = match tail.chunk {
            Some(id) if tail.offset + len <= self.layout.chunk_size() => id,
            _ => self.roll(tail).await?,
        };
        self.ops.write(&chunk, tail.offset, &record).await?;
        tail.offset += len;
        Ok(())
    }

    /// Starts a new meta chunk at the end of the log.
    async fn roll(&self, tail: &mut LogTail) -> FsResult<ChunkId> {
        let id = self.ops.create(ChunkKind::Meta).await?;
        let header = MetaChunkHeader {
            magic: META_CHUNK_MAGIC,
            seq: tail.next_seq,
        };
        if let Err(e) = self.ops.write_struct(&id, 0, &header).await {
            if let Err(del) = self.ops.delete(id).await {
                tracing::warn!(chunk = %id, error = %del, "could not delete unused meta chunk");
            }
            return Err(e.into());
        }
        tracing::debug!(chunk = %id, seq = tail.next_seq, "meta chunk started");
        tail.chunk = Some(id);
        tail.offset = META_HEADER_LEN as u64;
        tail.next_seq += 1;
        Ok(id)
    }

    // === directory records ===

    pub async fn put_directory_record(&self, name: &str, target: DirTarget) -> FsResult {
        validate_name(name)?;
        self.append(RecordKind::DirEntry, name.as_bytes(), &target.encode())
            .await
    }

    pub fn get(&self, name: &str) -> Option<DirTarget> {
        self.dirs.read().get(name).copied()
    }

    /// Returns whether the name existed.
    pub async fn remove_directory_record(&self, name: &str) -> FsResult<bool> {
        validate_name(name)?;
        if !self.dirs.read().contains_key(name) {
            return Ok(false);
        }
        self.append(RecordKind::DirRemove, name.as_bytes(), &[])
            .await?;
        Ok(true)
    }

    /// Every entry, ordered by name.
    pub fn directory(&self) -> Vec<(String, DirTarget)> {
        self.dirs
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    // === placements ===

    /// Records `plan`, split over as many records as it needs.
    ///
    /// Parts landing in the same meta chunk go out as one batch, and a batch
    /// is on disk before the log rolls past it. Replay only restores a plan
    /// whose every part is on disk.
    pub async fn put_placement(&self, plan: &PlacementPlan) -> FsResult {
        let key = plan.file_id.as_bytes();
        let max_body = self.max_body(key.len());
        let parts = plan.encode_parts(max_body);
        if parts.iter().any(|body| body.len() > max_body) {
            return Err(FsError::RequestTooLarge);
        }

        let mut tail = self.tail.lock().await;
        let mut batch: Vec<Vec<u8>> = Vec::new();
        let mut batch_len = 0u64;
        for body in &parts {
            let record = encode_record(RecordKind::Placement, key, body);
            let len = record.len() as u64;
            let fits = tail.chunk.is_some()
                && tail.offset + batch_len + len <= self.layout.chunk_size();
            if !fits {
                self.write_batch(&mut tail, &batch).await?;
                batch.clear();
                batch_len = 0;
                self.roll(&mut tail).await?;
            }
            batch.push(record);
            batch_len += len;
        }
        self.write_batch(&mut tail, &batch).await?;
        drop(tail);

        self.placements.write().insert(plan.file_id, plan.clone());
        Ok(())
    }

    /// Writes `records` back to back at the tail. The tail only moves once
    /// the whole batch is written.
    async fn write_batch(&self, tail: &mut LogTail, records: &[Vec<u8>]) -> FsResult {
        if records.is_empty() {
            return Ok(());
        }
        let Some(chunk) = tail.chunk else {
            return Err(FsError::Meta("no meta chunk to append to"));
        };
        let mut offset = tail.offset;
        let writes: Vec<(ChunkId, u64, &[u8])> = records
            .iter()
            .map(|r| {
                let at = offset;
                offset += r.len() as u64;
                (chunk, at, r.as_slice())
            })
            .collect();
        self.ops.write_ranges(&writes).await?;
        tail.offset = offset;
        Ok(())
    }

    /// Whether a plan entry fits a meta chunk at all.
    pub fn can_hold_plans(&self) -> bool {
        self.max_body(ID_LENGTH) >= PLAN_HEADER_LEN + PLAN_ENTRY_LEN
    }

    pub fn placement(&self, file_id: &FileId) -> Option<PlacementPlan> {
        self.placements.read().get(file_id).cloned()
    }

    /// Returns whether a plan was recorded for `file_id`.
    pub async fn remove_placement(&self, file_id: &FileId) -> FsResult<bool> {
        if !self.placements.read().contains_key(file_id) {
            return Ok(false);
        }
        self.append(RecordKind::PlacementRemove, file_id.as_bytes(), &[])
            .await?;
        Ok(true)
    }

    /// Every recorded plan, ordered by file id.
    pub fn placements(&self) -> Vec<PlacementPlan> {
        let mut plans: Vec<_> = self.placements.read().values().cloned().collect();
        plans.sort_by_key(|p| p.file_id);
        plans
    }

    pub fn placement_count(&self) -> usize {
        self.placements.read().len()
    }
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use eossio::prelude::{ChunkStoreExt, MemChunkStore};

    use super::*;
    use crate::core::allocator::PlacementEntry;
    use crate::core::fat_bitmap::{BlockRange, TenantTag};

    fn setup(chunk_size: u64) -> (Arc<MemChunkStore>, StoreOps<MemChunkStore>, ChunkLayout) {
        let store = Arc::new(MemChunkStore::new(chunk_size));
        let ops = StoreOps {
            store: store.clone(),
            timeout: Duration::from_secs(1),
            attempts: 2,
            backoff_base: Duration::from_millis(1),
        };
        let layout = ChunkLayout::new(chunk_size, 512, 1).unwrap();
        (store, ops, layout)
    }

    fn plan(layout: &ChunkLayout, seed: u8) -> PlacementPlan {
        let mut entry = PlacementEntry::shared(
            ChunkId::new([seed; 32]),
            TenantTag::new(1).unwrap(),
            BlockRange::new(0, 1),
            10,
        );
        entry.is_last = true;
        let plan = PlacementPlan {
            file_id: FileId::new([seed; 32]),
            byte_size: 10,
            entries: vec![entry],
        };
        plan.validate(layout).unwrap();
        plan
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("a").is_ok());
        assert!(validate_name(&"x".repeat(255)).is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(256)).is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\0b").is_err());
    }

    #[tokio::test]
    async fn test_directory_records_survive_reload() {
        let (store, ops, layout) = setup(16 * 1024);
        let index = MetaChunkIndex::new(ops.clone(), layout);

        let file = FileId::new([1; 32]);
        let sub = ChunkId::new([2; 32]);
        index
            .put_directory_record("a.txt", DirTarget::File(file))
            .await
            .unwrap();
        index
            .put_directory_record("sub", DirTarget::Subdir(sub))
            .await
            .unwrap();
        index
            .put_directory_record("gone", DirTarget::File(file))
            .await
            .unwrap();
        assert!(index.remove_directory_record("gone").await.unwrap());
        assert!(!index.remove_directory_record("gone").await.unwrap());
        assert_eq!(store.count_kind(ChunkKind::Meta), 1);

        let reloaded = MetaChunkIndex::load(ops, layout).await.unwrap();
        assert_eq!(reloaded.get("a.txt"), Some(DirTarget::File(file)));
        assert_eq!(reloaded.get("sub"), Some(DirTarget::Subdir(sub)));
        assert_eq!(reloaded.get("gone"), None);
        assert_eq!(reloaded.directory().len(), 2);
    }

    #[tokio::test]
    async fn test_log_rolls_into_new_chunks() {
        let (store, ops, layout) = setup(1024);
        let index = MetaChunkIndex::new(ops.clone(), layout);

        // 16 + 32 + 64 bytes per placement record, a few per chunk
        for seed in 1..=20u8 {
            index.put_placement(&plan(&layout, seed)).await.unwrap();
        }
        index
            .remove_placement(&FileId::new([3; 32]))
            .await
            .unwrap();
        assert!(store.count_kind(ChunkKind::Meta) > 1);

        let reloaded = MetaChunkIndex::load(ops, layout).await.unwrap();
        assert_eq!(reloaded.placement_count(), 19);
        assert_eq!(
            reloaded.placement(&FileId::new([7; 32])),
            Some(plan(&layout, 7))
        );
        assert!(reloaded.placement(&FileId::new([3; 32])).is_none());

        // appends continue after the replayed tail
        reloaded.put_placement(&plan(&layout, 99)).await.unwrap();
        let again = MetaChunkIndex::load(reloaded.ops.clone(), layout)
            .await
            .unwrap();
        assert_eq!(again.placement_count(), 20);
    }

    #[tokio::test]
    async fn test_long_plan_spans_records() {
        let (store, ops, layout) = setup(1024);
        let index = MetaChunkIndex::new(ops.clone(), layout);
        assert!(index.can_hold_plans());

        // 31 entries; a 1 KiB meta chunk holds 19 per record
        let mut big = plan(&layout, 1);
        for _ in 0..30 {
            big.entries.push(big.entries[0]);
        }
        index.put_placement(&big).await.unwrap();
        index.put_placement(&plan(&layout, 2)).await.unwrap();
        assert_eq!(store.count_kind(ChunkKind::Meta), 2);
        assert_eq!(index.placement(&big.file_id), Some(big.clone()));

        let reloaded = MetaChunkIndex::load(ops.clone(), layout).await.unwrap();
        assert_eq!(reloaded.placement(&big.file_id), Some(big.clone()));
        assert_eq!(reloaded.placement_count(), 2);

        // lose the second part: the plan is not restored half-way
        let mut second = None;
        for id in store.list_chunks(ChunkKind::Meta).await.unwrap() {
            let MetaChunkHeader { seq, .. } = store.read_struct(&id, 0).await.unwrap();
            if seq == 1 {
                second = Some(id);
            }
        }
        store
            .write_range(&second.unwrap(), META_HEADER_LEN as u64 + 20, &[0xAA])
            .await
            .unwrap();
        let torn = MetaChunkIndex::load(ops, layout).await.unwrap();
        assert!(torn.placement(&big.file_id).is_none());
    }

    #[tokio::test]
    async fn test_failed_placement_write_keeps_tail() {
        let (store, ops, layout) = setup(16 * 1024);
        let index = MetaChunkIndex::new(ops.clone(), layout);
        index.put_placement(&plan(&layout, 1)).await.unwrap();

        store.fail_next_writes(1);
        assert!(index.put_placement(&plan(&layout, 2)).await.is_err());
        assert!(index.placement(&plan(&layout, 2).file_id).is_none());

        index.put_placement(&plan(&layout, 3)).await.unwrap();
        let reloaded = MetaChunkIndex::load(ops, layout).await.unwrap();
        assert_eq!(reloaded.placement_count(), 2);
        assert!(reloaded.placement(&plan(&layout, 3).file_id).is_some());
        assert_eq!(store.count_kind(ChunkKind::Meta), 1);
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let (store, ops, layout) = setup(16 * 1024);
        let index = MetaChunkIndex::new(ops.clone(), layout);
        index.put_placement(&plan(&layout, 1)).await.unwrap();
        index.put_placement(&plan(&layout, 2)).await.unwrap();

        // corrupt the second record's body
        let chunk = store.list_chunks(ChunkKind::Meta).await.unwrap()[0];
        let second = (META_HEADER_LEN + record_len(&[0; 32], &plan(&layout, 1).encode())) as u64;
        store
            .write_range(&chunk, second + 40, &[0xAA])
            .await
            .unwrap();

        let reloaded = MetaChunkIndex::load(ops, layout).await.unwrap();
        assert_eq!(reloaded.placement_count(), 1);
        // the torn record is overwritten by the next append
        reloaded.put_placement(&plan(&layout, 3)).await.unwrap();
        let again = MetaChunkIndex::load(reloaded.ops.clone(), layout)
            .await
            .unwrap();
        assert_eq!(again.placement_count(), 2);
    }
}
