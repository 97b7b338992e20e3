// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::time::Duration;

use eossfs::prelude::*;
use eossio::prelude::MemChunkStore;

const MIB: u64 = 1024 * 1024;

fn quick() -> AllocatorOptions {
    AllocatorOptions {
        backoff_base: Duration::from_millis(1),
        ..AllocatorOptions::default()
    }
}

fn volume(layout: ChunkLayout) -> (Arc<MemChunkStore>, ChunkAllocator<MemChunkStore>) {
    let store = Arc::new(MemChunkStore::new(layout.chunk_size()));
    let alloc = ChunkAllocator::new(layout, store.clone(), quick()).expect("allocator");
    (store, alloc)
}

/// 64 KiB chunks of 16 blocks, 15 of them data in shared chunks.
fn small_layout() -> ChunkLayout {
    ChunkLayout::new(64 * 1024, 4096, 1).expect("layout")
}

#[tokio::test]
async fn large_file_spills_remainder_into_shared_chunk() {
    let (store, alloc) = volume(ChunkLayout::default());

    // remainders only join shared chunks that already exist
    let neighbour = alloc.allocate_file(100).await.unwrap();
    let plan = alloc.allocate_file(10 * MIB).await.unwrap();

    assert_eq!(plan.raw_count(), 2);
    assert_eq!(plan.entries.len(), 3);
    for raw in &plan.entries[..2] {
        assert_eq!(raw.kind, ChunkKind::Raw);
        assert_eq!(raw.payload_bytes, 4 * MIB);
        assert!(!raw.is_last);
    }
    let tail = plan.shared_entry().unwrap();
    assert!(tail.is_last);
    assert_eq!(tail.payload_bytes, 2 * MIB);
    assert_eq!(tail.blocks.len, 512);
    assert_eq!(tail.chunk_id, neighbour.entries[0].chunk_id);

    let chunk = alloc.catalog().get(&tail.chunk_id).unwrap();
    assert!(chunk.stats().has_remainder);
    let free_before = chunk.stats().free_blocks;

    alloc.release_file(plan.file_id, &plan).await.unwrap();
    assert_eq!(chunk.stats().free_blocks, free_before + 512);
    assert!(!chunk.stats().has_remainder);

    // the shared chunk stays, the raw chunks are gone
    assert_eq!(store.count_kind(ChunkKind::Shared), 1);
    assert_eq!(store.count_kind(ChunkKind::Raw), 0);
    assert!(alloc.meta().placement(&plan.file_id).is_none());
    assert!(verify_volume(alloc.catalog(), alloc.meta()).ok());
}

#[tokio::test]
async fn remainder_never_opens_a_shared_chunk() {
    let (store, alloc) = volume(ChunkLayout::default());

    let plan = alloc.allocate_file(10 * MIB).await.unwrap();
    assert_eq!(plan.raw_count(), 3);
    assert_eq!(plan.entries[2].payload_bytes, 2 * MIB);
    assert_eq!(store.count_kind(ChunkKind::Shared), 0);
}

#[tokio::test]
async fn tiny_file_takes_one_block() {
    let (_store, alloc) = volume(ChunkLayout::default());

    let plan = alloc.allocate_file(100).await.unwrap();
    assert_eq!(plan.entries.len(), 1);
    let e = plan.entries[0];
    assert_eq!(e.kind, ChunkKind::Shared);
    assert_eq!(e.blocks.len, 1);
    assert_eq!(e.payload_bytes, 100);
    assert!(e.is_last);
    assert!(e.tenant.is_some());
}

#[tokio::test]
async fn remainder_falls_back_to_raw_when_hosts_are_taken() {
    let layout = small_layout();
    let (store, alloc) = volume(layout);

    // 64 KiB + 20 KiB: 5-block remainder lands in the shared chunk
    let tiny = alloc.allocate_file(4096).await.unwrap();
    let first = alloc.allocate_file(84 * 1024).await.unwrap();
    assert!(first.shared_entry().is_some());
    assert_eq!(store.count_kind(ChunkKind::Shared), 1);

    // the only shared chunk already hosts a remainder
    let second = alloc.allocate_file(66 * 1024).await.unwrap();
    assert!(second.shared_entry().is_none());
    assert_eq!(second.raw_count(), 2);
    assert_eq!(second.entries[1].payload_bytes, 2 * 1024);
    assert!(second.entries[1].is_last);

    // tiny files still fit next to the remainder
    let more = alloc.allocate_file(100).await.unwrap();
    assert_eq!(more.entries[0].chunk_id, tiny.entries[0].chunk_id);
    assert!(verify_volume(alloc.catalog(), alloc.meta()).ok());
}

#[tokio::test]
async fn zero_sized_file_is_rejected() {
    let (store, alloc) = volume(small_layout());
    let err = alloc.allocate_file(0).await.unwrap_err();
    assert!(matches!(err, FsError::InvalidRequest(_)));
    assert_eq!(err.kind(), "InvalidRequest");
    assert_eq!(store.chunk_count(), 0);
}

#[tokio::test]
async fn store_and_load_round_trip() {
    let (_store, alloc) = volume(small_layout());

    let big: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let small = b"hello shared chunk".to_vec();

    let pb = alloc.store_file(&big).await.unwrap();
    let ps = alloc.store_file(&small).await.unwrap();

    assert_eq!(alloc.load_file(&pb).await.unwrap(), big);
    assert_eq!(alloc.load_file(&ps).await.unwrap(), small);
}

#[tokio::test]
async fn create_is_retried_on_transient_errors() {
    let (store, alloc) = volume(small_layout());
    store.fail_next_creates(2);

    let plan = alloc.allocate_file(100).await.unwrap();
    assert_eq!(plan.entries.len(), 1);
    assert_eq!(store.count_kind(ChunkKind::Shared), 1);
}

#[tokio::test]
async fn exhausted_create_retries_leave_nothing_behind() {
    let (store, alloc) = volume(small_layout());
    store.fail_next_creates(10);

    let err = alloc.allocate_file(100 * 1024).await.unwrap_err();
    assert_eq!(err, FsError::BackingStore(ChunkIOError::Unavailable));
    assert!(err.is_transient());
    assert_eq!(store.chunk_count(), 0);
}

#[tokio::test]
async fn failed_bitmap_write_rolls_back_new_chunk() {
    let (store, alloc) = volume(small_layout());
    store.fail_next_writes(1);

    let err = alloc.allocate_file(100).await.unwrap_err();
    assert_eq!(err, FsError::BackingStore(ChunkIOError::Unavailable));
    assert_eq!(store.count_kind(ChunkKind::Shared), 0);
    assert!(alloc.catalog().is_empty());

    // the volume is still usable
    alloc.allocate_file(100).await.unwrap();
    assert_eq!(store.count_kind(ChunkKind::Shared), 1);
}

#[tokio::test]
async fn failed_persist_releases_reservation() {
    let (_store, alloc) = volume(small_layout());
    let first = alloc.allocate_file(100).await.unwrap();
    let chunk = alloc.catalog().get(&first.entries[0].chunk_id).unwrap();
    let free = chunk.stats().free_blocks;

    alloc.store().fail_next_writes(1);
    assert!(alloc.allocate_file(3 * 4096).await.is_err());

    assert_eq!(chunk.stats().free_blocks, free);
    assert_eq!(chunk.stats().tenants, 1);
    assert_eq!(alloc.meta().placement_count(), 1);
}

#[tokio::test]
async fn backend_timeout_surfaces_as_error() {
    let layout = small_layout();
    let store = Arc::new(MemChunkStore::new(layout.chunk_size()));
    let options = AllocatorOptions {
        store_timeout: Duration::from_millis(20),
        create_attempts: 2,
        ..quick()
    };
    let alloc = ChunkAllocator::new(layout, store.clone(), options).unwrap();
    store.set_latency(Some(Duration::from_millis(200)));

    let err = alloc.allocate_file(100).await.unwrap_err();
    assert_eq!(err, FsError::BackingStore(ChunkIOError::Timeout));
    assert!(alloc.catalog().is_empty());
}

#[tokio::test]
async fn cancelled_allocation_frees_reservation() {
    let (store, alloc) = volume(small_layout());
    let first = alloc.allocate_file(100).await.unwrap();
    let chunk = alloc.catalog().get(&first.entries[0].chunk_id).unwrap();
    let free = chunk.stats().free_blocks;

    // the reservation is made, then the bitmap persist hangs
    store.set_latency(Some(Duration::from_millis(200)));
    let res = tokio::time::timeout(Duration::from_millis(30), alloc.allocate_file(4096)).await;
    assert!(res.is_err());

    // released synchronously by the dropped guard
    assert_eq!(chunk.stats().free_blocks, free);
    assert_eq!(chunk.stats().tenants, 1);
}

#[tokio::test]
async fn cancelled_allocation_deletes_created_raw_chunks() {
    let (store, alloc) = volume(small_layout());
    store.set_latency(Some(Duration::from_millis(100)));

    // first raw chunk is created, cancelled while creating the second
    let res =
        tokio::time::timeout(Duration::from_millis(150), alloc.allocate_file(3 * 64 * 1024)).await;
    assert!(res.is_err());

    // the spawned rollback deletes without latency
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.count_kind(ChunkKind::Raw), 0);
    assert_eq!(alloc.meta().placement_count(), 0);
}

#[tokio::test]
async fn reopen_restores_catalog_and_plans() {
    let layout = small_layout();
    let (store, alloc) = volume(layout);

    let a = alloc.store_file(&[1u8; 5000]).await.unwrap();
    let b = alloc.store_file(&vec![2u8; 70 * 1024]).await.unwrap();
    let c = alloc.allocate_file(300).await.unwrap();
    alloc.release_file(c.file_id, &c).await.unwrap();
    alloc
        .meta()
        .put_directory_record("a.bin", DirTarget::File(a.file_id))
        .await
        .unwrap();
    let stats = alloc.stats();
    drop(alloc);

    let reopened = ChunkAllocator::open(layout, store.clone(), quick())
        .await
        .unwrap();
    assert_eq!(reopened.stats(), stats);
    assert_eq!(reopened.meta().placement(&a.file_id), Some(a.clone()));
    assert_eq!(reopened.meta().placement(&b.file_id), Some(b.clone()));
    assert!(reopened.meta().placement(&c.file_id).is_none());
    assert_eq!(
        reopened.meta().get("a.bin"),
        Some(DirTarget::File(a.file_id))
    );
    assert_eq!(reopened.load_file(&b).await.unwrap(), vec![2u8; 70 * 1024]);
    assert!(verify_volume(reopened.catalog(), reopened.meta()).ok());

    // fresh placements do not collide with the replayed ones
    let d = reopened.allocate_file(4096).await.unwrap();
    let held = a.entries[0].blocks;
    assert!(!d.entries[0].blocks.overlaps(&held));
}

#[tokio::test]
async fn corrupt_bitmap_quarantines_chunk_on_reopen() {
    let layout = small_layout();
    let (store, alloc) = volume(layout);
    let plan = alloc.allocate_file(100).await.unwrap();
    let id = plan.entries[0].chunk_id;
    drop(alloc);

    store
        .write_range(&id, layout.bitmap_offset(), b"garbage!")
        .await
        .unwrap();

    let reopened = ChunkAllocator::open(layout, store.clone(), quick())
        .await
        .unwrap();
    assert!(reopened.catalog().get(&id).unwrap().is_quarantined());

    // new tiny files avoid the quarantined chunk
    let next = reopened.allocate_file(100).await.unwrap();
    assert_ne!(next.entries[0].chunk_id, id);

    let rep = verify_volume(reopened.catalog(), reopened.meta());
    assert!(rep.with_code("FBM001").next().is_some());
}

#[tokio::test]
async fn mismatched_store_is_a_config_error() {
    let store = Arc::new(MemChunkStore::new(MIB));
    let err = ChunkAllocator::new(ChunkLayout::default(), store, quick())
        .err()
        .unwrap();
    assert_eq!(err.kind(), "ConfigError");
}

#[tokio::test]
async fn plan_longer_than_a_meta_chunk_round_trips() {
    let layout = small_layout();
    let (store, alloc) = volume(layout);

    // more entries than one 64 KiB meta record can list
    let size = 1400 * 64 * 1024 + 100;
    let plan = alloc.allocate_file(size).await.unwrap();
    assert_eq!(plan.raw_count(), 1400);
    assert_eq!(plan.entries.len(), 1401);
    assert!(store.count_kind(ChunkKind::Meta) >= 2);

    let reopened = ChunkAllocator::open(layout, store.clone(), quick())
        .await
        .unwrap();
    assert_eq!(reopened.meta().placement(&plan.file_id), Some(plan.clone()));

    reopened.release_file(plan.file_id, &plan).await.unwrap();
    assert_eq!(store.count_kind(ChunkKind::Raw), 0);
    assert!(reopened.meta().placement(&plan.file_id).is_none());
}

#[tokio::test]
async fn unrepresentable_size_fails_before_any_chunk_is_created() {
    let (store, alloc) = volume(small_layout());
    let err = alloc.allocate_file(u64::MAX).await.unwrap_err();
    assert_eq!(err, FsError::RequestTooLarge);
    assert_eq!(store.chunk_count(), 0);
}

#[tokio::test]
async fn short_source_releases_the_plan() {
    let (store, alloc) = volume(small_layout());

    let err = alloc
        .store_from(&[5u8; 1000][..], 100 * 1024)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::InvalidRequest(_)));
    assert_eq!(alloc.meta().placement_count(), 0);
    assert_eq!(store.count_kind(ChunkKind::Raw), 0);
    assert_eq!(alloc.stats().tenants, 0);
}

#[tokio::test]
async fn streamed_file_reads_back_while_written() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (_store, alloc) = volume(small_layout());
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
    let plan = alloc.allocate_file(data.len() as u64).await.unwrap();

    let mut writer = alloc.payload_writer(&plan);
    let mut follower = writer.follow();
    let reader = tokio::spawn(async move {
        let mut out = Vec::new();
        follower.read_to_end(&mut out).await.map(|_| out)
    });

    for piece in data.chunks(4096) {
        writer.write_all(piece).await.unwrap();
        tokio::task::yield_now().await;
    }
    writer.shutdown().await.unwrap();

    assert_eq!(reader.await.unwrap().unwrap(), data);
    assert_eq!(alloc.load_file(&plan).await.unwrap(), data);
}
