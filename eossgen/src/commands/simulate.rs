// SPDX-License-Identifier: MIT

//! Allocation workload against an in-memory volume.

use std::sync::Arc;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use eossfs::prelude::*;
use eossio::prelude::{CountingStore, IoStats, MemChunkStore};

use crate::utils::{percent, pretty_bytes, sep_u64};

#[derive(Debug, Clone, Copy)]
pub struct SimulateArgs {
    pub files: u64,
    /// Largest file; sizes are drawn log-uniformly from `1..=max_size`.
    pub max_size: u64,
    /// Chance, after each allocation, of releasing a random live file.
    pub release_ratio: f64,
    pub seed: u64,
    pub progress: bool,
}

#[derive(Debug)]
pub struct SimReport {
    pub allocated: u64,
    pub released: u64,
    pub live_files: usize,
    pub live_bytes: u64,
    pub raw_chunks: usize,
    pub shared_chunks: usize,
    pub meta_chunks: usize,
    pub stats: AllocatorStats,
    pub io: IoStats,
    pub chunk_size: u64,
    pub verify: VerifyReport,
}

impl SimReport {
    /// Bytes of every chunk in the store.
    pub fn footprint(&self) -> u64 {
        (self.raw_chunks + self.shared_chunks + self.meta_chunks) as u64 * self.chunk_size
    }
}

fn draw_size(rng: &mut StdRng, max: u64) -> u64 {
    let hi = (max.max(1) as f64).ln();
    let size = rng.random_range(0.0..=hi).exp().round() as u64;
    size.clamp(1, max.max(1))
}

pub async fn run(
    layout: ChunkLayout,
    options: AllocatorOptions,
    args: SimulateArgs,
) -> anyhow::Result<SimReport> {
    let store = Arc::new(CountingStore::with_align(
        MemChunkStore::new(layout.chunk_size()),
        layout.block_size() as u64,
    ));
    let root = SeededIdGenerator::new(args.seed).new_id();
    tracing::debug!(root = %root, "file ids derive from this root");
    let alloc = ChunkAllocator::new(layout, store.clone(), options)?
        .with_id_generator(Arc::new(DerivedIdGenerator::new(root)));
    let mut rng = StdRng::seed_from_u64(args.seed);

    let pb = if args.progress {
        let pb = ProgressBar::new(args.files);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.white}] {pos}/{len} files {msg}")?
                .progress_chars("█░░"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut live: Vec<PlacementPlan> = Vec::new();
    let mut released = 0u64;
    for _ in 0..args.files {
        let plan = alloc.allocate_file(draw_size(&mut rng, args.max_size)).await?;
        live.push(plan);

        if rng.random_bool(args.release_ratio.clamp(0.0, 1.0)) {
            let victim = live.swap_remove(rng.random_range(0..live.len()));
            alloc.release_file(victim.file_id, &victim).await?;
            released += 1;
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    Ok(SimReport {
        allocated: args.files,
        released,
        live_files: live.len(),
        live_bytes: live.iter().map(|p| p.byte_size).sum(),
        raw_chunks: store.inner().count_kind(ChunkKind::Raw),
        shared_chunks: store.inner().count_kind(ChunkKind::Shared),
        meta_chunks: store.inner().count_kind(ChunkKind::Meta),
        stats: alloc.stats(),
        io: store.snapshot(),
        chunk_size: layout.chunk_size(),
        verify: verify_volume(alloc.catalog(), alloc.meta()),
    })
}

pub fn print_report(r: &SimReport) {
    println!("{}", "Simulation".bold());
    println!("  files allocated : {}", sep_u64(r.allocated));
    println!("  files released  : {}", sep_u64(r.released));
    println!(
        "  live            : {} files, {}",
        sep_u64(r.live_files as u64),
        pretty_bytes(r.live_bytes)
    );
    println!(
        "  chunks          : {} raw, {} shared, {} meta",
        r.raw_chunks, r.shared_chunks, r.meta_chunks
    );
    println!(
        "  shared tenants  : {} ({} remainders, {} blocks free)",
        r.stats.tenants,
        r.stats.remainders,
        sep_u64(r.stats.free_shared_blocks)
    );
    println!(
        "  footprint       : {} ({} payload)",
        pretty_bytes(r.footprint()),
        percent(r.live_bytes, r.footprint())
    );

    println!(
        "  backend I/O     : {} creates, {} deletes, {} writes ({}, {} unaligned)",
        sep_u64(r.io.creates),
        sep_u64(r.io.deletes),
        sep_u64(r.io.writes),
        pretty_bytes(r.io.write_bytes),
        sep_u64(r.io.unaligned_writes)
    );

    let verdict = if r.verify.ok() {
        "consistent".green()
    } else {
        "INCONSISTENT".red()
    };
    println!("  check           : {verdict}");
    print!("{}", r.verify.summary());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(seed: u64) -> SimulateArgs {
        SimulateArgs {
            files: 200,
            max_size: 200 * 1024,
            release_ratio: 0.3,
            seed,
            progress: false,
        }
    }

    fn options() -> AllocatorOptions {
        AllocatorOptions {
            backoff_base: Duration::from_millis(1),
            ..AllocatorOptions::default()
        }
    }

    #[tokio::test]
    async fn test_simulation_is_consistent_and_deterministic() {
        let layout = ChunkLayout::new(64 * 1024, 4096, 1).unwrap();
        let a = run(layout, options(), args(7)).await.unwrap();
        let b = run(layout, options(), args(7)).await.unwrap();

        assert!(a.verify.ok(), "{}", a.verify);
        assert_eq!(a.allocated, 200);
        assert_eq!(a.live_files as u64, a.allocated - a.released);
        assert_eq!(a.stats.placements, a.live_files);
        assert_eq!(a.live_bytes, b.live_bytes);
        assert_eq!(a.released, b.released);
        assert!(a.footprint() >= a.live_bytes);
        assert!(a.io.creates >= (a.raw_chunks + a.shared_chunks) as u64);
        let chunks = (a.raw_chunks + a.shared_chunks + a.meta_chunks) as u64;
        assert_eq!(a.io.creates - a.io.deletes, chunks);
    }

    #[test]
    fn test_draw_size_in_range() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let s = draw_size(&mut rng, 5000);
            assert!((1..=5000).contains(&s));
        }
        assert_eq!(draw_size(&mut rng, 1), 1);
    }
}
