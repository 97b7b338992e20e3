// SPDX-License-Identifier: MIT

//! Offline consistency check of a volume: bitmaps, plans and the blocks
//! between them.
//!
//! Codes:
//! - `FBM001` bitmap structure (or a quarantined chunk)
//! - `PLC001` plan names a shared chunk the catalog does not know
//! - `PLC002` plan tenant range disagrees with the bitmap
//! - `PLC003` two plans claim the same blocks or the same raw chunk
//! - `ORP001` used blocks no plan references (warning)

mod tracker;
mod types;

use std::collections::{BTreeMap, BTreeSet};

use eossio::prelude::{ChunkId, ChunkKind, ChunkStore};

use crate::core::allocator::catalog::ChunkCatalog;
use crate::core::meta::MetaChunkIndex;

pub use tracker::ReachabilityTracker;
pub use types::{
    Finding, ReportDisplay, ReportDisplayOpts, Severity, VerifyOptions, VerifyPhases, VerifyReport,
};

/// Full check with default options.
pub fn verify_volume<S: ChunkStore + ?Sized>(
    catalog: &ChunkCatalog,
    index: &MetaChunkIndex<S>,
) -> VerifyReport {
    verify_volume_with(catalog, index, &VerifyOptions::default())
}

pub fn verify_volume_with<S: ChunkStore + ?Sized>(
    catalog: &ChunkCatalog,
    index: &MetaChunkIndex<S>,
    opts: &VerifyOptions,
) -> VerifyReport {
    let mut rep = VerifyReport::default();
    let chunks = catalog.chunks();
    let plans = index.placements();

    rep.push(Finding::info(
        "SUM001",
        format!("{} shared chunks, {} placements", chunks.len(), plans.len()),
    ));

    if opts.phases.contains(VerifyPhases::BITMAPS) {
        for chunk in &chunks {
            if chunk.is_quarantined() {
                rep.push(Finding::err(
                    "FBM001",
                    format!("chunk {} is quarantined", chunk.id()),
                ));
                continue;
            }
            if let Err(e) = chunk.with_bitmap(|fbm| fbm.verify()) {
                rep.push(Finding::err("FBM001", format!("chunk {}: {e}", chunk.id())));
            }
        }
    }

    let walk_plans = opts
        .phases
        .intersects(VerifyPhases::PLACEMENTS | VerifyPhases::ORPHANS);
    if !walk_plans {
        return rep;
    }

    let mut reach: BTreeMap<ChunkId, ReachabilityTracker> = chunks
        .iter()
        .map(|c| {
            let blocks = c.with_bitmap(|fbm| fbm.data_blocks());
            (c.id(), ReachabilityTracker::new(blocks))
        })
        .collect();
    let mut raw_owners: BTreeSet<ChunkId> = BTreeSet::new();
    let placements = opts.phases.contains(VerifyPhases::PLACEMENTS);

    for plan in &plans {
        let file = plan.file_id;
        for entry in &plan.entries {
            match entry.kind {
                ChunkKind::Raw => {
                    if !raw_owners.insert(entry.chunk_id) && placements {
                        rep.push(Finding::err(
                            "PLC003",
                            format!("raw chunk {} claimed twice (file {file})", entry.chunk_id),
                        ));
                    }
                }
                ChunkKind::Shared => {
                    let Some(chunk) = catalog.get(&entry.chunk_id) else {
                        if placements {
                            rep.push(Finding::err(
                                "PLC001",
                                format!("file {file} references unknown chunk {}", entry.chunk_id),
                            ));
                        }
                        continue;
                    };
                    if placements && !chunk.is_quarantined() {
                        let held = entry
                            .tenant
                            .and_then(|tag| chunk.with_bitmap(|fbm| fbm.tenant_range(tag)));
                        if held != Some(entry.blocks) {
                            rep.push(Finding::err(
                                "PLC002",
                                format!(
                                    "file {file} expects {} in chunk {}, bitmap holds {}",
                                    entry.blocks,
                                    entry.chunk_id,
                                    held.map_or_else(|| "nothing".to_string(), |r| r.to_string())
                                ),
                            ));
                        }
                    }
                    if let Some(t) = reach.get_mut(&entry.chunk_id) {
                        let dup = t.mark_range(entry.blocks);
                        if dup > 0 && placements {
                            rep.push(Finding::err(
                                "PLC003",
                                format!(
                                    "file {file} overlaps {dup} blocks of another plan in chunk {}",
                                    entry.chunk_id
                                ),
                            ));
                        }
                    }
                }
                ChunkKind::Meta => {
                    if placements {
                        rep.push(Finding::err(
                            "PLC001",
                            format!("file {file} references meta chunk {}", entry.chunk_id),
                        ));
                    }
                }
            }
        }
    }

    if opts.phases.contains(VerifyPhases::ORPHANS) {
        for chunk in chunks.iter().filter(|c| !c.is_quarantined()) {
            let Some(t) = reach.get(&chunk.id()) else {
                continue;
            };
            let (count, sample) = chunk.with_bitmap(|fbm| {
                let used = fbm.used_bits();
                let mut sample = Vec::new();
                t.for_each_orphan(used, opts.orphan_sample, |b| sample.push(b));
                (t.count_orphans(used), sample)
            });
            if count > 0 {
                rep.push(Finding::warn(
                    "ORP001",
                    format!(
                        "chunk {}: {count} used blocks unreferenced (first: {sample:?})",
                        chunk.id()
                    ),
                ));
            }
        }
    }

    rep
}
