// SPDX-License-Identifier: MIT

use colored::Colorize;

use eossfs::core::id::{ID_BITS, collision_probability_bits};
use eossfs::core::layout::{FAT_ENTRY_BITS, FAT_HEADER_BYTES};
use eossfs::ChunkLayout;

use crate::utils::{percent, pretty_bytes};

/// File counts of the published collision table.
pub const DEFAULT_COUNTS: [f64; 8] = [1e18, 1e24, 1e30, 1e34, 1e36, 1e37, 1e38, 1e39];

pub fn print_geometry(layout: &ChunkLayout) {
    println!("{}", "Chunk geometry".bold());
    println!("{layout}");

    let data = layout.data_blocks_per_shared_chunk() as u64;
    let fat_bytes = FAT_HEADER_BYTES + data * FAT_ENTRY_BITS / 8;
    let bitmap = layout.bitmap_len() as u64;
    println!(
        "bitmap region   : {} ({} used by the FatBitMap, {})",
        pretty_bytes(bitmap),
        pretty_bytes(fat_bytes),
        percent(fat_bytes, bitmap)
    );
    println!(
        "tiny files      : < {} (shared when <= {})",
        pretty_bytes(layout.chunk_size()),
        pretty_bytes(layout.shared_capacity_bytes())
    );
    println!(
        "shared overhead : {} of every shared chunk",
        percent(bitmap, layout.chunk_size())
    );
}

/// `(n, p)` rows for `bits`-wide identifiers.
pub fn collision_rows(bits: u32, counts: &[f64]) -> Vec<(f64, f64)> {
    counts
        .iter()
        .map(|&n| (n, collision_probability_bits(n, bits)))
        .collect()
}

pub fn print_collision_table(bits: u32, counts: &[f64]) {
    let counts = if counts.is_empty() {
        &DEFAULT_COUNTS[..]
    } else {
        counts
    };
    println!(
        "{}",
        format!("Collision probability, {bits}-bit random ids").bold()
    );
    println!("  {:>10}  {:>12}", "files", "p(collision)");
    for (n, p) in collision_rows(bits, counts) {
        let p_str = format!("{p:.3e}");
        let p_str = if p < 1e-15 {
            p_str.green()
        } else if p < 1e-3 {
            p_str.yellow()
        } else {
            p_str.red()
        };
        println!("  {:>10}  {:>12}", format!("{n:.0e}"), p_str);
    }
    if bits == ID_BITS {
        println!("  ids are never checked for uniqueness; the bound above is the accepted risk");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collision_rows_match_table() {
        let rows = collision_rows(ID_BITS, &[1e30, 1e37, 1e38]);
        assert!(rows[0].1 < 1e-16);
        assert!((rows[1].1 - 4.32e-4).abs() < 1e-5);
        assert!((rows[2].1 - 0.0423).abs() < 1e-3);
    }

    #[test]
    fn test_small_space_saturates() {
        let rows = collision_rows(32, &[1.0, 1e6]);
        assert_eq!(rows[0].1, 0.0);
        assert!(rows[1].1 > 0.99);
    }
}
