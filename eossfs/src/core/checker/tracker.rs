// SPDX-License-Identifier: MIT

//! Reachability of data blocks inside one shared chunk.
//!
//! Every placement plan marks the blocks it references. Whatever the FatBitMap
//! reports as used but no plan marked is an orphan.

use crate::core::fat_bitmap::BlockRange;
use crate::core::utils::bitmap::{BitmapOps, bitmap_bytes};

/// One bit per data block.
#[derive(Debug, Clone)]
pub struct ReachabilityTracker {
    bits: Vec<u8>,
    blocks: usize,
}

impl ReachabilityTracker {
    pub fn new(blocks: u32) -> Self {
        Self {
            bits: vec![0u8; bitmap_bytes(blocks as usize)],
            blocks: blocks as usize,
        }
    }

    #[inline]
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    #[inline]
    pub fn is_marked(&self, block: u32) -> bool {
        (block as usize) < self.blocks && self.bits.get_bit(block as usize)
    }

    /// Marks `range`, clipped to the tracked blocks.
    ///
    /// Returns how many blocks of the range were already marked.
    pub fn mark_range(&mut self, range: BlockRange) -> usize {
        let start = (range.start as usize).min(self.blocks);
        let end = (range.end() as usize).min(self.blocks);
        if start >= end {
            return 0;
        }
        let seen = self.bits.count_ones_in_range(start, end);
        self.bits.set_range(start, end, true);
        seen
    }

    pub fn marked(&self) -> usize {
        self.bits.count_ones_in_range(0, self.blocks)
    }

    /// Blocks set in `used` that were never marked.
    pub fn count_orphans(&self, used: &[u8]) -> usize {
        (0..self.blocks)
            .filter(|&b| used.get_bit(b) && !self.bits.get_bit(b))
            .count()
    }

    /// Calls `f` for the first `limit` orphan blocks, in block order.
    pub fn for_each_orphan<F>(&self, used: &[u8], limit: usize, mut f: F)
    where
        F: FnMut(u32),
    {
        (0..self.blocks)
            .filter(|&b| used.get_bit(b) && !self.bits.get_bit(b))
            .take(limit)
            .for_each(|b| f(b as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_reports_overlap() {
        let mut t = ReachabilityTracker::new(20);
        assert_eq!(t.mark_range(BlockRange::new(2, 4)), 0);
        assert_eq!(t.mark_range(BlockRange::new(5, 3)), 1);
        assert_eq!(t.marked(), 6);
        assert!(t.is_marked(7));
        assert!(!t.is_marked(8));
    }

    #[test]
    fn test_out_of_range_is_clipped() {
        let mut t = ReachabilityTracker::new(10);
        assert_eq!(t.mark_range(BlockRange::new(8, 10)), 0);
        assert_eq!(t.marked(), 2);
        assert!(!t.is_marked(100));
        assert_eq!(t.mark_range(BlockRange::new(50, 1)), 0);
    }

    #[test]
    fn test_orphans() {
        let mut t = ReachabilityTracker::new(16);
        t.mark_range(BlockRange::new(0, 4));

        // blocks 0..6 used, 4 and 5 unreferenced
        let used = [0b0011_1111u8, 0];
        assert_eq!(t.count_orphans(&used), 2);

        let mut found = Vec::new();
        t.for_each_orphan(&used, 10, |b| found.push(b));
        assert_eq!(found, vec![4, 5]);

        found.clear();
        t.for_each_orphan(&used, 1, |b| found.push(b));
        assert_eq!(found, vec![4]);
    }
}
