// SPDX-License-Identifier: MIT

//! Bitmap operations on byte slices.
//!
//! Shared by the FatBitMap occupancy bitset and the checker's reachability
//! tracking.

/// Extension trait for bitmap operations on byte slices.
///
/// Bit ordering is little-endian within bytes: bit 0 is the LSB of byte 0,
/// bit 8 the LSB of byte 1.
pub trait BitmapOps {
    /// Sets or clears a bit. Out-of-range bits are ignored.
    fn set_bit(&mut self, bit: usize, value: bool);

    /// Returns `false` for out-of-range bits.
    fn get_bit(&self, bit: usize) -> bool;

    /// Sets or clears every bit of `[start, end)`.
    fn set_range(&mut self, start: usize, end: usize, value: bool);

    /// Counts set bits in `[start, end)`.
    fn count_ones_in_range(&self, start: usize, end: usize) -> usize;

    /// First clear bit in `[start, end)`.
    fn find_first_zero(&self, start: usize, end: usize) -> Option<usize>;

    /// First set bit in `[start, end)`.
    fn find_first_one(&self, start: usize, end: usize) -> Option<usize>;

    fn count_ones(&self) -> usize;
}

/// Bytes needed to hold `bits` bits.
#[inline]
pub const fn bitmap_bytes(bits: usize) -> usize {
    bits.div_ceil(8)
}

impl BitmapOps for [u8] {
    #[inline]
    fn set_bit(&mut self, bit: usize, value: bool) {
        if let Some(byte) = self.get_mut(bit / 8) {
            let mask = 1u8 << (bit % 8);
            if value {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
    }

    #[inline]
    fn get_bit(&self, bit: usize) -> bool {
        self.get(bit / 8)
            .is_some_and(|b| (b & (1 << (bit % 8))) != 0)
    }

    fn set_range(&mut self, start: usize, end: usize, value: bool) {
        let end = end.min(self.len() * 8);
        let mut bit = start;
        while bit < end {
            // Whole bytes at once when aligned
            if bit % 8 == 0 && bit + 8 <= end {
                self[bit / 8] = if value { 0xFF } else { 0x00 };
                bit += 8;
            } else {
                self.set_bit(bit, value);
                bit += 1;
            }
        }
    }

    fn count_ones_in_range(&self, start: usize, end: usize) -> usize {
        (start..end.min(self.len() * 8))
            .filter(|&i| self.get_bit(i))
            .count()
    }

    fn find_first_zero(&self, start: usize, end: usize) -> Option<usize> {
        scan(self, start, end, 0xFF, false)
    }

    fn find_first_one(&self, start: usize, end: usize) -> Option<usize> {
        scan(self, start, end, 0x00, true)
    }

    fn count_ones(&self) -> usize {
        self.iter().map(|b| b.count_ones() as usize).sum()
    }
}

/// Linear scan for the first bit equal to `want`, skipping bytes equal to `skip`.
fn scan(bits: &[u8], start: usize, end: usize, skip: u8, want: bool) -> Option<usize> {
    let end = end.min(bits.len() * 8);
    let mut bit = start;
    while bit < end {
        if bit % 8 == 0 && bits[bit / 8] == skip {
            bit += 8;
            continue;
        }
        if bits.get_bit(bit) == want {
            return Some(bit);
        }
        bit += 1;
    }
    None
}
