//! Row sizing heuristic.
//!
//! The primary row covers roughly `row_overhead_per_mille` of the file,
//! rounded up to whole 64 KiB units.  The secondary row is slightly longer
//! and shares as few factors with the primary as possible: two damaged blocks
//! that collide in one row then almost never collide in the other.

use crate::block::BLOCK_SIZE;

/// Tunable thresholds for [`RowSizing::for_length`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizingPolicy {
    /// Target size of one row relative to the file, in per mille.
    pub row_overhead_per_mille: u64,
    /// Row lengths are multiples of this many blocks (16 × 4 KiB = 64 KiB).
    pub alignment_blocks: u64,
    /// Offsets tried, in order, for the secondary row length.
    pub secondary_offsets: Vec<u64>,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            row_overhead_per_mille: 5,
            alignment_blocks:       16,
            secondary_offsets:      vec![17, 9, 5, 3],
        }
    }
}

/// Row lengths chosen for one file, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSizing {
    pub primary:   Option<u64>,
    pub secondary: Option<u64>,
}

impl RowSizing {
    pub const NONE: RowSizing = RowSizing { primary: None, secondary: None };

    pub fn row_count(&self) -> usize {
        self.primary.is_some() as usize + self.secondary.is_some() as usize
    }

    pub fn for_length(file_length: u64, policy: &SizingPolicy) -> Self {
        let blocks = blocks_for_length(file_length);
        if blocks == 0 {
            return Self::NONE;
        }

        let align = policy.alignment_blocks.max(1);
        let unit_bytes = align * BLOCK_SIZE as u64;
        let target = file_length / 1000 * policy.row_overhead_per_mille
            + file_length % 1000 * policy.row_overhead_per_mille / 1000;
        let units = ((target + unit_bytes - 1) / unit_bytes).max(1);
        let primary = units.saturating_mul(align);

        // Small files: every block gets a slot of its own.
        if primary >= blocks {
            return Self { primary: Some(blocks), secondary: None };
        }

        let secondary = policy
            .secondary_offsets
            .iter()
            .copied()
            .find(|&k| k > 0 && gcd(primary, k) == 1 && primary + k <= blocks)
            .or_else(|| (primary < blocks).then_some(1))
            .map(|k| primary + k);

        Self { primary: Some(primary), secondary }
    }
}

/// Number of blocks covering `file_length` bytes.
pub fn blocks_for_length(file_length: u64) -> u64 {
    (file_length + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

/// Valid bytes in block `index` of a file of `file_length` bytes.
pub fn valid_len(file_length: u64, index: u64) -> usize {
    let start = index.saturating_mul(BLOCK_SIZE as u64);
    if start >= file_length {
        0
    } else {
        (file_length - start).min(BLOCK_SIZE as u64) as usize
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
