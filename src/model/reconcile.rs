//! Patching two records of the same content from each other.
//!
//! Two copies of a file usually carry two saved-info records.  When each one
//! lost different slots to read errors, together they may still be whole.

use super::{RedundancyModel, Row};

impl RedundancyModel {
    /// Exchange knowledge with `other`, which must describe equivalent content.
    ///
    /// A side without checksums adopts the other's.  For each row of matching
    /// length every present slot fills the corresponding unreadable slot on
    /// the other side, in both directions.  A side with no rows at all
    /// adopts the other's rows.  Returns true if either side changed.
    pub fn improve_this_and_other(&mut self, other: &mut RedundancyModel) -> bool {
        if self.file_length != other.file_length {
            tracing::debug!(
                this = self.file_length,
                other = other.file_length,
                "records describe different lengths, not reconciling"
            );
            return false;
        }

        let mut changed = false;

        if self.checksums.is_empty() && !other.checksums.is_empty() {
            self.checksums = other.checksums.clone();
            changed = true;
        } else if other.checksums.is_empty() && !self.checksums.is_empty() {
            other.checksums = self.checksums.clone();
            changed = true;
        }

        if self.rows.is_empty() && !other.rows.is_empty() {
            self.rows = other.rows.clone();
            return true;
        }
        if other.rows.is_empty() && !self.rows.is_empty() {
            other.rows = self.rows.clone();
            return true;
        }

        for (mine, theirs) in self.rows.iter_mut().zip(other.rows.iter_mut()) {
            if mine.len() == theirs.len() {
                changed |= fill_gaps(mine, theirs);
            }
        }
        changed
    }
}

fn fill_gaps(a: &mut Row, b: &mut Row) -> bool {
    let mut changed = false;
    for (x, y) in a.slots_mut().iter_mut().zip(b.slots_mut().iter_mut()) {
        if x.is_none() {
            if let Some(present) = y.as_ref() {
                *x = Some(present.clone());
                changed = true;
            }
        } else if y.is_none() {
            if let Some(present) = x.as_ref() {
                *y = Some(present.clone());
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, HeapPool, BLOCK_SIZE};
    use crate::sizing::RowSizing;
    use chrono::{DateTime, Utc};

    fn encoded(len_blocks: u64) -> RedundancyModel {
        let ts = DateTime::<Utc>::from_timestamp(1_600_000_000, 0).unwrap();
        let sizing = RowSizing { primary: Some(4), secondary: Some(5) };
        let mut m = RedundancyModel::with_sizing(len_blocks * BLOCK_SIZE as u64, ts, sizing, &HeapPool);
        for i in 0..len_blocks {
            m.observe_for_encoding(&Block::from_slice(&[i as u8 + 1; 64]), i);
        }
        m
    }

    #[test]
    fn disjoint_losses_are_patched_both_ways() {
        let mut a = encoded(20);
        let mut b = a.clone();
        a.rows_mut()[0].mark_unreadable(1);
        a.rows_mut()[1].mark_unreadable(4);
        b.rows_mut()[0].mark_unreadable(3);
        b.rows_mut()[1].mark_unreadable(0);

        assert!(a.improve_this_and_other(&mut b));
        assert!(!a.needs_rebuild());
        assert!(!b.needs_rebuild());
        assert_eq!(a.rows(), b.rows());
    }

    #[test]
    fn shared_loss_stays_unreadable() {
        let mut a = encoded(20);
        let mut b = a.clone();
        a.rows_mut()[0].mark_unreadable(2);
        b.rows_mut()[0].mark_unreadable(2);
        assert!(!a.improve_this_and_other(&mut b));
        assert!(a.needs_rebuild() && b.needs_rebuild());
    }

    #[test]
    fn missing_checksums_are_adopted() {
        let mut a = encoded(8);
        let mut b = a.clone();
        b.checksums_mut().clear();
        assert!(a.improve_this_and_other(&mut b));
        assert_eq!(a.checksums(), b.checksums());
    }

    #[test]
    fn rowless_side_adopts_rows() {
        let mut a = encoded(8);
        let mut b = RedundancyModel::from_parts(a.file_length(), a.timestamp(), Vec::new(), a.checksums().to_vec());
        assert!(b.improve_this_and_other(&mut a));
        assert_eq!(a.rows(), b.rows());
    }

    #[test]
    fn different_lengths_are_left_alone() {
        let mut a = encoded(8);
        let mut b = encoded(9);
        b.rows_mut()[0].mark_unreadable(0);
        assert!(!a.improve_this_and_other(&mut b));
        assert!(b.needs_rebuild());
    }
}
