//! Restore engine: verify a reread of the original file against its record
//! and work out replacement data for the blocks that are missing.
//!
//! # Pass
//! `start_restore` → `observe_for_test_or_restore` for every block that could
//! be read, in increasing index order → `end_restore`.  Blocks never
//! observed (skipped indices, trailing blocks, blocks whose checksum did not
//! match) are the missing set.
//!
//! # Cancellation
//! Every accepted block is XORed back into the rows.  Once all healthy blocks
//! are cancelled out, a slot holds exactly the XOR of the missing blocks that
//! map to it.  A slot claimed by a single missing block therefore *is* that
//! block.
//!
//! # Fixed point
//! With two rows, restoring a block through one row also cancels it out of
//! the other row, which may leave a formerly shared slot with a single claim.
//! Rows are alternated until a round restores nothing.

pub mod events;

use std::collections::{BTreeMap, BTreeSet};

use crate::block::{Block, BlockPool, BLOCK_SIZE};
use crate::checksum::block_checksum;
use crate::model::RedundancyModel;
use crate::sizing::valid_len;

pub use events::{CollectingLog, NullLog, RestoreEvent, RestoreLog, TracingLog};

// ── Types ─────────────────────────────────────────────────────────────────────

/// Per-pass bookkeeping.
#[derive(Debug, Clone, Default)]
pub(crate) struct RestoreState {
    last_seen: Option<u64>,
    missing:   Vec<u64>,
}

/// Instruction to write `data` at `position` of the original file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreInfo {
    pub position:        u64,
    pub data:            Block,
    /// `data` is zero filler standing in for a block with no valid source.
    pub not_recoverable: bool,
}

impl RestoreInfo {
    pub fn block_index(&self) -> u64 {
        self.position / BLOCK_SIZE as u64
    }
}

/// Outcome of [`RedundancyModel::end_restore`].
#[derive(Debug, Clone, Default)]
pub struct RestorePlan {
    /// Sorted by position.
    pub infos:             Vec<RestoreInfo>,
    /// Bytes covered by `not_recoverable` entries.
    pub not_restored_size: u64,
    /// False when the record was found not to match the file and only
    /// testing, not restoring, took place.
    pub reliable:          bool,
}

impl RestorePlan {
    pub fn restored(&self) -> impl Iterator<Item = &RestoreInfo> {
        self.infos.iter().filter(|i| !i.not_recoverable)
    }

    pub fn unrecoverable(&self) -> impl Iterator<Item = &RestoreInfo> {
        self.infos.iter().filter(|i| i.not_recoverable)
    }

    pub fn is_clean(&self) -> bool {
        self.infos.is_empty() && self.reliable
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

impl RedundancyModel {
    /// Reset per-pass state.
    pub fn start_restore(&mut self) {
        self.pass = RestoreState::default();
    }

    /// Offer the reread content of original block `index`.
    ///
    /// Returns false when the block disagrees with its stored checksum; the
    /// rows are left untouched and the caller may offer other data for the
    /// same index.  Accepted blocks are cancelled out of every row and any
    /// indices skipped since the previous accepted block become missing.
    pub fn observe_for_test_or_restore(&mut self, block: &Block, index: u64) -> bool {
        let len = valid_len(self.file_length(), index);
        if len == 0 {
            tracing::debug!(index, "block beyond end of file rejected");
            return false;
        }
        if self.pass.last_seen.is_some_and(|last| index <= last) {
            tracing::debug!(index, "block already accepted in this pass");
            return true;
        }

        if let Some(expected) = self.checksums().get(index as usize) {
            if block_checksum(block, len) != *expected {
                return false;
            }
        }

        for row in self.rows_mut().iter_mut() {
            row.accumulate(index, block, len);
        }
        let next_expected = self.pass.last_seen.map_or(0, |l| l + 1);
        self.pass.missing.extend(next_expected..index);
        self.pass.last_seen = Some(index);
        true
    }

    /// Resolve the missing set into a [`RestorePlan`].
    pub fn end_restore(
        &mut self,
        file_label: &str,
        log:        &dyn RestoreLog,
        pool:       &dyn BlockPool,
    ) -> RestorePlan {
        let next_expected = self.pass.last_seen.map_or(0, |l| l + 1);
        let total = self.block_count();
        self.pass.missing.extend(next_expected..total);

        let mut pending: BTreeSet<u64> = std::mem::take(&mut self.pass.missing).into_iter().collect();
        let mut plan = RestorePlan { reliable: true, ..Default::default() };
        if pending.is_empty() {
            return plan;
        }

        if self.rows().is_empty() {
            log.emit(file_label, &RestoreEvent::NoRedundancy { missing: pending.len() });
        } else if let Some((row, slot)) = self.first_unexplained_slot(&pending) {
            log.emit(file_label, &RestoreEvent::RecordUnreliable { row: row + 1, slot });
            plan.reliable = false;
        } else {
            loop {
                let mut progress = false;
                for r in 0..self.rows().len() {
                    progress |= self.restore_through_row(r, &mut pending, &mut plan, file_label, log, pool);
                }
                if !progress || pending.is_empty() {
                    break;
                }
            }
        }

        for index in pending {
            let position = index * BLOCK_SIZE as u64;
            log.emit(file_label, &RestoreEvent::BlockNotRecoverable { position });
            plan.not_restored_size += valid_len(self.file_length(), index) as u64;
            plan.infos.push(RestoreInfo { position, data: pool.acquire(), not_recoverable: true });
        }
        plan.infos.sort_by_key(|i| i.position);
        plan
    }

    /// True when every slot is present and zero: each original block
    /// cancelled exactly its own contribution, so the record matches the file.
    pub fn verify_integrity_after_restore_test(&self) -> bool {
        self.rows().iter().all(|r| r.is_all_zero())
    }

    /// A present, non-zero slot that no missing block maps to.
    fn first_unexplained_slot(&self, pending: &BTreeSet<u64>) -> Option<(usize, usize)> {
        for (r, row) in self.rows().iter().enumerate() {
            let claimed: BTreeSet<usize> = pending.iter().map(|&i| row.slot_of(i)).collect();
            for (slot, content) in row.slots().iter().enumerate() {
                if claimed.contains(&slot) {
                    continue;
                }
                if content.as_ref().is_some_and(|b| !b.is_zero()) {
                    return Some((r, slot));
                }
            }
        }
        None
    }

    /// One sweep over row `r`; returns true if anything was restored.
    fn restore_through_row(
        &mut self,
        r:          usize,
        pending:    &mut BTreeSet<u64>,
        plan:       &mut RestorePlan,
        file_label: &str,
        log:        &dyn RestoreLog,
        pool:       &dyn BlockPool,
    ) -> bool {
        let mut claims: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
        {
            let row = &self.rows()[r];
            for &index in pending.iter() {
                claims.entry(row.slot_of(index)).or_default().push(index);
            }
        }

        let mut progress = false;
        for (slot, indices) in claims {
            let &[index] = indices.as_slice() else { continue };
            let Some(content) = self.rows()[r].get(slot) else { continue };

            let len = valid_len(self.file_length(), index);
            let position = index * BLOCK_SIZE as u64;
            let mut data = pool.acquire();
            data.copy_from(content);

            let tail_clean = data[len..].iter().all(|&b| b == 0);
            let sum_ok = self
                .checksums()
                .get(index as usize)
                .map_or(true, |expected| block_checksum(&data, len) == *expected);
            if !(tail_clean && sum_ok) {
                log.emit(file_label, &RestoreEvent::ChecksumRejected { position, row: r + 1 });
                pool.release(data);
                continue;
            }

            for row in self.rows_mut().iter_mut() {
                row.accumulate(index, &data, len);
            }
            pending.remove(&index);
            log.emit(file_label, &RestoreEvent::BlockRestored { position, row: r + 1 });
            plan.infos.push(RestoreInfo { position, data, not_recoverable: false });
            progress = true;
        }
        progress
    }
}
