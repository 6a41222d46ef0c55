//! The redundancy record ("saved info") of one file.
//!
//! A [`RedundancyModel`] is identified by the original file's length and UTC
//! modification time.  It holds up to two XOR accumulator rows and one
//! 3-byte checksum per original block.  After encoding, slot `i` of a row of
//! length `n` is the XOR of every original block `b` with `b % n == i`.
//!
//! A slot is `None` only when it could not be read back from disk; freshly
//! built and fully decoded records have every slot present.

mod reconcile;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::block::{Block, BlockPool};
use crate::checksum::{block_checksum, BLOCK_CHECKSUM_LEN};
use crate::recovery::RestoreState;
use crate::sizing::{blocks_for_length, valid_len, RowSizing, SizingPolicy};

pub type Checksum = [u8; BLOCK_CHECKSUM_LEN];

// ── Row ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    slots: Vec<Option<Block>>,
}

impl Row {
    pub fn zeroed(len: usize, pool: &dyn BlockPool) -> Self {
        Self { slots: (0..len).map(|_| Some(pool.acquire())).collect() }
    }

    pub fn from_slots(slots: Vec<Option<Block>>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot that original block `index` contributes to.
    pub fn slot_of(&self, index: u64) -> usize {
        (index % self.slots.len() as u64) as usize
    }

    pub fn get(&self, slot: usize) -> Option<&Block> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Block> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn slots(&self) -> &[Option<Block>] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Option<Block>] {
        &mut self.slots
    }

    pub fn mark_unreadable(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = None;
        }
    }

    pub fn unreadable_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Every slot present and all-zero.
    pub fn is_all_zero(&self) -> bool {
        self.slots.iter().all(|s| s.as_ref().is_some_and(Block::is_zero))
    }

    /// XOR the first `len` bytes of `block` into the slot of `index`, if present.
    pub fn accumulate(&mut self, index: u64, block: &Block, len: usize) {
        if self.slots.is_empty() {
            return;
        }
        let slot = self.slot_of(index);
        if let Some(acc) = self.get_mut(slot) {
            acc.xor_prefix(block, len);
        }
    }

    pub fn release(self, pool: &dyn BlockPool) {
        for b in self.slots.into_iter().flatten() {
            pool.release(b);
        }
    }
}

// ── RedundancyModel ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RedundancyModel {
    file_length:       u64,
    timestamp:         DateTime<Utc>,
    rows:              Vec<Row>,
    checksums:         Vec<Checksum>,
    /// Header, trailer or checksum table did not survive intact on load.
    metadata_damaged:  bool,
    pub(crate) pass:   RestoreState,
}

/// Printable description of a record, for `info` output and reports.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub file_length:      u64,
    pub timestamp:        DateTime<Utc>,
    pub row_lengths:      Vec<usize>,
    pub checksum_count:   usize,
    pub unreadable_slots: usize,
    pub metadata_damaged: bool,
    pub overhead_bytes:   u64,
}

impl RedundancyModel {
    /// Fresh, zeroed record for a file about to be encoded.
    pub fn new(
        file_length: u64,
        timestamp:   DateTime<Utc>,
        policy:      &SizingPolicy,
        pool:        &dyn BlockPool,
    ) -> Self {
        Self::with_sizing(file_length, timestamp, RowSizing::for_length(file_length, policy), pool)
    }

    /// Fresh record with explicit row lengths.
    pub fn with_sizing(
        file_length: u64,
        timestamp:   DateTime<Utc>,
        sizing:      RowSizing,
        pool:        &dyn BlockPool,
    ) -> Self {
        let rows = [sizing.primary, sizing.secondary]
            .into_iter()
            .flatten()
            .filter(|&n| n > 0)
            .map(|n| Row::zeroed(n as usize, pool))
            .collect();
        Self::from_parts(file_length, timestamp, rows, Vec::new())
    }

    /// The "no usable record" value.
    pub fn empty() -> Self {
        Self::from_parts(0, DateTime::<Utc>::default(), Vec::new(), Vec::new())
    }

    pub(crate) fn from_parts(
        file_length: u64,
        timestamp:   DateTime<Utc>,
        rows:        Vec<Row>,
        checksums:   Vec<Checksum>,
    ) -> Self {
        Self {
            file_length,
            timestamp,
            rows,
            checksums,
            metadata_damaged: false,
            pass: RestoreState::default(),
        }
    }

    pub(crate) fn mark_metadata_damaged(&mut self) {
        self.metadata_damaged = true;
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub(crate) fn rows_mut(&mut self) -> &mut Vec<Row> {
        &mut self.rows
    }

    pub fn primary_row(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn secondary_row(&self) -> Option<&Row> {
        self.rows.get(1)
    }

    pub fn checksums(&self) -> &[Checksum] {
        &self.checksums
    }

    pub(crate) fn checksums_mut(&mut self) -> &mut Vec<Checksum> {
        &mut self.checksums
    }

    /// Number of original blocks the record describes.
    pub fn block_count(&self) -> u64 {
        blocks_for_length(self.file_length)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.checksums.is_empty()
    }

    /// True if any row slot was unreadable when the record was loaded.
    pub fn has_unreadable_slots(&self) -> bool {
        self.rows.iter().any(|r| r.unreadable_slots() > 0)
    }

    /// True if the stored header, trailer or checksum table disagreed with
    /// the rest of the record when it was loaded.
    pub fn metadata_damaged(&self) -> bool {
        self.metadata_damaged
    }

    /// The record on disk should be written again: a slot is missing or its
    /// metadata was damaged.
    pub fn needs_rebuild(&self) -> bool {
        self.has_unreadable_slots() || self.metadata_damaged
    }

    /// True when this record was made for a file of this length and
    /// modification time (within `tolerance`).
    pub fn describes(&self, file_length: u64, timestamp: DateTime<Utc>, tolerance: Duration) -> bool {
        self.file_length == file_length && (self.timestamp - timestamp).abs() <= tolerance
    }

    pub fn summary(&self) -> RecordSummary {
        let row_lengths: Vec<usize> = self.rows.iter().map(Row::len).collect();
        let slots: u64 = row_lengths.iter().map(|&n| n as u64).sum();
        RecordSummary {
            file_length:      self.file_length,
            timestamp:        self.timestamp,
            checksum_count:   self.checksums.len(),
            unreadable_slots: self.rows.iter().map(Row::unreadable_slots).sum(),
            metadata_damaged: self.metadata_damaged,
            overhead_bytes:   slots * crate::block::BLOCK_SIZE as u64
                + (self.checksums.len() * BLOCK_CHECKSUM_LEN) as u64,
            row_lengths,
        }
    }

    // ── Encode path ───────────────────────────────────────────────────────────

    /// Fold original block `index` into every row and record its checksum.
    ///
    /// Blocks are expected in increasing order from 0.  Only the valid prefix
    /// of a short final block is used.
    pub fn observe_for_encoding(&mut self, block: &Block, index: u64) {
        let len = valid_len(self.file_length, index);
        if len == 0 {
            tracing::debug!(index, "block beyond end of file ignored");
            return;
        }
        for row in &mut self.rows {
            row.accumulate(index, block, len);
        }
        let i = index as usize;
        if self.checksums.len() <= i {
            self.checksums.resize(i + 1, [0u8; BLOCK_CHECKSUM_LEN]);
        }
        self.checksums[i] = block_checksum(block, len);
    }

    /// Return every row block to `pool`.
    pub fn release(self, pool: &dyn BlockPool) {
        for row in self.rows {
            row.release(pool);
        }
    }
}
